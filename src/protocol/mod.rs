//! Packet protocol
//!
//! Everything between a typed request and the bytes on a link:
//!
//! - [`packet`] - [`FrameCodec`] framing, checksums and resynchronization
//! - [`buffer`] - big-endian payload field readers and writers
//! - [`commands`] - typed [`Request`] encoding and [`Response`] decoding
//! - [`can_forward`] - [`CanForwardingProxy`] for addressing CAN bus nodes
//!
//! # Example
//!
//! ```ignore
//! use vesc_link::protocol::{FrameCodec, Request, Response};
//!
//! let mut codec = FrameCodec::default();
//! let wire = codec.encode(&Request::GetValues.encode())?;
//!
//! for payload in codec.feed(&received)? {
//!     if let Response::Values(values) = Response::decode(&payload)? {
//!         println!("{} V", values.v_in);
//!     }
//! }
//! ```

pub mod buffer;
pub mod can_forward;
pub mod commands;
pub mod packet;

pub use buffer::{PayloadReader, PayloadWriter};
pub use can_forward::{CanForwardRoute, CanForwardingProxy};
pub use commands::{Request, Response};
pub use packet::{crc16, Checksum, CodecStats, FrameCodec};

use serde::{Deserialize, Serialize};

/// Opcode in the first byte of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommPacketId {
    FwVersion = 0,
    JumpToBootloader = 1,
    EraseNewApp = 2,
    WriteNewAppData = 3,
    GetValues = 4,
    SetDuty = 5,
    SetCurrent = 6,
    SetCurrentBrake = 7,
    SetRpm = 8,
    SetPos = 9,
    SetHandbrake = 10,
    SetDetect = 11,
    SetServoPos = 12,
    SetMcconf = 13,
    GetMcconf = 14,
    GetMcconfDefault = 15,
    SetAppconf = 16,
    GetAppconf = 17,
    GetAppconfDefault = 18,
    SamplePrint = 19,
    TerminalCmd = 20,
    Print = 21,
    RotorPosition = 22,
    ExperimentSample = 23,
    DetectMotorParam = 24,
    DetectMotorRL = 25,
    DetectMotorFluxLinkage = 26,
    DetectEncoder = 27,
    DetectHallFoc = 28,
    Reboot = 29,
    Alive = 30,
    GetDecodedPpm = 31,
    GetDecodedAdc = 32,
    GetDecodedChuk = 33,
    ForwardCan = 34,
    SetChuckData = 35,
    CustomAppData = 36,
    NrfStartPairing = 37,
    PingCan = 62,
    BmMemRead = 80,
    CanFwdFrame = 85,
}

impl CommPacketId {
    const KNOWN: [CommPacketId; 41] = [
        CommPacketId::FwVersion,
        CommPacketId::JumpToBootloader,
        CommPacketId::EraseNewApp,
        CommPacketId::WriteNewAppData,
        CommPacketId::GetValues,
        CommPacketId::SetDuty,
        CommPacketId::SetCurrent,
        CommPacketId::SetCurrentBrake,
        CommPacketId::SetRpm,
        CommPacketId::SetPos,
        CommPacketId::SetHandbrake,
        CommPacketId::SetDetect,
        CommPacketId::SetServoPos,
        CommPacketId::SetMcconf,
        CommPacketId::GetMcconf,
        CommPacketId::GetMcconfDefault,
        CommPacketId::SetAppconf,
        CommPacketId::GetAppconf,
        CommPacketId::GetAppconfDefault,
        CommPacketId::SamplePrint,
        CommPacketId::TerminalCmd,
        CommPacketId::Print,
        CommPacketId::RotorPosition,
        CommPacketId::ExperimentSample,
        CommPacketId::DetectMotorParam,
        CommPacketId::DetectMotorRL,
        CommPacketId::DetectMotorFluxLinkage,
        CommPacketId::DetectEncoder,
        CommPacketId::DetectHallFoc,
        CommPacketId::Reboot,
        CommPacketId::Alive,
        CommPacketId::GetDecodedPpm,
        CommPacketId::GetDecodedAdc,
        CommPacketId::GetDecodedChuk,
        CommPacketId::ForwardCan,
        CommPacketId::SetChuckData,
        CommPacketId::CustomAppData,
        CommPacketId::NrfStartPairing,
        CommPacketId::PingCan,
        CommPacketId::BmMemRead,
        CommPacketId::CanFwdFrame,
    ];

    /// Look up a wire opcode
    pub fn from_u8(id: u8) -> Option<Self> {
        Self::KNOWN.iter().copied().find(|known| *known as u8 == id)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Commands accepted while the firmware is in limited mode
    pub fn allowed_in_limited_mode(self) -> bool {
        self <= CommPacketId::WriteNewAppData
            || matches!(self, CommPacketId::Reboot | CommPacketId::BmMemRead)
    }
}
