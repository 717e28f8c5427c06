//! Typed commands and replies
//!
//! [`Request`] encodes into a payload (opcode byte + arguments) and declares
//! which opcode answers it. [`Response::decode`] classifies an incoming payload
//! by its leading opcode and parses the remainder.
//!
//! Scales follow the firmware: currents are sent as `double32 * 1e3`, duty as
//! `* 1e5`, positions as `* 1e6`, and so on.

use super::buffer::{PayloadReader, PayloadWriter};
use super::CommPacketId;
use crate::error::{LinkError, Result};
use crate::types::{CanFrame, FaultCode, FwVersion, McValues};
use std::time::Duration;

/// Wii nunchuck state for `COMM_SET_CHUCK_DATA`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChuckData {
    pub js_x: u8,
    pub js_y: u8,
    pub bt_c: bool,
    pub bt_z: bool,
    pub acc_x: i16,
    pub acc_y: i16,
    pub acc_z: i16,
}

/// Outgoing command
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetFwVersion,
    GetValues,
    /// Duty cycle, -1.0..=1.0
    SetDuty(f64),
    /// Motor current (A)
    SetCurrent(f64),
    /// Brake current (A)
    SetCurrentBrake(f64),
    /// Electrical RPM
    SetRpm(i32),
    /// PID position (degrees)
    SetPos(f64),
    /// Handbrake current (A)
    SetHandbrake(f64),
    /// Rotor position display mode
    SetDetect(u8),
    /// Servo output, 0.0..=1.0
    SetServoPos(f64),
    SamplePrint {
        mode: u8,
        sample_len: u16,
        decimation: u8,
    },
    TerminalCmd(String),
    Reboot,
    SendAlive,
    GetMcconf,
    GetMcconfDefault,
    /// Serialized motor configuration
    SetMcconf(Vec<u8>),
    GetAppconf,
    GetAppconfDefault,
    /// Serialized app configuration
    SetAppconf(Vec<u8>),
    DetectMotorParam {
        current: f64,
        min_rpm: f64,
        low_duty: f64,
    },
    DetectMotorRL,
    DetectMotorFluxLinkage {
        current: f64,
        min_rpm: f64,
        low_duty: f64,
        resistance: f64,
    },
    DetectEncoder {
        current: f64,
    },
    DetectHallFoc {
        current: f64,
    },
    GetDecodedPpm,
    GetDecodedAdc,
    GetDecodedChuk,
    SetChuckData(ChuckData),
    CustomAppData(Vec<u8>),
    NrfStartPairing {
        ms: i32,
    },
    PingCan,
    /// Transmit a raw frame on the target's CAN bus
    CanFwdFrame(CanFrame),
    EraseNewApp {
        size: u32,
    },
    WriteNewAppData {
        offset: u32,
        data: Vec<u8>,
    },
    JumpToBootloader,
    /// Read back `len` bytes of the new-app buffer at `address`
    MemRead {
        address: u32,
        len: u16,
    },
}

impl Request {
    pub fn opcode(&self) -> CommPacketId {
        match self {
            Request::GetFwVersion => CommPacketId::FwVersion,
            Request::GetValues => CommPacketId::GetValues,
            Request::SetDuty(_) => CommPacketId::SetDuty,
            Request::SetCurrent(_) => CommPacketId::SetCurrent,
            Request::SetCurrentBrake(_) => CommPacketId::SetCurrentBrake,
            Request::SetRpm(_) => CommPacketId::SetRpm,
            Request::SetPos(_) => CommPacketId::SetPos,
            Request::SetHandbrake(_) => CommPacketId::SetHandbrake,
            Request::SetDetect(_) => CommPacketId::SetDetect,
            Request::SetServoPos(_) => CommPacketId::SetServoPos,
            Request::SamplePrint { .. } => CommPacketId::SamplePrint,
            Request::TerminalCmd(_) => CommPacketId::TerminalCmd,
            Request::Reboot => CommPacketId::Reboot,
            Request::SendAlive => CommPacketId::Alive,
            Request::GetMcconf => CommPacketId::GetMcconf,
            Request::GetMcconfDefault => CommPacketId::GetMcconfDefault,
            Request::SetMcconf(_) => CommPacketId::SetMcconf,
            Request::GetAppconf => CommPacketId::GetAppconf,
            Request::GetAppconfDefault => CommPacketId::GetAppconfDefault,
            Request::SetAppconf(_) => CommPacketId::SetAppconf,
            Request::DetectMotorParam { .. } => CommPacketId::DetectMotorParam,
            Request::DetectMotorRL => CommPacketId::DetectMotorRL,
            Request::DetectMotorFluxLinkage { .. } => CommPacketId::DetectMotorFluxLinkage,
            Request::DetectEncoder { .. } => CommPacketId::DetectEncoder,
            Request::DetectHallFoc { .. } => CommPacketId::DetectHallFoc,
            Request::GetDecodedPpm => CommPacketId::GetDecodedPpm,
            Request::GetDecodedAdc => CommPacketId::GetDecodedAdc,
            Request::GetDecodedChuk => CommPacketId::GetDecodedChuk,
            Request::SetChuckData(_) => CommPacketId::SetChuckData,
            Request::CustomAppData(_) => CommPacketId::CustomAppData,
            Request::NrfStartPairing { .. } => CommPacketId::NrfStartPairing,
            Request::PingCan => CommPacketId::PingCan,
            Request::CanFwdFrame(_) => CommPacketId::CanFwdFrame,
            Request::EraseNewApp { .. } => CommPacketId::EraseNewApp,
            Request::WriteNewAppData { .. } => CommPacketId::WriteNewAppData,
            Request::JumpToBootloader => CommPacketId::JumpToBootloader,
            Request::MemRead { .. } => CommPacketId::BmMemRead,
        }
    }

    /// Opcode of the reply this request waits for, if any
    ///
    /// Requests without a reply opcode are fire-and-forget.
    pub fn reply_opcode(&self) -> Option<CommPacketId> {
        match self {
            Request::GetFwVersion
            | Request::GetValues
            | Request::GetMcconf
            | Request::GetMcconfDefault
            | Request::SetMcconf(_)
            | Request::GetAppconf
            | Request::GetAppconfDefault
            | Request::SetAppconf(_)
            | Request::DetectMotorParam { .. }
            | Request::DetectMotorRL
            | Request::DetectMotorFluxLinkage { .. }
            | Request::DetectEncoder { .. }
            | Request::DetectHallFoc { .. }
            | Request::GetDecodedPpm
            | Request::GetDecodedAdc
            | Request::GetDecodedChuk
            | Request::NrfStartPairing { .. }
            | Request::PingCan
            | Request::EraseNewApp { .. }
            | Request::WriteNewAppData { .. }
            | Request::MemRead { .. } => Some(self.opcode()),
            _ => None,
        }
    }

    /// Deadline that suits the request better than the configured default
    ///
    /// Motor detection runs for seconds on the target before it answers.
    pub fn timeout_hint(&self) -> Option<Duration> {
        match self {
            Request::DetectMotorParam { .. }
            | Request::DetectMotorRL
            | Request::DetectMotorFluxLinkage { .. }
            | Request::DetectEncoder { .. }
            | Request::DetectHallFoc { .. } => Some(Duration::from_secs(30)),
            Request::NrfStartPairing { ms } => {
                Some(Duration::from_millis(u64::try_from(*ms).unwrap_or(0) + 1000))
            }
            _ => None,
        }
    }

    /// Encode into a payload
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PayloadWriter::with_opcode(self.opcode().as_u8());
        match self {
            Request::SetDuty(duty) => {
                w.put_double32(*duty, 1e5);
            }
            Request::SetCurrent(current)
            | Request::SetCurrentBrake(current)
            | Request::SetHandbrake(current) => {
                w.put_double32(*current, 1e3);
            }
            Request::SetRpm(rpm) => {
                w.put_i32(*rpm);
            }
            Request::SetPos(pos) => {
                w.put_double32(*pos, 1e6);
            }
            Request::SetDetect(mode) => {
                w.put_u8(*mode);
            }
            Request::SetServoPos(pos) => {
                w.put_double16(*pos, 1e3);
            }
            Request::SamplePrint {
                mode,
                sample_len,
                decimation,
            } => {
                w.put_u8(*mode).put_u16(*sample_len).put_u8(*decimation);
            }
            Request::TerminalCmd(cmd) => {
                w.put_slice(cmd.as_bytes());
            }
            Request::SetMcconf(data) | Request::SetAppconf(data) | Request::CustomAppData(data) => {
                w.put_slice(data);
            }
            Request::DetectMotorParam {
                current,
                min_rpm,
                low_duty,
            } => {
                w.put_double32(*current, 1e3)
                    .put_double32(*min_rpm, 1e3)
                    .put_double32(*low_duty, 1e3);
            }
            Request::DetectMotorFluxLinkage {
                current,
                min_rpm,
                low_duty,
                resistance,
            } => {
                w.put_double32(*current, 1e3)
                    .put_double32(*min_rpm, 1e3)
                    .put_double32(*low_duty, 1e3)
                    .put_double32(*resistance, 1e6);
            }
            Request::DetectEncoder { current } => {
                w.put_double16(*current, 1e3);
            }
            Request::DetectHallFoc { current } => {
                w.put_double32(*current, 1e3);
            }
            Request::SetChuckData(data) => {
                w.put_u8(data.js_x)
                    .put_u8(data.js_y)
                    .put_u8(data.bt_c as u8)
                    .put_u8(data.bt_z as u8)
                    .put_i16(data.acc_x)
                    .put_i16(data.acc_y)
                    .put_i16(data.acc_z);
            }
            Request::NrfStartPairing { ms } => {
                w.put_i32(*ms);
            }
            Request::CanFwdFrame(frame) => {
                w.put_u32(frame.id)
                    .put_u8(frame.extended as u8)
                    .put_slice(&frame.data);
            }
            Request::EraseNewApp { size } => {
                w.put_u32(*size);
            }
            Request::WriteNewAppData { offset, data } => {
                w.put_u32(*offset).put_slice(data);
            }
            Request::MemRead { address, len } => {
                w.put_u32(*address).put_u16(*len);
            }
            Request::GetFwVersion
            | Request::GetValues
            | Request::Reboot
            | Request::SendAlive
            | Request::GetMcconf
            | Request::GetMcconfDefault
            | Request::GetAppconf
            | Request::GetAppconfDefault
            | Request::DetectMotorRL
            | Request::GetDecodedPpm
            | Request::GetDecodedAdc
            | Request::GetDecodedChuk
            | Request::PingCan
            | Request::JumpToBootloader => {}
        }
        w.into_vec()
    }
}

/// Result of a nRF remote pairing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NrfPairResult {
    Started,
    Ok,
    Fail,
    Unknown(i8),
}

impl NrfPairResult {
    fn from_wire(code: i8) -> Self {
        match code {
            0 => NrfPairResult::Started,
            1 => NrfPairResult::Ok,
            2 => NrfPairResult::Fail,
            other => NrfPairResult::Unknown(other),
        }
    }
}

/// BLDC detection result
#[derive(Debug, Clone, PartialEq)]
pub struct BldcDetect {
    pub cycle_int_limit: f64,
    pub bemf_coupling_k: f64,
    pub hall_table: Vec<u8>,
    pub hall_res: u8,
}

/// Decoded incoming payload
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    FwVersion(FwVersion),
    Values(McValues),
    Print(String),
    SamplePrint(Vec<u8>),
    RotorPosition(f64),
    ExperimentSamples(Vec<f64>),
    McConf {
        default: bool,
        data: Vec<u8>,
    },
    AppConf {
        default: bool,
        data: Vec<u8>,
    },
    BldcDetect(BldcDetect),
    MotorRL {
        resistance: f64,
        inductance: f64,
    },
    FluxLinkage(f64),
    EncoderParams {
        offset: f64,
        ratio: f64,
        inverted: bool,
    },
    HallFocTable {
        table: Vec<u8>,
        result: u8,
    },
    DecodedPpm {
        value: f64,
        last_len: f64,
    },
    DecodedAdc {
        value: f64,
        voltage: f64,
        value2: f64,
        voltage2: f64,
    },
    DecodedChuk(f64),
    /// Configuration write acknowledgement
    Ack {
        opcode: CommPacketId,
        message: String,
    },
    EraseNewApp {
        ok: bool,
    },
    WriteNewAppData {
        ok: bool,
        offset: Option<u32>,
    },
    /// Ids of nodes answering a CAN ping
    PingCan(Vec<u8>),
    CanFrame(CanFrame),
    MemRead {
        address: u32,
        data: Vec<u8>,
    },
    CustomAppData(Vec<u8>),
    NrfPairing(NrfPairResult),
    Unknown {
        opcode: u8,
        data: Vec<u8>,
    },
}

impl Response {
    /// Opcode this response arrived with
    pub fn opcode(&self) -> Option<CommPacketId> {
        let id = match self {
            Response::FwVersion(_) => CommPacketId::FwVersion,
            Response::Values(_) => CommPacketId::GetValues,
            Response::Print(_) => CommPacketId::Print,
            Response::SamplePrint(_) => CommPacketId::SamplePrint,
            Response::RotorPosition(_) => CommPacketId::RotorPosition,
            Response::ExperimentSamples(_) => CommPacketId::ExperimentSample,
            Response::McConf { default: false, .. } => CommPacketId::GetMcconf,
            Response::McConf { default: true, .. } => CommPacketId::GetMcconfDefault,
            Response::AppConf { default: false, .. } => CommPacketId::GetAppconf,
            Response::AppConf { default: true, .. } => CommPacketId::GetAppconfDefault,
            Response::BldcDetect(_) => CommPacketId::DetectMotorParam,
            Response::MotorRL { .. } => CommPacketId::DetectMotorRL,
            Response::FluxLinkage(_) => CommPacketId::DetectMotorFluxLinkage,
            Response::EncoderParams { .. } => CommPacketId::DetectEncoder,
            Response::HallFocTable { .. } => CommPacketId::DetectHallFoc,
            Response::DecodedPpm { .. } => CommPacketId::GetDecodedPpm,
            Response::DecodedAdc { .. } => CommPacketId::GetDecodedAdc,
            Response::DecodedChuk(_) => CommPacketId::GetDecodedChuk,
            Response::Ack { opcode, .. } => *opcode,
            Response::EraseNewApp { .. } => CommPacketId::EraseNewApp,
            Response::WriteNewAppData { .. } => CommPacketId::WriteNewAppData,
            Response::PingCan(_) => CommPacketId::PingCan,
            Response::CanFrame(_) => CommPacketId::CanFwdFrame,
            Response::MemRead { .. } => CommPacketId::BmMemRead,
            Response::CustomAppData(_) => CommPacketId::CustomAppData,
            Response::NrfPairing(_) => CommPacketId::NrfStartPairing,
            Response::Unknown { opcode, .. } => return CommPacketId::from_u8(*opcode),
        };
        Some(id)
    }

    /// Decode a payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let Some((&opcode, body)) = payload.split_first() else {
            return Err(LinkError::Decode("empty payload".to_string()));
        };
        let Some(id) = CommPacketId::from_u8(opcode) else {
            return Ok(Response::Unknown {
                opcode,
                data: body.to_vec(),
            });
        };

        let mut r = PayloadReader::new(body);
        let response = match id {
            CommPacketId::FwVersion => Response::FwVersion(decode_fw_version(&mut r)?),
            CommPacketId::GetValues => Response::Values(decode_values(&mut r)?),
            CommPacketId::Print => Response::Print(String::from_utf8_lossy(body).into_owned()),
            CommPacketId::SamplePrint => Response::SamplePrint(body.to_vec()),
            CommPacketId::RotorPosition => Response::RotorPosition(r.get_double32(1e5)?),
            CommPacketId::ExperimentSample => {
                let mut samples = Vec::with_capacity(r.remaining() / 4);
                while r.remaining() >= 4 {
                    samples.push(r.get_double32(1e4)?);
                }
                Response::ExperimentSamples(samples)
            }
            CommPacketId::GetMcconf | CommPacketId::GetMcconfDefault => Response::McConf {
                default: id == CommPacketId::GetMcconfDefault,
                data: body.to_vec(),
            },
            CommPacketId::GetAppconf | CommPacketId::GetAppconfDefault => Response::AppConf {
                default: id == CommPacketId::GetAppconfDefault,
                data: body.to_vec(),
            },
            CommPacketId::DetectMotorParam => {
                let cycle_int_limit = r.get_double32(1e3)?;
                let bemf_coupling_k = r.get_double32(1e3)?;
                let hall_table = r.get_bytes(8)?.to_vec();
                let hall_res = r.get_u8()?;
                Response::BldcDetect(BldcDetect {
                    cycle_int_limit,
                    bemf_coupling_k,
                    hall_table,
                    hall_res,
                })
            }
            CommPacketId::DetectMotorRL => Response::MotorRL {
                resistance: r.get_double32(1e6)?,
                inductance: r.get_double32(1e3)?,
            },
            CommPacketId::DetectMotorFluxLinkage => Response::FluxLinkage(r.get_double32(1e7)?),
            CommPacketId::DetectEncoder => Response::EncoderParams {
                offset: r.get_double32(1e6)?,
                ratio: r.get_double32(1e6)?,
                inverted: r.get_i8()? != 0,
            },
            CommPacketId::DetectHallFoc => Response::HallFocTable {
                table: r.get_bytes(8)?.to_vec(),
                result: r.get_u8()?,
            },
            CommPacketId::GetDecodedPpm => Response::DecodedPpm {
                value: r.get_double32(1e6)?,
                last_len: r.get_double32(1e6)?,
            },
            CommPacketId::GetDecodedAdc => Response::DecodedAdc {
                value: r.get_double32(1e6)?,
                voltage: r.get_double32(1e6)?,
                value2: r.get_double32(1e6)?,
                voltage2: r.get_double32(1e6)?,
            },
            CommPacketId::GetDecodedChuk => Response::DecodedChuk(r.get_double32(1e6)?),
            CommPacketId::SetMcconf => Response::Ack {
                opcode: id,
                message: "MCCONF Write OK".to_string(),
            },
            CommPacketId::SetAppconf => Response::Ack {
                opcode: id,
                message: "APPCONF Write OK".to_string(),
            },
            CommPacketId::EraseNewApp => Response::EraseNewApp {
                ok: r.get_u8()? != 0,
            },
            CommPacketId::WriteNewAppData => {
                let ok = r.get_u8()? != 0;
                let offset = if r.remaining() >= 4 {
                    Some(r.get_u32()?)
                } else {
                    None
                };
                Response::WriteNewAppData { ok, offset }
            }
            CommPacketId::PingCan => Response::PingCan(body.to_vec()),
            CommPacketId::CanFwdFrame => {
                let frame_id = r.get_u32()?;
                let extended = r.get_u8()? != 0;
                Response::CanFrame(CanFrame {
                    id: frame_id,
                    extended,
                    data: r.rest().to_vec(),
                })
            }
            CommPacketId::BmMemRead => {
                let address = r.get_u32()?;
                Response::MemRead {
                    address,
                    data: r.rest().to_vec(),
                }
            }
            CommPacketId::CustomAppData => Response::CustomAppData(body.to_vec()),
            CommPacketId::NrfStartPairing => {
                Response::NrfPairing(NrfPairResult::from_wire(r.get_i8()?))
            }
            _ => Response::Unknown {
                opcode,
                data: body.to_vec(),
            },
        };
        Ok(response)
    }
}

fn decode_fw_version(r: &mut PayloadReader<'_>) -> Result<FwVersion> {
    if r.remaining() < 2 {
        return Ok(FwVersion {
            major: -1,
            minor: -1,
            hw: String::new(),
            uuid: Vec::new(),
        });
    }
    let major = r.get_i8()?;
    let minor = r.get_i8()?;
    let hw = r.get_cstring();
    let uuid = if r.remaining() >= 12 {
        r.get_bytes(12)?.to_vec()
    } else {
        Vec::new()
    };
    Ok(FwVersion {
        major,
        minor,
        hw,
        uuid,
    })
}

fn decode_values(r: &mut PayloadReader<'_>) -> Result<McValues> {
    let mut v = McValues {
        temp_mos: r.get_double16(1e1)?,
        temp_motor: r.get_double16(1e1)?,
        current_motor: r.get_double32(1e2)?,
        current_in: r.get_double32(1e2)?,
        id: r.get_double32(1e2)?,
        iq: r.get_double32(1e2)?,
        duty_now: r.get_double16(1e3)?,
        rpm: r.get_double32(1e0)?,
        v_in: r.get_double16(1e1)?,
        amp_hours: r.get_double32(1e4)?,
        amp_hours_charged: r.get_double32(1e4)?,
        watt_hours: r.get_double32(1e4)?,
        watt_hours_charged: r.get_double32(1e4)?,
        tachometer: r.get_i32()?,
        tachometer_abs: r.get_i32()?,
        fault_code: FaultCode::from_wire(r.get_i8()?),
        ..McValues::default()
    };
    if r.remaining() >= 4 {
        v.position = r.get_double32(1e6)?;
    }
    if r.remaining() >= 1 {
        v.vesc_id = r.get_u8()?;
    }
    Ok(v)
}

/// Encode a telemetry reply the way the firmware does
///
/// Used by the simulated target and by tests.
pub fn encode_values(v: &McValues) -> Vec<u8> {
    let mut w = PayloadWriter::with_opcode(CommPacketId::GetValues.as_u8());
    w.put_double16(v.temp_mos, 1e1)
        .put_double16(v.temp_motor, 1e1)
        .put_double32(v.current_motor, 1e2)
        .put_double32(v.current_in, 1e2)
        .put_double32(v.id, 1e2)
        .put_double32(v.iq, 1e2)
        .put_double16(v.duty_now, 1e3)
        .put_double32(v.rpm, 1e0)
        .put_double16(v.v_in, 1e1)
        .put_double32(v.amp_hours, 1e4)
        .put_double32(v.amp_hours_charged, 1e4)
        .put_double32(v.watt_hours, 1e4)
        .put_double32(v.watt_hours_charged, 1e4)
        .put_i32(v.tachometer)
        .put_i32(v.tachometer_abs)
        .put_i8(fault_to_wire(v.fault_code))
        .put_double32(v.position, 1e6)
        .put_u8(v.vesc_id);
    w.into_vec()
}

/// Encode a firmware version reply the way the firmware does
pub fn encode_fw_version(fw: &FwVersion) -> Vec<u8> {
    let mut w = PayloadWriter::with_opcode(CommPacketId::FwVersion.as_u8());
    w.put_i8(fw.major)
        .put_i8(fw.minor)
        .put_cstring(&fw.hw)
        .put_slice(&fw.uuid);
    w.into_vec()
}

fn fault_to_wire(code: FaultCode) -> i8 {
    match code {
        FaultCode::Unknown(raw) => raw,
        known => (0..=i8::MAX)
            .find(|&raw| FaultCode::from_wire(raw) == known)
            .unwrap_or(0),
    }
}
