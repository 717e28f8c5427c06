//! Core data types for vesc-link
//!
//! This module contains the domain data shared by the protocol, transport and
//! interface layers.
//!
//! # Main Types
//!
//! - [`ConnectionState`] - Lifecycle of the single active link
//! - [`FwVersion`] - Firmware identification reply
//! - [`McValues`] - Motor controller telemetry (`COMM_GET_VALUES`)
//! - [`FaultCode`] - Motor controller fault reported with telemetry
//! - [`CanFrame`] - Raw CAN frame
//! - [`CancelToken`] - Cooperative cancellation shared between tasks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Connection status of the active link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No link is open
    #[default]
    Disconnected,
    /// A link is being opened
    Connecting,
    /// A link is open and traffic may flow
    Connected,
    /// The link is being closed
    Disconnecting,
}

impl ConnectionState {
    /// Whether traffic may be exchanged
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

// ==================== Firmware Version ====================

/// Firmware identification returned by `COMM_FW_VERSION`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwVersion {
    /// Major version, -1 when the reply was too short
    pub major: i8,
    /// Minor version, -1 when the reply was too short
    pub minor: i8,
    /// Hardware name
    pub hw: String,
    /// 12 byte STM32 UUID, empty on old firmware
    pub uuid: Vec<u8>,
}

impl FwVersion {
    /// Whether the target answered with a usable version
    pub fn is_valid(&self) -> bool {
        self.major >= 0
    }

    /// `(major, minor)` pair for ordering
    pub fn pair(&self) -> (i8, i8) {
        (self.major, self.minor)
    }

    /// UUID formatted as uppercase hex
    pub fn uuid_string(&self) -> String {
        self.uuid.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ==================== Fault Codes ====================

/// Fault code reported by the motor controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FaultCode {
    #[default]
    None,
    OverVoltage,
    UnderVoltage,
    Drv,
    AbsOverCurrent,
    OverTempFet,
    OverTempMotor,
    GateDriverOverVoltage,
    GateDriverUnderVoltage,
    McuUnderVoltage,
    BootingFromWatchdogReset,
    EncoderSpi,
    EncoderSincosBelowMinAmplitude,
    EncoderSincosAboveMaxAmplitude,
    FlashCorruption,
    HighOffsetCurrentSensor1,
    HighOffsetCurrentSensor2,
    HighOffsetCurrentSensor3,
    UnbalancedCurrents,
    Brk,
    ResolverLot,
    ResolverDos,
    ResolverLos,
    FlashCorruptionAppCfg,
    FlashCorruptionMcCfg,
    EncoderNoMagnet,
    EncoderMagnetTooStrong,
    PhaseFilter,
    EncoderFault,
    LvOutputFault,
    /// Code not known to this library
    Unknown(i8),
}

impl FaultCode {
    const TABLE: [FaultCode; 30] = [
        FaultCode::None,
        FaultCode::OverVoltage,
        FaultCode::UnderVoltage,
        FaultCode::Drv,
        FaultCode::AbsOverCurrent,
        FaultCode::OverTempFet,
        FaultCode::OverTempMotor,
        FaultCode::GateDriverOverVoltage,
        FaultCode::GateDriverUnderVoltage,
        FaultCode::McuUnderVoltage,
        FaultCode::BootingFromWatchdogReset,
        FaultCode::EncoderSpi,
        FaultCode::EncoderSincosBelowMinAmplitude,
        FaultCode::EncoderSincosAboveMaxAmplitude,
        FaultCode::FlashCorruption,
        FaultCode::HighOffsetCurrentSensor1,
        FaultCode::HighOffsetCurrentSensor2,
        FaultCode::HighOffsetCurrentSensor3,
        FaultCode::UnbalancedCurrents,
        FaultCode::Brk,
        FaultCode::ResolverLot,
        FaultCode::ResolverDos,
        FaultCode::ResolverLos,
        FaultCode::FlashCorruptionAppCfg,
        FaultCode::FlashCorruptionMcCfg,
        FaultCode::EncoderNoMagnet,
        FaultCode::EncoderMagnetTooStrong,
        FaultCode::PhaseFilter,
        FaultCode::EncoderFault,
        FaultCode::LvOutputFault,
    ];

    /// Map a wire code to a fault
    pub fn from_wire(code: i8) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::TABLE.get(idx).copied())
            .unwrap_or(FaultCode::Unknown(code))
    }

    /// Firmware style name, e.g. `FAULT_CODE_OVER_VOLTAGE`
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::None => "FAULT_CODE_NONE",
            FaultCode::OverVoltage => "FAULT_CODE_OVER_VOLTAGE",
            FaultCode::UnderVoltage => "FAULT_CODE_UNDER_VOLTAGE",
            FaultCode::Drv => "FAULT_CODE_DRV",
            FaultCode::AbsOverCurrent => "FAULT_CODE_ABS_OVER_CURRENT",
            FaultCode::OverTempFet => "FAULT_CODE_OVER_TEMP_FET",
            FaultCode::OverTempMotor => "FAULT_CODE_OVER_TEMP_MOTOR",
            FaultCode::GateDriverOverVoltage => "FAULT_CODE_GATE_DRIVER_OVER_VOLTAGE",
            FaultCode::GateDriverUnderVoltage => "FAULT_CODE_GATE_DRIVER_UNDER_VOLTAGE",
            FaultCode::McuUnderVoltage => "FAULT_CODE_MCU_UNDER_VOLTAGE",
            FaultCode::BootingFromWatchdogReset => "FAULT_CODE_BOOTING_FROM_WATCHDOG_RESET",
            FaultCode::EncoderSpi => "FAULT_CODE_ENCODER_SPI",
            FaultCode::EncoderSincosBelowMinAmplitude => {
                "FAULT_CODE_ENCODER_SINCOS_BELOW_MIN_AMPLITUDE"
            }
            FaultCode::EncoderSincosAboveMaxAmplitude => {
                "FAULT_CODE_ENCODER_SINCOS_ABOVE_MAX_AMPLITUDE"
            }
            FaultCode::FlashCorruption => "FAULT_CODE_FLASH_CORRUPTION",
            FaultCode::HighOffsetCurrentSensor1 => "FAULT_CODE_HIGH_OFFSET_CURRENT_SENSOR_1",
            FaultCode::HighOffsetCurrentSensor2 => "FAULT_CODE_HIGH_OFFSET_CURRENT_SENSOR_2",
            FaultCode::HighOffsetCurrentSensor3 => "FAULT_CODE_HIGH_OFFSET_CURRENT_SENSOR_3",
            FaultCode::UnbalancedCurrents => "FAULT_CODE_UNBALANCED_CURRENTS",
            FaultCode::Brk => "FAULT_CODE_BRK",
            FaultCode::ResolverLot => "FAULT_CODE_RESOLVER_LOT",
            FaultCode::ResolverDos => "FAULT_CODE_RESOLVER_DOS",
            FaultCode::ResolverLos => "FAULT_CODE_RESOLVER_LOS",
            FaultCode::FlashCorruptionAppCfg => "FAULT_CODE_FLASH_CORRUPTION_APP_CFG",
            FaultCode::FlashCorruptionMcCfg => "FAULT_CODE_FLASH_CORRUPTION_MC_CFG",
            FaultCode::EncoderNoMagnet => "FAULT_CODE_ENCODER_NO_MAGNET",
            FaultCode::EncoderMagnetTooStrong => "FAULT_CODE_ENCODER_MAGNET_TOO_STRONG",
            FaultCode::PhaseFilter => "FAULT_CODE_PHASE_FILTER",
            FaultCode::EncoderFault => "FAULT_CODE_ENCODER_FAULT",
            FaultCode::LvOutputFault => "FAULT_CODE_LV_OUTPUT_FAULT",
            FaultCode::Unknown(_) => "Unknown fault",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCode::Unknown(code) => write!(f, "Unknown fault ({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

// ==================== Telemetry ====================

/// Motor controller telemetry snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McValues {
    /// MOSFET temperature (°C)
    pub temp_mos: f64,
    /// Motor temperature (°C)
    pub temp_motor: f64,
    /// Motor current (A)
    pub current_motor: f64,
    /// Input current (A)
    pub current_in: f64,
    /// D axis current (A)
    pub id: f64,
    /// Q axis current (A)
    pub iq: f64,
    /// Duty cycle, -1.0..=1.0
    pub duty_now: f64,
    /// Electrical RPM
    pub rpm: f64,
    /// Input voltage (V)
    pub v_in: f64,
    pub amp_hours: f64,
    pub amp_hours_charged: f64,
    pub watt_hours: f64,
    pub watt_hours_charged: f64,
    pub tachometer: i32,
    pub tachometer_abs: i32,
    pub fault_code: FaultCode,
    /// PID position in degrees, -1 when not reported
    pub position: f64,
    /// Controller id, 255 when not reported
    pub vesc_id: u8,
}

impl Default for McValues {
    fn default() -> Self {
        Self {
            temp_mos: 0.0,
            temp_motor: 0.0,
            current_motor: 0.0,
            current_in: 0.0,
            id: 0.0,
            iq: 0.0,
            duty_now: 0.0,
            rpm: 0.0,
            v_in: 0.0,
            amp_hours: 0.0,
            amp_hours_charged: 0.0,
            watt_hours: 0.0,
            watt_hours_charged: 0.0,
            tachometer: 0,
            tachometer_abs: 0,
            fault_code: FaultCode::None,
            position: -1.0,
            vesc_id: 255,
        }
    }
}

// ==================== CAN ====================

/// A raw CAN frame, either seen on a local bus or forwarded by the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// 11 or 29 bit identifier
    pub id: u32,
    /// Extended (29 bit) identifier
    pub extended: bool,
    /// Up to 8 data bytes
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn extended(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            extended: true,
            data: data.into(),
        }
    }
}

// ==================== Cancellation ====================

/// Cooperative cancellation flag
///
/// Clones share state. Long running jobs check [`CancelToken::is_cancelled`]
/// between discrete steps and may await [`CancelToken::cancelled`] inside a
/// `select!` to abandon an in-flight wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation was requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
