//! Configuration module for vesc-link
//!
//! This module handles:
//! - Link configuration ([`LinkConfig`]): framing, command timing, per-transport
//!   settings, firmware upload and autoconnect parameters, stored as TOML
//! - Persisted connection state ([`ConnectionStore`]): last known-good
//!   endpoints and stored BLE devices, stored as JSON
//!
//! # App Data Location
//!
//! Both files default to the platform-appropriate data directory:
//! - **Linux**: `~/.local/share/dev.hxyulin.vesc-link/`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.vesc-link/`
//! - **Windows**: `%APPDATA%\dev.hxyulin.vesc-link\`
//!
//! # Example
//!
//! ```ignore
//! use vesc_link::config::{ConnectionStore, LinkConfig};
//!
//! let config = LinkConfig::load_or_default(LinkConfig::default_path()?);
//! let store = ConnectionStore::load_or_default(ConnectionStore::default_path()?);
//! ```

pub mod store;

pub use store::{ConnectionStore, KnownEndpoint, StoredBleDevice};

use crate::error::{LinkError, Result};
use crate::protocol::Checksum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.vesc-link";

/// Link configuration filename
pub const CONFIG_FILE: &str = "link.toml";

/// Connection store filename
pub const STORE_FILE: &str = "connections.json";

/// TCP port of the motor controller's network bridge
pub const DEFAULT_TCP_PORT: u16 = 65102;

/// TCP port of the relay hub
pub const DEFAULT_HUB_PORT: u16 = 65101;

/// Offset of the bootloader region in the new-app buffer (128 KiB * 3)
pub const BOOTLOADER_OFFSET: u32 = 128 * 1024 * 3;

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir()
        .ok_or_else(|| LinkError::Config("Could not determine app data directory".to_string()))?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            LinkError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

// ==================== Link Config ====================

/// Complete link configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ble: BleConfig,
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub autoconnect: AutoconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl LinkConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        Ok(ensure_app_data_dir()?.join(CONFIG_FILE))
    }

    /// Load a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Failed to parse config {:?}: {}", path, e)))
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load link config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LinkError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| LinkError::Serialization(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| LinkError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }
}

// ==================== Framing ====================

/// Frame codec settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Checksum algorithm
    #[serde(default)]
    pub checksum: Checksum,

    /// Largest accepted payload
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Hard cap on undecoded buffered bytes
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,

    /// Partial frames idle longer than this are discarded
    #[serde(default = "default_byte_timeout_ms")]
    pub byte_timeout_ms: u64,

    /// Consecutive checksum failures before a quality warning
    #[serde(default = "default_checksum_warning_threshold")]
    pub checksum_warning_threshold: u32,
}

fn default_max_payload_len() -> usize {
    128 * 1024
}

fn default_buffer_cap() -> usize {
    512 * 1024
}

fn default_byte_timeout_ms() -> u64 {
    500
}

fn default_checksum_warning_threshold() -> u32 {
    10
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            checksum: Checksum::default(),
            max_payload_len: default_max_payload_len(),
            buffer_cap: default_buffer_cap(),
            byte_timeout_ms: default_byte_timeout_ms(),
            checksum_warning_threshold: default_checksum_warning_threshold(),
        }
    }
}

// ==================== Commands ====================

/// Firmware version accepted without limited mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub major: i8,
    pub minor: i8,
}

impl FirmwareRelease {
    pub const fn new(major: i8, minor: i8) -> Self {
        Self { major, minor }
    }
}

/// Command dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Deadline for requests that expect a reply
    #[serde(default = "default_command_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Requests waiting behind the outstanding one before new ones are refused
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Poll the firmware version after connecting
    #[serde(default = "default_true")]
    pub poll_fw_version: bool,

    /// Interval between firmware version polls
    #[serde(default = "default_fw_poll_interval_ms")]
    pub fw_poll_interval_ms: u64,

    /// Unanswered polls before the link is dropped
    #[serde(default = "default_fw_poll_retries")]
    pub fw_poll_retries: u32,

    /// Supported firmware releases; empty accepts every version
    #[serde(default)]
    pub supported_firmwares: Vec<FirmwareRelease>,

    /// Firmware at or above this release can be updated in limited mode
    #[serde(default = "default_min_limited_release")]
    pub min_limited_release: FirmwareRelease,

    /// Housekeeping tick of the interface worker
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_queue_limit() -> usize {
    64
}

fn default_fw_poll_interval_ms() -> u64 {
    80
}

fn default_fw_poll_retries() -> u32 {
    25
}

fn default_min_limited_release() -> FirmwareRelease {
    FirmwareRelease::new(1, 1)
}

fn default_tick_interval_ms() -> u64 {
    20
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout_ms(),
            queue_limit: default_queue_limit(),
            poll_fw_version: true,
            fw_poll_interval_ms: default_fw_poll_interval_ms(),
            fw_poll_retries: default_fw_poll_retries(),
            supported_firmwares: Vec::new(),
            min_limited_release: default_min_limited_release(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl CommandConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn fw_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fw_poll_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

// ==================== Transports ====================

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Assert RTS and pulse DTR after opening
    #[serde(default = "default_true")]
    pub pulse_dtr: bool,
}

fn default_baud_rate() -> u32 {
    115_200
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            pulse_dtr: true,
        }
    }
}

/// TCP, TCP hub and UDP settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Time allowed for the hub to answer a login
    #[serde(default = "default_connect_timeout_ms")]
    pub hub_login_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            hub_login_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn hub_login_timeout(&self) -> Duration {
        Duration::from_millis(self.hub_login_timeout_ms)
    }
}

/// Bluetooth LE settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Largest characteristic write
    #[serde(default = "default_ble_chunk")]
    pub write_chunk: usize,

    /// Watchdog for connect, discovery and enabling notifications
    #[serde(default = "default_ble_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_ble_chunk() -> usize {
    20
}

fn default_ble_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            write_chunk: default_ble_chunk(),
            connect_timeout_ms: default_ble_connect_timeout_ms(),
        }
    }
}

impl BleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// CAN bus settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfig {
    /// Interfaces offered to autoconnect
    #[serde(default = "default_can_interfaces")]
    pub interfaces: Vec<String>,

    /// Node id used by this host on the bus
    #[serde(default = "default_local_node_id")]
    pub local_node_id: u8,

    /// Controller addressed by autoconnect on each interface
    #[serde(default)]
    pub target_node_id: u8,
}

fn default_can_interfaces() -> Vec<String> {
    vec!["can0".to_string()]
}

fn default_local_node_id() -> u8 {
    254
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interfaces: default_can_interfaces(),
            local_node_id: default_local_node_id(),
            target_node_id: 0,
        }
    }
}

// ==================== Firmware Upload ====================

/// Firmware upload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Bytes per write command
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Attempts per chunk before failing
    #[serde(default = "default_write_retries")]
    pub retries: u32,

    /// Deadline for each write acknowledgement
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Deadline for the erase acknowledgement
    #[serde(default = "default_erase_timeout_ms")]
    pub erase_timeout_ms: u64,

    /// Read written ranges back and compare
    #[serde(default)]
    pub verify: bool,
}

fn default_chunk_size() -> usize {
    200
}

fn default_write_retries() -> u32 {
    5
}

fn default_ack_timeout_ms() -> u64 {
    350
}

fn default_erase_timeout_ms() -> u64 {
    5000
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            retries: default_write_retries(),
            ack_timeout_ms: default_ack_timeout_ms(),
            erase_timeout_ms: default_erase_timeout_ms(),
            verify: false,
        }
    }
}

impl FirmwareConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn erase_timeout(&self) -> Duration {
        Duration::from_millis(self.erase_timeout_ms)
    }
}

// ==================== Autoconnect ====================

/// Autoconnect settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoconnectConfig {
    /// Budget for connecting to one candidate and reading its firmware version
    #[serde(default = "default_candidate_timeout_ms")]
    pub candidate_timeout_ms: u64,

    /// Include stored BLE devices
    #[serde(default = "default_true")]
    pub include_ble: bool,

    /// Include configured CAN interfaces
    #[serde(default = "default_true")]
    pub include_can: bool,
}

fn default_candidate_timeout_ms() -> u64 {
    1500
}

impl Default for AutoconnectConfig {
    fn default() -> Self {
        Self {
            candidate_timeout_ms: default_candidate_timeout_ms(),
            include_ble: true,
            include_can: true,
        }
    }
}

impl AutoconnectConfig {
    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_timeout_ms)
    }
}

// ==================== Logging ====================

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// File name prefix of rolled log files
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

fn default_log_filter() -> String {
    "info,vesc_link=debug".to_string()
}

fn default_log_prefix() -> String {
    "vesc-link.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            log_dir: None,
            file_prefix: default_log_prefix(),
        }
    }
}

// ==================== Tests ====================
