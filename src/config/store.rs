//! Persisted connection state
//!
//! [`ConnectionStore`] replaces a process-wide settings object: the caller
//! loads it, hands it to the interface, and saves what the interface returns.
//! It records which endpoints produced a valid firmware reply (most recent
//! first) so autoconnect can try them before enumerating anything else.

use crate::error::{LinkError, Result};
use crate::transport::Endpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{ensure_app_data_dir, STORE_FILE};

/// Maximum number of known-good endpoints to remember
pub const MAX_KNOWN_ENDPOINTS: usize = 10;

/// An endpoint that produced a valid firmware reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownEndpoint {
    pub endpoint: Endpoint,
    /// Hardware name reported by the target
    #[serde(default)]
    pub hw: String,
    pub last_success: DateTime<Utc>,
}

/// A BLE device seen or connected before
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBleDevice {
    pub address: String,
    /// Advertised name
    pub name: String,
    /// Name chosen by the user
    #[serde(default)]
    pub preferred_name: Option<String>,
}

impl StoredBleDevice {
    pub fn display_name(&self) -> &str {
        self.preferred_name.as_deref().unwrap_or(&self.name)
    }
}

/// Connection history and stored devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStore {
    /// Version for future migration support
    #[serde(default = "default_store_version")]
    pub version: u32,

    /// Known-good endpoints, most recent first
    #[serde(default)]
    pub known_endpoints: Vec<KnownEndpoint>,

    /// Endpoint of the last connect attempt
    #[serde(default)]
    pub last_endpoint: Option<Endpoint>,

    #[serde(default)]
    pub ble_devices: Vec<StoredBleDevice>,

    /// UUIDs of controllers paired for BLE access
    #[serde(default)]
    pub paired_uuids: Vec<String>,
}

fn default_store_version() -> u32 {
    1
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self {
            version: 1,
            known_endpoints: Vec::new(),
            last_endpoint: None,
            ble_devices: Vec::new(),
            paired_uuids: Vec::new(),
        }
    }
}

impl ConnectionStore {
    /// Default store location in the app data directory
    pub fn default_path() -> Result<PathBuf> {
        Ok(ensure_app_data_dir()?.join(STORE_FILE))
    }

    /// Load from a JSON file; a missing file yields an empty store
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("Failed to read connection store: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| LinkError::Config(format!("Failed to parse connection store: {}", e)))
    }

    /// Load, returning an empty store on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load connection store, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LinkError::Config(format!("Failed to create store directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            LinkError::Serialization(format!("Failed to serialize connection store: {}", e))
        })?;

        std::fs::write(path, content)
            .map_err(|e| LinkError::Config(format!("Failed to write connection store: {}", e)))
    }

    /// Record an endpoint that answered with a valid firmware version
    pub fn remember_success(&mut self, endpoint: &Endpoint, hw: &str) {
        self.known_endpoints.retain(|k| &k.endpoint != endpoint);
        self.known_endpoints.insert(
            0,
            KnownEndpoint {
                endpoint: endpoint.clone(),
                hw: hw.to_string(),
                last_success: Utc::now(),
            },
        );
        self.known_endpoints.truncate(MAX_KNOWN_ENDPOINTS);
    }

    /// Record the endpoint of a connect attempt
    pub fn remember_attempt(&mut self, endpoint: &Endpoint) {
        self.last_endpoint = Some(endpoint.clone());
    }

    /// Drop an endpoint from the known-good list
    pub fn forget(&mut self, endpoint: &Endpoint) {
        self.known_endpoints.retain(|k| &k.endpoint != endpoint);
    }

    /// Known-good endpoints, most recent first
    pub fn last_known_good(&self) -> impl Iterator<Item = &Endpoint> {
        self.known_endpoints.iter().map(|k| &k.endpoint)
    }

    /// Add or update a BLE device, keeping a user chosen name
    pub fn store_ble_device(&mut self, address: &str, name: &str) {
        match self.ble_devices.iter_mut().find(|d| d.address == address) {
            Some(device) => device.name = name.to_string(),
            None => self.ble_devices.push(StoredBleDevice {
                address: address.to_string(),
                name: name.to_string(),
                preferred_name: None,
            }),
        }
    }

    pub fn set_ble_preferred_name(&mut self, address: &str, preferred: Option<String>) -> bool {
        match self.ble_devices.iter_mut().find(|d| d.address == address) {
            Some(device) => {
                device.preferred_name = preferred;
                true
            }
            None => false,
        }
    }

    /// Add a controller UUID to the pairing list; false if already present
    pub fn add_paired_uuid(&mut self, uuid: &str) -> bool {
        if self.paired_uuids.iter().any(|u| u == uuid) {
            return false;
        }
        self.paired_uuids.push(uuid.to_string());
        true
    }

    pub fn remove_paired_uuid(&mut self, uuid: &str) -> bool {
        let before = self.paired_uuids.len();
        self.paired_uuids.retain(|u| u != uuid);
        before != self.paired_uuids.len()
    }

    pub fn has_paired_uuid(&self, uuid: &str) -> bool {
        self.paired_uuids.iter().any(|u| u == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(port: &str) -> Endpoint {
        Endpoint::Serial {
            port: port.to_string(),
            baud_rate: None,
        }
    }

    #[test]
    fn test_store_default() {
        let store = ConnectionStore::default();
        assert!(store.known_endpoints.is_empty());
        assert!(store.last_endpoint.is_none());
        assert_eq!(store.version, 1);
    }

    #[test]
    fn test_remember_success_orders_and_dedupes() {
        let mut store = ConnectionStore::default();
        store.remember_success(&serial("/dev/ttyACM0"), "410");
        store.remember_success(&serial("/dev/ttyACM1"), "60");
        store.remember_success(&serial("/dev/ttyACM0"), "410");

        let order: Vec<_> = store.last_known_good().cloned().collect();
        assert_eq!(order, vec![serial("/dev/ttyACM0"), serial("/dev/ttyACM1")]);
    }

    #[test]
    fn test_known_endpoints_max_limit() {
        let mut store = ConnectionStore::default();
        for i in 0..15 {
            store.remember_success(&serial(&format!("/dev/ttyACM{}", i)), "");
        }
        assert_eq!(store.known_endpoints.len(), MAX_KNOWN_ENDPOINTS);
        assert_eq!(store.known_endpoints[0].endpoint, serial("/dev/ttyACM14"));
    }

    #[test]
    fn test_ble_names_and_pairing() {
        let mut store = ConnectionStore::default();
        store.store_ble_device("AA:BB", "VESC BLE UART");
        assert!(store.set_ble_preferred_name("AA:BB", Some("Board".to_string())));
        store.store_ble_device("AA:BB", "VESC BLE UART 2");
        assert_eq!(store.ble_devices.len(), 1);
        assert_eq!(store.ble_devices[0].display_name(), "Board");
        assert!(!store.set_ble_preferred_name("CC:DD", None));

        assert!(store.add_paired_uuid("0011"));
        assert!(!store.add_paired_uuid("0011"));
        assert!(store.has_paired_uuid("0011"));
        assert!(store.remove_paired_uuid("0011"));
        assert!(!store.remove_paired_uuid("0011"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STORE_FILE);

        let mut store = ConnectionStore::default();
        store.remember_success(
            &Endpoint::Tcp {
                host: "192.168.4.1".to_string(),
                port: 65102,
            },
            "410",
        );
        store.remember_attempt(&serial("COM3"));
        store.save(&path).unwrap();

        let loaded = ConnectionStore::load(&path).unwrap();
        assert_eq!(loaded, store);
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ConnectionStore::load(dir.path().join("none.json")).unwrap();
        assert_eq!(loaded, ConnectionStore::default());
    }
}
