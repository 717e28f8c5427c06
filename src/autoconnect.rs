//! Autoconnect
//!
//! Builds a ranked list of places a controller might be reachable and tries
//! them in order until one answers with a firmware version.
//!
//! Ranking:
//!
//! 1. endpoints that worked before, most recent first
//! 2. serial ports, likely controllers first
//! 3. stored BLE devices
//! 4. configured CAN interfaces
//!
//! Duplicates keep their best rank. Each attempt is bounded by
//! `autoconnect.candidate_timeout`; progress is reported after each failed
//! attempt and once more when the probe finishes.

use crate::config::{AutoconnectConfig, CanConfig, ConnectionStore, LinkConfig, StoredBleDevice};
use crate::error::{LinkError, Result};
use crate::interface::{InterfaceEvent, InterfaceHandle};
use crate::protocol::CommPacketId;
use crate::transport::{list_serial_ports, Endpoint, SerialPortCandidate};
use crate::types::{CancelToken, FwVersion};
use async_trait::async_trait;
use std::time::Duration;

/// A place to try
#[derive(Debug, Clone, PartialEq)]
pub struct AutoconnectCandidate {
    pub endpoint: Endpoint,
    /// Human readable name
    pub label: String,
    /// Whether the endpoint produced a firmware reply before
    pub last_known_good: bool,
}

/// Where candidates come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Known-good endpoints, most recent first
    async fn known_good(&self) -> Vec<Endpoint>;

    /// Serial ports, ranked
    async fn serial_ports(&self) -> Vec<SerialPortCandidate>;

    async fn ble_devices(&self) -> Vec<StoredBleDevice>;

    fn can_interfaces(&self) -> Vec<String>;
}

/// Candidates from the connection store and the local system
#[derive(Debug, Clone)]
pub struct SystemCandidates {
    store: ConnectionStore,
    can_interfaces: Vec<String>,
}

impl SystemCandidates {
    pub fn new(store: ConnectionStore, can: &CanConfig) -> Self {
        Self {
            store,
            can_interfaces: can.interfaces.clone(),
        }
    }

    /// Use the store currently held by a running interface
    pub async fn from_handle(handle: &InterfaceHandle, config: &LinkConfig) -> Result<Self> {
        Ok(Self::new(handle.store().await?, &config.can))
    }
}

#[async_trait]
impl CandidateSource for SystemCandidates {
    async fn known_good(&self) -> Vec<Endpoint> {
        self.store.last_known_good().cloned().collect()
    }

    async fn serial_ports(&self) -> Vec<SerialPortCandidate> {
        // enumeration can block on some platforms
        tokio::task::spawn_blocking(list_serial_ports)
            .await
            .unwrap_or_default()
    }

    async fn ble_devices(&self) -> Vec<StoredBleDevice> {
        self.store.ble_devices.clone()
    }

    fn can_interfaces(&self) -> Vec<String> {
        self.can_interfaces.clone()
    }
}

/// Build the ranked, deduplicated candidate list
pub async fn build_candidates(
    source: &dyn CandidateSource,
    config: &AutoconnectConfig,
    can: &CanConfig,
) -> Vec<AutoconnectCandidate> {
    let mut candidates: Vec<AutoconnectCandidate> = Vec::new();
    let mut push = |endpoint: Endpoint, label: String, last_known_good: bool| {
        if candidates.iter().any(|c| c.endpoint == endpoint) {
            return;
        }
        candidates.push(AutoconnectCandidate {
            endpoint,
            label,
            last_known_good,
        });
    };

    for endpoint in source.known_good().await {
        let label = endpoint.to_string();
        push(endpoint, label, true);
    }

    for port in source.serial_ports().await {
        let endpoint = Endpoint::Serial {
            port: port.system_path,
            baud_rate: None,
        };
        push(endpoint, port.name, false);
    }

    if config.include_ble {
        for device in source.ble_devices().await {
            let label = device.display_name().to_string();
            push(
                Endpoint::Ble {
                    address: device.address,
                },
                label,
                false,
            );
        }
    }

    if config.include_can {
        for interface in source.can_interfaces() {
            let label = format!("{} node {}", interface, can.target_node_id);
            push(
                Endpoint::Can {
                    interface,
                    node_id: can.target_node_id,
                },
                label,
                false,
            );
        }
    }

    candidates
}

/// Endpoint to reconnect to: the last one tried, else the best ranked serial port
pub async fn reconnect_target(
    last: Option<Endpoint>,
    source: &dyn CandidateSource,
) -> Option<Endpoint> {
    if last.is_some() {
        return last;
    }
    source
        .serial_ports()
        .await
        .into_iter()
        .next()
        .map(|port| Endpoint::Serial {
            port: port.system_path,
            baud_rate: None,
        })
}

/// What the probe needs from the interface
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: Endpoint) -> Result<()>;

    async fn wait_for_firmware(&self, timeout: Duration) -> Result<FwVersion>;

    async fn disconnect(&self) -> Result<()>;

    fn report_progress(&self, progress: f64, finished: bool);
}

#[async_trait]
impl Connector for InterfaceHandle {
    async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        InterfaceHandle::connect(self, endpoint).await
    }

    async fn wait_for_firmware(&self, timeout: Duration) -> Result<FwVersion> {
        InterfaceHandle::wait_for_firmware(self, timeout).await
    }

    async fn disconnect(&self) -> Result<()> {
        InterfaceHandle::disconnect(self).await
    }

    fn report_progress(&self, progress: f64, finished: bool) {
        self.events()
            .publish(InterfaceEvent::AutoConnectProgressUpdated { progress, finished });
    }
}

/// Tries candidates in rank order
pub struct AutoconnectProbe<C> {
    connector: C,
    config: AutoconnectConfig,
    can: CanConfig,
    cancel: CancelToken,
}

impl<C: Connector> AutoconnectProbe<C> {
    pub fn new(connector: C, config: &LinkConfig, cancel: CancelToken) -> Self {
        Self {
            connector,
            config: config.autoconnect.clone(),
            can: config.can.clone(),
            cancel,
        }
    }

    pub async fn candidates(&self, source: &dyn CandidateSource) -> Vec<AutoconnectCandidate> {
        build_candidates(source, &self.config, &self.can).await
    }

    /// Probe every candidate from `source`
    pub async fn run(&self, source: &dyn CandidateSource) -> Result<AutoconnectCandidate> {
        let candidates = self.candidates(source).await;
        self.run_candidates(candidates).await
    }

    /// Probe a prepared list, stopping at the first success
    ///
    /// On success the interface stays connected to the returned candidate.
    pub async fn run_candidates(
        &self,
        candidates: Vec<AutoconnectCandidate>,
    ) -> Result<AutoconnectCandidate> {
        let total = candidates.len();
        tracing::info!("Autoconnect over {} candidates", total);
        if let Err(e) = self.connector.disconnect().await {
            tracing::debug!("Disconnect before autoconnect failed: {}", e);
        }
        self.connector.report_progress(0.0, false);

        let mut result = Err(LinkError::AutoconnectFailed { attempted: 0 });
        for (i, candidate) in candidates.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                result = Err(LinkError::Cancelled);
                break;
            }

            tracing::debug!("Autoconnect trying {}", candidate.label);
            match self.attempt(&candidate).await {
                Ok(fw) => {
                    tracing::info!("Autoconnect found firmware {} on {}", fw, candidate.label);
                    result = Ok(candidate);
                    break;
                }
                Err(e) => {
                    let _ = self.connector.disconnect().await;
                    if matches!(e, LinkError::Cancelled) {
                        result = Err(e);
                        break;
                    }
                    tracing::debug!("Autoconnect candidate {} failed: {}", candidate.label, e);
                    let tried = i + 1;
                    self.connector
                        .report_progress(tried as f64 / total as f64, false);
                    result = Err(LinkError::AutoconnectFailed { attempted: tried });
                }
            }
        }

        self.connector.report_progress(1.0, true);
        if let Err(e) = &result {
            tracing::info!("Autoconnect finished without a connection: {}", e);
        }
        result
    }

    async fn attempt(&self, candidate: &AutoconnectCandidate) -> Result<FwVersion> {
        let timeout = self.config.candidate_timeout();
        let attempt = async {
            self.connector.connect(candidate.endpoint.clone()).await?;
            self.connector.wait_for_firmware(timeout).await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LinkError::Cancelled),
            outcome = tokio::time::timeout(timeout, attempt) => outcome.unwrap_or(Err(
                LinkError::CommandTimeout {
                    opcode: CommPacketId::FwVersion,
                    after: timeout,
                },
            )),
        }
    }
}
