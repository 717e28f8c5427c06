//! BLE UART link
//!
//! Controllers expose the Nordic UART service. The host writes framed bytes
//! to the RX characteristic and receives notifications from the TX
//! characteristic.
//!
//! # Connecting
//!
//! Device connect, service discovery and enabling notifications run under one
//! watchdog ([`BleConfig::connect_timeout`]). If the watchdog fires the device
//! is disconnected and [`TransportError::BleDiscoveryTimeout`] is returned.
//!
//! # Backends
//!
//! The GATT operations sit behind [`BleGatt`]. The `ble` feature provides a
//! btleplug implementation; tests use an in-memory one.

use super::{LinkEvent, LinkReceiver, LINK_CHANNEL_SIZE};
use crate::config::BleConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Nordic UART service
pub const UART_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
/// Host to device characteristic
pub const UART_RX_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
/// Device to host characteristic
pub const UART_TX_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// GATT operations needed for the UART service
#[async_trait]
pub trait BleGatt: Send + Sync {
    /// Find and connect to the device at `address`
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Discover services and locate the UART characteristics
    async fn discover_uart(&self) -> Result<(), TransportError>;

    /// Enable TX notifications, forwarding each as [`LinkEvent::Bytes`]
    ///
    /// When the device goes away the backend sends [`LinkEvent::Closed`].
    async fn enable_notifications(&self, sink: mpsc::Sender<LinkEvent>) -> Result<(), TransportError>;

    /// Write one chunk without response
    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// Open BLE link
pub struct BleLink {
    gatt: Arc<dyn BleGatt>,
    write_chunk: usize,
}

impl BleLink {
    pub async fn open(
        gatt: Arc<dyn BleGatt>,
        address: &str,
        config: &BleConfig,
    ) -> Result<(Self, LinkReceiver), TransportError> {
        let (tx, rx) = mpsc::channel(LINK_CHANNEL_SIZE);
        let watchdog = config.connect_timeout();

        let setup = async {
            gatt.connect(address).await?;
            tracing::debug!("BLE {} connected, discovering services", address);
            gatt.discover_uart().await?;
            gatt.enable_notifications(tx).await
        };

        match tokio::time::timeout(watchdog, setup).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("BLE connect to {} failed: {}", address, e);
                gatt.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!("BLE connect to {} timed out after {:?}", address, watchdog);
                gatt.disconnect().await;
                return Err(TransportError::BleDiscoveryTimeout(watchdog));
            }
        }

        tracing::info!("BLE UART ready on {}", address);
        Ok((
            Self {
                gatt,
                write_chunk: config.write_chunk.max(1),
            },
            rx,
        ))
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        for chunk in data.chunks(self.write_chunk) {
            self.gatt.write_chunk(chunk).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.gatt.disconnect().await;
    }
}

/// Platform backend for [`Endpoint::Ble`](super::Endpoint::Ble)
#[cfg(feature = "ble")]
pub async fn default_backend() -> Result<Arc<dyn BleGatt>, TransportError> {
    Ok(Arc::new(btleplug_backend::BtleplugGatt::new().await?))
}

#[cfg(not(feature = "ble"))]
pub async fn default_backend() -> Result<Arc<dyn BleGatt>, TransportError> {
    Err(TransportError::Unsupported("BLE"))
}

// ==================== btleplug ====================

#[cfg(feature = "ble")]
pub mod btleplug_backend {
    use super::*;
    use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
    use btleplug::platform::{Adapter, Manager, Peripheral};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    const SCAN_POLL: Duration = Duration::from_millis(200);

    fn ble_err(e: btleplug::Error) -> TransportError {
        TransportError::Io(format!("BLE: {}", e))
    }

    fn uuid(s: &str) -> Result<Uuid, TransportError> {
        Uuid::parse_str(s).map_err(|e| TransportError::Io(e.to_string()))
    }

    #[derive(Default)]
    struct Session {
        peripheral: Option<Peripheral>,
        address: String,
        rx_char: Option<Characteristic>,
        tx_char: Option<Characteristic>,
        notify_task: Option<JoinHandle<()>>,
    }

    /// btleplug backed GATT client on the first adapter
    pub struct BtleplugGatt {
        adapter: Adapter,
        session: Mutex<Session>,
    }

    impl BtleplugGatt {
        pub async fn new() -> Result<Self, TransportError> {
            let manager = Manager::new().await.map_err(ble_err)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(ble_err)?
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::Open {
                    endpoint: "BLE".to_string(),
                    reason: "no Bluetooth adapter".to_string(),
                })?;
            Ok(Self {
                adapter,
                session: Mutex::new(Session::default()),
            })
        }

        async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
            for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
                let props = peripheral.properties().await.map_err(ble_err)?;
                let matches = props
                    .map(|p| p.address.to_string().eq_ignore_ascii_case(address))
                    .unwrap_or(false)
                    || peripheral.id().to_string() == address;
                if matches {
                    return Ok(Some(peripheral));
                }
            }
            Ok(None)
        }
    }

    #[async_trait]
    impl BleGatt for BtleplugGatt {
        async fn connect(&self, address: &str) -> Result<(), TransportError> {
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(ble_err)?;

            // bounded by the caller's watchdog
            let peripheral = loop {
                if let Some(p) = self.find(address).await? {
                    break p;
                }
                tokio::time::sleep(SCAN_POLL).await;
            };
            let _ = self.adapter.stop_scan().await;

            peripheral.connect().await.map_err(ble_err)?;
            let mut session = self.session.lock().await;
            session.peripheral = Some(peripheral);
            session.address = address.to_string();
            Ok(())
        }

        async fn discover_uart(&self) -> Result<(), TransportError> {
            let mut session = self.session.lock().await;
            let peripheral = session.peripheral.clone().ok_or(TransportError::Closed)?;
            peripheral.discover_services().await.map_err(ble_err)?;

            let (rx_uuid, tx_uuid) = (uuid(UART_RX_UUID)?, uuid(UART_TX_UUID)?);
            let chars = peripheral.characteristics();
            session.rx_char = chars.iter().find(|c| c.uuid == rx_uuid).cloned();
            session.tx_char = chars.iter().find(|c| c.uuid == tx_uuid).cloned();

            if session.rx_char.is_none() || session.tx_char.is_none() {
                return Err(TransportError::BleServiceNotFound(session.address.clone()));
            }
            Ok(())
        }

        async fn enable_notifications(
            &self,
            sink: mpsc::Sender<LinkEvent>,
        ) -> Result<(), TransportError> {
            let mut session = self.session.lock().await;
            let peripheral = session.peripheral.clone().ok_or(TransportError::Closed)?;
            let tx_char = session.tx_char.clone().ok_or(TransportError::Closed)?;

            peripheral.subscribe(&tx_char).await.map_err(ble_err)?;
            let mut notifications = peripheral.notifications().await.map_err(ble_err)?;
            let tx_uuid = tx_char.uuid;

            session.notify_task = Some(tokio::spawn(async move {
                while let Some(n) = notifications.next().await {
                    if n.uuid != tx_uuid {
                        continue;
                    }
                    if sink.send(LinkEvent::Bytes(n.value)).await.is_err() {
                        return;
                    }
                }
                let _ = sink.send(LinkEvent::Closed(Some(TransportError::Closed))).await;
            }));
            Ok(())
        }

        async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError> {
            let session = self.session.lock().await;
            let (Some(peripheral), Some(rx_char)) = (&session.peripheral, &session.rx_char) else {
                return Err(TransportError::Closed);
            };
            peripheral
                .write(rx_char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(ble_err)
        }

        async fn disconnect(&self) {
            let mut session = self.session.lock().await;
            if let Some(task) = session.notify_task.take() {
                task.abort();
            }
            if let Some(peripheral) = session.peripheral.take() {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::debug!("BLE disconnect: {}", e);
                }
            }
            let _ = self.adapter.stop_scan().await;
            *session = Session::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeGatt {
        hang_discovery: bool,
        missing_service: bool,
        disconnected: AtomicBool,
        writes: Mutex<Vec<Vec<u8>>>,
        sink: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    }

    #[async_trait]
    impl BleGatt for FakeGatt {
        async fn connect(&self, _address: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn discover_uart(&self) -> Result<(), TransportError> {
            if self.hang_discovery {
                std::future::pending::<()>().await;
            }
            if self.missing_service {
                return Err(TransportError::BleServiceNotFound("AA".to_string()));
            }
            Ok(())
        }

        async fn enable_notifications(
            &self,
            sink: mpsc::Sender<LinkEvent>,
        ) -> Result<(), TransportError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        async fn write_chunk(&self, chunk: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().push(chunk.to_vec());
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_writes_split_into_chunks() {
        let gatt = Arc::new(FakeGatt::default());
        let (mut link, _rx) = BleLink::open(gatt.clone(), "AA", &BleConfig::default())
            .await
            .unwrap();

        let data: Vec<u8> = (0..45).collect();
        link.write(&data).await.unwrap();

        let writes = gatt.writes.lock().clone();
        assert_eq!(
            writes.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![20, 20, 5]
        );
        assert_eq!(writes.concat(), data);
    }

    #[tokio::test]
    async fn test_notifications_forwarded_in_order() {
        let gatt = Arc::new(FakeGatt::default());
        let (_link, mut rx) = BleLink::open(gatt.clone(), "AA", &BleConfig::default())
            .await
            .unwrap();

        let sink = gatt.sink.lock().clone().unwrap();
        sink.send(LinkEvent::Bytes(vec![1])).await.unwrap();
        sink.send(LinkEvent::Bytes(vec![2, 3])).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![1])));
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![2, 3])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_disconnects_on_stalled_discovery() {
        let gatt = Arc::new(FakeGatt {
            hang_discovery: true,
            ..Default::default()
        });
        let started = tokio::time::Instant::now();
        let err = BleLink::open(gatt.clone(), "AA", &BleConfig::default())
            .await
            .err()
            .unwrap();

        assert_eq!(
            err,
            TransportError::BleDiscoveryTimeout(Duration::from_secs(10))
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(gatt.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_service_disconnects() {
        let gatt = Arc::new(FakeGatt {
            missing_service: true,
            ..Default::default()
        });
        let err = BleLink::open(gatt.clone(), "AA", &BleConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::BleServiceNotFound(_)));
        assert!(gatt.disconnected.load(Ordering::SeqCst));
    }
}
