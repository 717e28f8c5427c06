//! Connection orchestration
//!
//! This module owns the single active link and exposes the logical
//! request/response/event surface on top of it.
//!
//! # Architecture
//!
//! [`VescInterface::new`] returns two halves:
//!
//! - [`InterfaceWorker`] - the reactor owning link, codec, dispatcher and CAN
//!   forwarding proxy; spawn it with `tokio::spawn(worker.run())` or run it on
//!   its own thread with [`InterfaceWorker::run_blocking`]
//! - [`InterfaceHandle`] - cheap to clone, sends commands to the worker and
//!   awaits their outcome
//!
//! Everything the worker observes is published on the [`EventBus`] returned by
//! [`InterfaceHandle::events`].
//!
//! # Example
//!
//! ```ignore
//! use vesc_link::config::{ConnectionStore, LinkConfig};
//! use vesc_link::interface::{EventKind, InterfaceEvent, VescInterface};
//! use vesc_link::protocol::{Request, Response};
//! use vesc_link::transport::Endpoint;
//!
//! let (worker, handle) = VescInterface::new(LinkConfig::default(), ConnectionStore::default());
//! tokio::spawn(worker.run());
//!
//! handle.events().subscribe(EventKind::StatusMessage, |event| {
//!     if let InterfaceEvent::StatusMessage { message, .. } = event {
//!         println!("{}", message);
//!     }
//! });
//!
//! handle.connect(Endpoint::Serial { port: "/dev/ttyACM0".into(), baud_rate: None }).await?;
//! handle.wait_for_firmware(Duration::from_secs(3)).await?;
//!
//! if let Response::Values(values) = handle.request(Request::GetValues).await? {
//!     println!("{:.1} V", values.v_in);
//! }
//! ```

pub mod dispatcher;
pub mod events;
pub mod worker;

pub use dispatcher::{CommandDispatcher, DispatchStats, Dispatched, Expired};
pub use events::{EventBus, EventKind, EventSubscriber, InterfaceEvent, SubscriptionId};
pub use worker::{
    classify_firmware, ConfKind, FwCompatibility, InterfaceCommand, InterfaceStatus,
    InterfaceWorker, LinkFuture, LinkOpener,
};

use crate::autoconnect::{reconnect_target, CandidateSource};
use crate::config::{ConnectionStore, LinkConfig};
use crate::error::{LinkError, Result};
use crate::params::ConfigParams;
use crate::protocol::{CanForwardRoute, Request, Response};
use crate::transport::{ble::BleGatt, can::CanBus, Endpoint, Link};
use crate::types::{ConnectionState, FwVersion};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Capacity of the command channel into the worker
pub const COMMAND_CHANNEL_SIZE: usize = 256;

/// Entry point creating a worker and its handle
pub struct VescInterface;

impl VescInterface {
    pub fn new(config: LinkConfig, store: ConnectionStore) -> (InterfaceWorker, InterfaceHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let events = EventBus::new();

        let worker = InterfaceWorker::new(config, store, events.clone(), command_rx, state_tx);
        let handle = InterfaceHandle {
            command_tx,
            state_rx,
            events,
        };
        (worker, handle)
    }
}

/// Handle for talking to a running [`InterfaceWorker`]
#[derive(Clone)]
pub struct InterfaceHandle {
    command_tx: mpsc::Sender<InterfaceCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    events: EventBus,
}

impl std::fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("state", &self.state())
            .finish()
    }
}

impl InterfaceHandle {
    async fn command(&self, cmd: InterfaceCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| LinkError::Channel("interface worker stopped".to_string()))
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> InterfaceCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await
            .map_err(|_| LinkError::Channel("interface worker dropped the reply".to_string()))
    }

    /// Event bus the worker publishes on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    // ==================== Connection ====================

    /// Open a link; only allowed while disconnected
    ///
    /// Resolves once the link is open. Firmware identification continues in
    /// the background, see [`InterfaceHandle::wait_for_firmware`].
    pub async fn connect(&self, endpoint: Endpoint) -> Result<()> {
        self.call(|reply| InterfaceCommand::Connect {
            endpoint,
            opener: None,
            reply,
        })
        .await?
    }

    /// Open a link with a custom opener, e.g. a BLE or CAN backend
    pub async fn connect_with(&self, endpoint: Endpoint, opener: LinkOpener) -> Result<()> {
        self.call(|reply| InterfaceCommand::Connect {
            endpoint,
            opener: Some(opener),
            reply,
        })
        .await?
    }

    /// Connect over BLE through the given GATT backend
    pub async fn connect_ble(&self, gatt: Arc<dyn BleGatt>, address: &str) -> Result<()> {
        let endpoint = Endpoint::Ble {
            address: address.to_string(),
        };
        let address = address.to_string();
        let opener: LinkOpener = Box::new(move |config| {
            Box::pin(async move { Link::connect_ble(gatt, &address, &config).await })
        });
        self.connect_with(endpoint, opener).await
    }

    /// Connect to CAN node `node_id` through the given bus
    pub async fn connect_can(&self, bus: Arc<dyn CanBus>, interface: &str, node_id: u8) -> Result<()> {
        let endpoint = Endpoint::Can {
            interface: interface.to_string(),
            node_id,
        };
        let opener: LinkOpener = Box::new(move |config| {
            Box::pin(async move { Ok(Link::connect_can(bus, node_id, &config)) })
        });
        self.connect_with(endpoint, opener).await
    }

    /// Close the link, or abandon a connect in progress
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|reply| InterfaceCommand::Disconnect { reply: Some(reply) })
            .await
    }

    /// Reconnect to the endpoint tried last
    ///
    /// Without connection history the best ranked serial port from `source`
    /// is used. Returns the endpoint connected to.
    pub async fn reconnect_last(&self, source: &dyn CandidateSource) -> Result<Endpoint> {
        let last = self.store().await?.last_endpoint;
        let Some(endpoint) = reconnect_target(last, source).await else {
            tracing::info!("Nothing to reconnect to");
            return Err(LinkError::AutoconnectFailed { attempted: 0 });
        };
        tracing::info!("Reconnecting to {}", endpoint);
        self.connect(endpoint.clone()).await?;
        Ok(endpoint)
    }

    /// Disconnect without waiting, for use outside async code
    pub fn try_disconnect(&self) -> bool {
        self.command_tx
            .try_send(InterfaceCommand::Disconnect { reply: None })
            .is_ok()
    }

    /// Wait until the firmware was identified
    pub async fn wait_for_firmware(&self, timeout: Duration) -> Result<FwVersion> {
        let (tx, rx) = oneshot::channel();
        self.command(InterfaceCommand::WaitFirmware(tx)).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(fw)) => Ok(fw),
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => Err(LinkError::CommandTimeout {
                opcode: crate::protocol::CommPacketId::FwVersion,
                after: timeout,
            }),
        }
    }

    /// Forget the identified firmware and poll it again
    pub async fn reidentify(&self) -> Result<()> {
        self.command(InterfaceCommand::Reidentify).await
    }

    /// Snapshot of the worker state
    pub async fn status(&self) -> Result<InterfaceStatus> {
        self.call(InterfaceCommand::Status).await
    }

    // ==================== Commands ====================

    /// Send a request and wait for its reply with the default timeout
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.call(|reply| InterfaceCommand::Request {
            request,
            timeout: None,
            reply,
        })
        .await?
    }

    pub async fn request_with_timeout(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.call(|reply| InterfaceCommand::Request {
            request,
            timeout: Some(timeout),
            reply,
        })
        .await?
    }

    /// Send a request without waiting for a reply
    ///
    /// Replies still arrive as events.
    pub async fn send(&self, request: Request) -> Result<()> {
        self.call(|reply| InterfaceCommand::Send {
            request,
            reply: Some(reply),
        })
        .await?
    }

    /// Queue a request from synchronous code
    pub fn try_send(&self, request: Request) -> bool {
        self.command_tx
            .try_send(InterfaceCommand::Send {
                request,
                reply: None,
            })
            .is_ok()
    }

    /// Send a raw payload
    pub async fn send_payload(&self, payload: Vec<u8>) -> Result<()> {
        self.call(|reply| InterfaceCommand::SendPayload {
            payload,
            reply: Some(reply),
        })
        .await?
    }

    /// Address a CAN node through the connected controller
    ///
    /// Returns whether the addressed node changed; if so the firmware is
    /// identified again.
    pub async fn set_can_route(&self, route: CanForwardRoute) -> Result<bool> {
        self.call(|reply| InterfaceCommand::SetCanRoute {
            route,
            reply: Some(reply),
        })
        .await
    }

    /// Ids of nodes on the CAN bus of the connected controller
    pub async fn ping_can(&self) -> Result<Vec<u8>> {
        match self.request(Request::PingCan).await? {
            Response::PingCan(nodes) => Ok(nodes),
            other => Err(LinkError::Decode(format!("unexpected reply {:?}", other.opcode()))),
        }
    }

    // ==================== Configuration ====================

    /// Attach a configuration object that received replies are applied to
    pub async fn attach_config(&self, kind: ConfKind, params: Option<ConfigParams>) -> Result<()> {
        self.command(InterfaceCommand::AttachConfig { kind, params })
            .await
    }

    pub async fn config(&self, kind: ConfKind) -> Result<Option<ConfigParams>> {
        self.call(|reply| InterfaceCommand::ConfigSnapshot { kind, reply })
            .await
    }

    /// Read the configuration from the target into the attached object
    pub async fn read_config(&self, kind: ConfKind) -> Result<Response> {
        let request = match kind {
            ConfKind::Motor => Request::GetMcconf,
            ConfKind::App => Request::GetAppconf,
        };
        self.request(request).await
    }

    /// Write the attached configuration to the target
    pub async fn write_config(&self, kind: ConfKind) -> Result<Response> {
        let params = self
            .config(kind)
            .await?
            .ok_or_else(|| LinkError::Config(format!("no {:?} configuration attached", kind)))?;
        let request = match kind {
            ConfKind::Motor => Request::SetMcconf(params.serialize()),
            ConfKind::App => Request::SetAppconf(params.serialize()),
        };
        self.request(request).await
    }

    // ==================== Connection store ====================

    pub async fn store(&self) -> Result<ConnectionStore> {
        self.call(InterfaceCommand::StoreSnapshot).await
    }

    /// Edit the connection store held by the worker
    pub async fn update_store(
        &self,
        update: impl FnOnce(&mut ConnectionStore) + Send + 'static,
    ) -> Result<()> {
        self.command(InterfaceCommand::UpdateStore(Box::new(update)))
            .await
    }

    /// Add a controller to the pairing list
    pub async fn add_paired_uuid(&self, uuid: &str) -> Result<bool> {
        self.set_paired(uuid, true).await
    }

    pub async fn remove_paired_uuid(&self, uuid: &str) -> Result<bool> {
        self.set_paired(uuid, false).await
    }

    async fn set_paired(&self, uuid: &str, paired: bool) -> Result<bool> {
        let uuid = uuid.to_string();
        self.call(|reply| InterfaceCommand::SetPaired {
            uuid,
            paired,
            reply: Some(reply),
        })
        .await
    }

    /// Stop the worker; it returns the connection store
    pub async fn shutdown(&self) -> Result<()> {
        self.command(InterfaceCommand::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_while_disconnected() {
        let (worker, handle) = VescInterface::new(LinkConfig::default(), ConnectionStore::default());
        let task = tokio::spawn(worker.run());

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(matches!(
            handle.request(Request::GetValues).await,
            Err(LinkError::NotConnected)
        ));
        assert!(matches!(
            handle.send(Request::SetRpm(100)).await,
            Err(LinkError::NotConnected)
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pairing_list_updates_store() {
        let (worker, handle) = VescInterface::new(LinkConfig::default(), ConnectionStore::default());
        let task = tokio::spawn(worker.run());
        let updates = handle.events().channel(&[EventKind::PairingListUpdated]);

        assert!(handle.add_paired_uuid("ABCD").await.unwrap());
        assert!(!handle.add_paired_uuid("ABCD").await.unwrap());
        assert_eq!(
            updates.recv_timeout(Duration::from_secs(1)),
            Some(InterfaceEvent::PairingListUpdated(vec!["ABCD".to_string()]))
        );
        assert!(updates.try_recv().is_none());

        handle.shutdown().await.unwrap();
        let store = task.await.unwrap();
        assert!(store.has_paired_uuid("ABCD"));
    }

    #[tokio::test]
    async fn test_worker_stops_when_handles_drop() {
        let (worker, handle) = VescInterface::new(LinkConfig::default(), ConnectionStore::default());
        let task = tokio::spawn(worker.run());
        handle
            .update_store(|store| store.store_ble_device("AA:BB", "VESC BLE"))
            .await
            .unwrap();
        drop(handle);
        let store = task.await.unwrap();
        assert_eq!(store.ble_devices.len(), 1);
    }
}
