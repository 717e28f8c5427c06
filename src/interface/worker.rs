//! Interface worker
//!
//! The worker owns the active link, the frame codec, the dispatcher and the CAN
//! forwarding proxy. It runs a single `tokio::select!` loop over:
//!
//! - **commands** from [`InterfaceHandle`](super::InterfaceHandle)s
//! - **connect outcomes** from the task opening a link
//! - **link events**, pushed through the codec and dispatcher in arrival order
//! - **the dispatcher deadline**, synthesizing command timeouts
//! - **a periodic tick** for firmware identification polling and stale frame
//!   data
//!
//! Transport and framing failures tear the link down to
//! [`ConnectionState::Disconnected`] and publish one status message.

use super::dispatcher::{CommandDispatcher, ReplySender};
use super::events::{EventBus, InterfaceEvent};
use crate::config::{CommandConfig, ConnectionStore, FirmwareRelease, LinkConfig};
use crate::error::{LinkError, Result, TransportError};
use crate::params::ConfigParams;
use crate::protocol::{
    CanForwardRoute, CanForwardingProxy, CodecStats, CommPacketId, FrameCodec, Request, Response,
};
use crate::transport::{Endpoint, Link, LinkEvent, LinkReceiver};
use crate::types::{ConnectionState, FwVersion};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::dispatcher::DispatchStats;

/// Future opening a link
pub type LinkFuture =
    Pin<Box<dyn Future<Output = std::result::Result<(Link, LinkReceiver), TransportError>> + Send>>;

/// Opens a link with a caller supplied backend instead of [`Link::connect`]
pub type LinkOpener = Box<dyn FnOnce(LinkConfig) -> LinkFuture + Send>;

/// Edits the connection store on the worker
pub type StoreUpdate = Box<dyn FnOnce(&mut ConnectionStore) + Send>;

pub(crate) const TOO_OLD_MESSAGE: &str =
    "The firmware on the connected VESC is too old. Please update it using a programmer.";
pub(crate) const TOO_NEW_MESSAGE: &str = "The connected VESC has newer firmware than this \
     library supports. Until the firmware is changed, limited communication mode will be used \
     where only the firmware can be updated.";
pub(crate) const UPGRADABLE_MESSAGE: &str = "The connected VESC has too old firmware. Since it \
     has bootloader support it can be updated. Until then, limited communication mode will be \
     used where only the firmware can be updated.";
pub(crate) const OUTDATED_MESSAGE: &str =
    "The connected VESC has compatible, but old firmware. It is recommended that you update it.";
pub(crate) const NO_FW_RESPONSE_MESSAGE: &str = "No firmware read response";

/// Which configuration object a command refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfKind {
    Motor,
    App,
}

/// Messages sent from handles to the worker
pub enum InterfaceCommand {
    Connect {
        endpoint: Endpoint,
        opener: Option<LinkOpener>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: Option<oneshot::Sender<()>>,
    },
    /// Request that waits for its reply
    Request {
        request: Request,
        timeout: Option<Duration>,
        reply: ReplySender,
    },
    /// Fire-and-forget request
    Send {
        request: Request,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// Raw payload, bypassing request encoding
    SendPayload {
        payload: Vec<u8>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    SetCanRoute {
        route: CanForwardRoute,
        reply: Option<oneshot::Sender<bool>>,
    },
    WaitFirmware(oneshot::Sender<FwVersion>),
    /// Forget the firmware version and poll it again
    Reidentify,
    AttachConfig {
        kind: ConfKind,
        params: Option<ConfigParams>,
    },
    ConfigSnapshot {
        kind: ConfKind,
        reply: oneshot::Sender<Option<ConfigParams>>,
    },
    StoreSnapshot(oneshot::Sender<ConnectionStore>),
    UpdateStore(StoreUpdate),
    SetPaired {
        uuid: String,
        paired: bool,
        reply: Option<oneshot::Sender<bool>>,
    },
    Status(oneshot::Sender<InterfaceStatus>),
    Shutdown,
}

impl std::fmt::Debug for InterfaceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceCommand::Connect { endpoint, .. } => write!(f, "Connect({})", endpoint),
            InterfaceCommand::Disconnect { .. } => write!(f, "Disconnect"),
            InterfaceCommand::Request { request, .. } => write!(f, "Request({:?})", request.opcode()),
            InterfaceCommand::Send { request, .. } => write!(f, "Send({:?})", request.opcode()),
            InterfaceCommand::SendPayload { payload, .. } => {
                write!(f, "SendPayload({} bytes)", payload.len())
            }
            InterfaceCommand::SetCanRoute { route, .. } => write!(f, "SetCanRoute({:?})", route),
            InterfaceCommand::WaitFirmware(_) => write!(f, "WaitFirmware"),
            InterfaceCommand::Reidentify => write!(f, "Reidentify"),
            InterfaceCommand::AttachConfig { kind, .. } => write!(f, "AttachConfig({:?})", kind),
            InterfaceCommand::ConfigSnapshot { kind, .. } => {
                write!(f, "ConfigSnapshot({:?})", kind)
            }
            InterfaceCommand::StoreSnapshot(_) => write!(f, "StoreSnapshot"),
            InterfaceCommand::UpdateStore(_) => write!(f, "UpdateStore"),
            InterfaceCommand::SetPaired { uuid, paired, .. } => {
                write!(f, "SetPaired({}, {})", uuid, paired)
            }
            InterfaceCommand::Status(_) => write!(f, "Status"),
            InterfaceCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Snapshot of the worker state
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceStatus {
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub firmware: Option<FwVersion>,
    pub limited: bool,
    pub route: CanForwardRoute,
    pub codec: CodecStats,
    pub dispatch: DispatchStats,
}

/// Result of checking a firmware version against the supported releases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwCompatibility {
    /// Full command set; `outdated` when older than the newest supported
    Supported { outdated: bool },
    /// Only firmware update commands
    Limited(&'static str),
    /// Cannot be used at all
    Unsupported(&'static str),
}

/// Classify a firmware version
///
/// An empty supported list accepts every valid version.
pub fn classify_firmware(fw: &FwVersion, config: &CommandConfig) -> FwCompatibility {
    if !fw.is_valid() {
        return FwCompatibility::Unsupported(TOO_OLD_MESSAGE);
    }
    let connected = FirmwareRelease::new(fw.major, fw.minor);
    let Some(highest) = config.supported_firmwares.iter().max().copied() else {
        return FwCompatibility::Supported { outdated: false };
    };

    if connected > highest {
        FwCompatibility::Limited(TOO_NEW_MESSAGE)
    } else if !config.supported_firmwares.contains(&connected) {
        if connected >= config.min_limited_release {
            FwCompatibility::Limited(UPGRADABLE_MESSAGE)
        } else {
            FwCompatibility::Unsupported(TOO_OLD_MESSAGE)
        }
    } else {
        FwCompatibility::Supported {
            outdated: connected < highest,
        }
    }
}

fn firmware_status(fw: &FwVersion) -> String {
    let mut status = format!("VESC Firmware Version {}.{}", fw.major, fw.minor);
    if !fw.hw.is_empty() {
        status.push_str(&format!(", Hardware: {}", fw.hw));
    }
    if !fw.uuid.is_empty() {
        status.push_str(&format!(", UUID: {}", fw.uuid_string()));
    }
    status
}

#[derive(Debug, Default)]
struct FwIdentification {
    polling: bool,
    retries: u32,
    last_poll: Option<Instant>,
    version: Option<FwVersion>,
    limited: bool,
}

struct PendingConnect {
    attempt: u64,
    endpoint: Endpoint,
    reply: oneshot::Sender<Result<()>>,
    task: JoinHandle<()>,
}

type ConnectOutcome = (u64, std::result::Result<(Link, LinkReceiver), TransportError>);

/// The reactor owning the active link
pub struct InterfaceWorker {
    config: LinkConfig,
    store: ConnectionStore,
    events: EventBus,
    command_rx: mpsc::Receiver<InterfaceCommand>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,

    link: Option<Link>,
    link_rx: Option<LinkReceiver>,
    endpoint: Option<Endpoint>,
    codec: FrameCodec,
    dispatcher: CommandDispatcher,
    proxy: CanForwardingProxy,

    connect_tx: mpsc::Sender<ConnectOutcome>,
    connect_rx: mpsc::Receiver<ConnectOutcome>,
    pending_connect: Option<PendingConnect>,
    next_attempt: u64,

    fw: FwIdentification,
    fw_waiters: Vec<oneshot::Sender<FwVersion>>,
    mcconf: Option<ConfigParams>,
    appconf: Option<ConfigParams>,
}

impl InterfaceWorker {
    pub(crate) fn new(
        config: LinkConfig,
        store: ConnectionStore,
        events: EventBus,
        command_rx: mpsc::Receiver<InterfaceCommand>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        let (connect_tx, connect_rx) = mpsc::channel(4);
        Self {
            codec: FrameCodec::new(&config.framing),
            dispatcher: CommandDispatcher::new(
                config.commands.default_timeout(),
                config.commands.queue_limit,
            ),
            config,
            store,
            events,
            command_rx,
            state_tx,
            state: ConnectionState::Disconnected,
            link: None,
            link_rx: None,
            endpoint: None,
            proxy: CanForwardingProxy::new(),
            connect_tx,
            connect_rx,
            pending_connect: None,
            next_attempt: 0,
            fw: FwIdentification::default(),
            fw_waiters: Vec::new(),
            mcconf: None,
            appconf: None,
        }
    }

    /// Run until shutdown or until every handle is dropped
    ///
    /// Returns the connection store with everything learned while running.
    pub async fn run(mut self) -> ConnectionStore {
        tracing::info!("Interface worker started");
        let mut tick = tokio::time::interval(self.config.commands.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.dispatcher.next_deadline();
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(InterfaceCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some((attempt, outcome)) = self.connect_rx.recv() => {
                    self.on_connect_outcome(attempt, outcome).await;
                }
                event = next_link_event(&mut self.link_rx) => {
                    self.on_link_event(event).await;
                }
                _ = sleep_until(deadline) => {
                    self.on_deadline().await;
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
            }
        }

        self.teardown(None).await;
        tracing::info!("Interface worker stopped");
        self.store
    }

    /// Run on a dedicated current-thread runtime
    pub fn run_blocking(self) -> Result<ConnectionStore> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run()))
    }

    fn publish(&self, event: InterfaceEvent) {
        self.events.publish(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        self.publish(InterfaceEvent::ConnectionStateChanged(state));
    }

    async fn handle_command(&mut self, cmd: InterfaceCommand) {
        tracing::trace!("Command: {:?}", cmd);
        match cmd {
            InterfaceCommand::Connect {
                endpoint,
                opener,
                reply,
            } => self.start_connect(endpoint, opener, reply),
            InterfaceCommand::Disconnect { reply } => {
                self.teardown(None).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            InterfaceCommand::Request {
                request,
                timeout,
                reply,
            } => {
                if !self.state.is_connected() {
                    let _ = reply.send(Err(LinkError::NotConnected));
                    return;
                }
                if request.reply_opcode().is_none() {
                    let _ = reply.send(Err(LinkError::InvalidPayload(format!(
                        "{:?} has no reply, send it instead",
                        request.opcode()
                    ))));
                    return;
                }
                if let Err(e) = self.dispatcher.admit(&request) {
                    let _ = reply.send(Err(e));
                    return;
                }
                if let Some(payload) =
                    self.dispatcher
                        .submit(request, timeout, Some(reply), Instant::now())
                {
                    self.transmit_tracked(payload).await;
                }
            }
            InterfaceCommand::Send { request, reply } => {
                let result = match self.ensure_connected() {
                    Ok(()) => match self.dispatcher.untracked(&request) {
                        Ok(payload) => self.transmit(payload).await,
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            InterfaceCommand::SendPayload { payload, reply } => {
                let result = self.send_raw(payload).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            InterfaceCommand::SetCanRoute { route, reply } => {
                let changed = self.proxy.set_route(route);
                if changed {
                    self.restart_identification().await;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(changed);
                }
            }
            InterfaceCommand::WaitFirmware(reply) => match &self.fw.version {
                Some(fw) if !self.fw.polling => {
                    let _ = reply.send(fw.clone());
                }
                _ => self.fw_waiters.push(reply),
            },
            InterfaceCommand::Reidentify => self.restart_identification().await,
            InterfaceCommand::AttachConfig { kind, params } => match kind {
                ConfKind::Motor => self.mcconf = params,
                ConfKind::App => self.appconf = params,
            },
            InterfaceCommand::ConfigSnapshot { kind, reply } => {
                let params = match kind {
                    ConfKind::Motor => self.mcconf.clone(),
                    ConfKind::App => self.appconf.clone(),
                };
                let _ = reply.send(params);
            }
            InterfaceCommand::StoreSnapshot(reply) => {
                let _ = reply.send(self.store.clone());
            }
            InterfaceCommand::UpdateStore(update) => update(&mut self.store),
            InterfaceCommand::SetPaired {
                uuid,
                paired,
                reply,
            } => {
                let changed = if paired {
                    self.store.add_paired_uuid(&uuid)
                } else {
                    self.store.remove_paired_uuid(&uuid)
                };
                if changed {
                    self.publish(InterfaceEvent::PairingListUpdated(
                        self.store.paired_uuids.clone(),
                    ));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(changed);
                }
            }
            InterfaceCommand::Status(reply) => {
                let _ = reply.send(InterfaceStatus {
                    state: self.state,
                    endpoint: self.endpoint.clone(),
                    firmware: self.fw.version.clone(),
                    limited: self.dispatcher.is_limited(),
                    route: self.proxy.route(),
                    codec: self.codec.stats().clone(),
                    dispatch: self.dispatcher.stats().clone(),
                });
            }
            InterfaceCommand::Shutdown => {}
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    async fn send_raw(&mut self, payload: Vec<u8>) -> Result<()> {
        self.ensure_connected()?;
        let Some(&first) = payload.first() else {
            return Err(LinkError::InvalidPayload("empty payload".to_string()));
        };
        if self.dispatcher.is_limited() {
            match CommPacketId::from_u8(first) {
                Some(id) if id.allowed_in_limited_mode() => {}
                Some(opcode) => return Err(LinkError::LimitedMode { opcode }),
                None => {
                    return Err(LinkError::InvalidPayload(format!(
                        "unknown opcode {} in limited mode",
                        first
                    )))
                }
            }
        }
        self.transmit(payload).await
    }

    // ==================== Connection lifecycle ====================

    fn start_connect(
        &mut self,
        endpoint: Endpoint,
        opener: Option<LinkOpener>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.state != ConnectionState::Disconnected {
            let _ = reply.send(Err(LinkError::AlreadyConnected(self.state)));
            return;
        }

        tracing::info!("Connecting to {}", endpoint);
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        self.store.remember_attempt(&endpoint);
        self.set_state(ConnectionState::Connecting);

        let open: LinkFuture = match opener {
            Some(opener) => opener(self.config.clone()),
            None => {
                let endpoint = endpoint.clone();
                let config = self.config.clone();
                Box::pin(async move { Link::connect(&endpoint, &config).await })
            }
        };
        let tx = self.connect_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = open.await;
            // the worker is gone; do not leak the link
            if let Err(mpsc::error::SendError((_, Ok((mut link, _))))) =
                tx.send((attempt, outcome)).await
            {
                link.close().await;
            }
        });

        self.pending_connect = Some(PendingConnect {
            attempt,
            endpoint,
            reply,
            task,
        });
    }

    async fn on_connect_outcome(
        &mut self,
        attempt: u64,
        outcome: std::result::Result<(Link, LinkReceiver), TransportError>,
    ) {
        let pending = match self.pending_connect.take() {
            Some(p) if p.attempt == attempt => p,
            other => {
                self.pending_connect = other;
                tracing::debug!("Dropping outcome of abandoned connect attempt {}", attempt);
                if let Ok((mut link, _)) = outcome {
                    link.close().await;
                }
                return;
            }
        };

        match outcome {
            Ok((link, rx)) => {
                tracing::info!("Connected to {}", pending.endpoint);
                self.link = Some(link);
                self.link_rx = Some(rx);
                self.endpoint = Some(pending.endpoint);
                self.codec.reset();
                self.set_state(ConnectionState::Connected);
                self.publish(InterfaceEvent::PortConnectedChanged(true));
                let _ = pending.reply.send(Ok(()));

                if self.config.commands.poll_fw_version {
                    self.fw.polling = true;
                    self.poll_firmware().await;
                }
            }
            Err(e) => {
                tracing::warn!("Connecting to {} failed: {}", pending.endpoint, e);
                self.set_state(ConnectionState::Disconnected);
                self.publish(InterfaceEvent::status(
                    format!("Could not connect to {}: {}", pending.endpoint, e),
                    false,
                ));
                let _ = pending.reply.send(Err(e.into()));
            }
        }
    }

    /// Close the link and return to `Disconnected`
    ///
    /// `reason` is published as the single status message for the teardown.
    async fn teardown(&mut self, reason: Option<String>) {
        if let Some(pending) = self.pending_connect.take() {
            tracing::info!("Abandoning connect to {}", pending.endpoint);
            pending.task.abort();
            let _ = pending.reply.send(Err(LinkError::Cancelled));
        }
        if self.state == ConnectionState::Disconnected {
            return;
        }

        let was_connected = self.state.is_connected();
        self.set_state(ConnectionState::Disconnecting);

        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.link_rx = None;
        self.endpoint = None;
        self.dispatcher.fail_all();
        self.dispatcher.set_limited(false);
        self.codec.reset();
        self.fw_waiters.clear();
        self.reset_identification();
        self.fw.polling = false;

        if was_connected {
            self.publish(InterfaceEvent::PortConnectedChanged(false));
        }
        self.set_state(ConnectionState::Disconnected);

        if let Some(reason) = reason {
            tracing::error!("Disconnected: {}", reason);
            self.publish(InterfaceEvent::status(reason, false));
        }
    }

    // ==================== Traffic ====================

    /// Wrap, frame and write a payload
    async fn transmit(&mut self, payload: Vec<u8>) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        let payload = self.proxy.wrap(payload);
        let bytes = if link.is_framed() {
            self.codec.encode(&payload)?
        } else {
            match link.max_payload_len() {
                Some(max) if payload.len() > max => {
                    return Err(LinkError::InvalidPayload(format!(
                        "payload of {} bytes exceeds limit of {}",
                        payload.len(),
                        max
                    )))
                }
                _ => payload,
            }
        };

        tracing::trace!("TX {} bytes", bytes.len());
        let written = link.write(&bytes).await;
        if let Err(e) = written {
            self.teardown(Some(format!("Write failed: {}", e))).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Transmit the outstanding request's payload
    ///
    /// A payload that cannot be sent resolves its request with the error and
    /// the next queued request goes out in its place.
    async fn transmit_tracked(&mut self, payload: Vec<u8>) {
        let mut payload = payload;
        loop {
            let Err(e) = self.transmit(payload).await else {
                return;
            };
            match self.dispatcher.fail_outstanding(e, Instant::now()) {
                Some(next) => payload = next,
                None => return,
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Bytes(data) => {
                let payloads = match self.codec.feed(&data) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        self.teardown(Some(e.to_string())).await;
                        return;
                    }
                };
                if let Some(consecutive_failures) = self.codec.take_quality_warning() {
                    tracing::warn!("{} consecutive corrupt frames", consecutive_failures);
                    self.publish(InterfaceEvent::TransportQualityWarning {
                        consecutive_failures,
                    });
                }
                for payload in payloads {
                    if self.link.is_none() {
                        break;
                    }
                    self.on_payload(payload).await;
                }
            }
            LinkEvent::Payload(payload) => self.on_payload(payload).await,
            LinkEvent::CanFrame(frame) => self.publish(InterfaceEvent::CanFrameRx(frame)),
            LinkEvent::Closed(reason) => {
                let message = match reason {
                    Some(e) => format!("Connection lost: {}", e),
                    None => "Connection lost".to_string(),
                };
                self.teardown(Some(message)).await;
            }
        }
    }

    async fn on_payload(&mut self, raw: Vec<u8>) {
        let (payload, from_node) = self.proxy.unwrap(&raw);
        if let Some(node) = from_node {
            tracing::trace!("Payload relayed from CAN node {}", node);
        }

        let dispatched = self.dispatcher.on_payload(payload, Instant::now());
        if let Some(next) = dispatched.next {
            self.transmit_tracked(next).await;
        }
        match dispatched.response {
            Ok(response) => self.route_response(response).await,
            Err(e) => tracing::warn!("Dropping undecodable payload: {}", e),
        }
    }

    async fn route_response(&mut self, response: Response) {
        match response {
            Response::FwVersion(fw) => {
                self.publish(InterfaceEvent::FwVersionReceived(fw.clone()));
                self.on_fw_version(fw).await;
            }
            Response::Values(values) => self.publish(InterfaceEvent::ValuesReceived(values)),
            Response::CanFrame(frame) => self.publish(InterfaceEvent::CanFrameRx(frame)),
            Response::McConf { ref data, .. } if self.mcconf.is_some() => {
                let result = self.mcconf.as_mut().map(|conf| conf.deserialize(data));
                self.on_config_update(ConfKind::Motor, result);
            }
            Response::AppConf { ref data, .. } if self.appconf.is_some() => {
                let result = self.appconf.as_mut().map(|conf| conf.deserialize(data));
                self.on_config_update(ConfKind::App, result);
            }
            Response::Ack { ref message, .. } => {
                self.publish(InterfaceEvent::status(message.clone(), true));
                self.publish(InterfaceEvent::Decoded(response));
            }
            other => self.publish(InterfaceEvent::Decoded(other)),
        }
    }

    fn on_config_update(&mut self, kind: ConfKind, result: Option<Result<Vec<String>>>) {
        let Some(result) = result else {
            return;
        };
        match (kind, result) {
            (ConfKind::Motor, Ok(changed)) => {
                self.publish(InterfaceEvent::McConfigUpdated { changed });
                self.publish(InterfaceEvent::status("MC configuration updated", true));
            }
            (ConfKind::App, Ok(changed)) => {
                self.publish(InterfaceEvent::AppConfigUpdated { changed });
                self.publish(InterfaceEvent::status("App configuration updated", true));
            }
            (kind, Err(e)) => {
                tracing::warn!("Could not apply {:?} configuration: {}", kind, e);
                self.publish(InterfaceEvent::status(
                    format!("Could not apply received configuration: {}", e),
                    false,
                ));
            }
        }
    }

    async fn on_deadline(&mut self) {
        let (expired, next) = self.dispatcher.expire(Instant::now());
        if let Some(expired) = expired {
            self.publish(InterfaceEvent::CommandTimeout {
                opcode: expired.opcode,
                after: expired.after,
            });
        }
        if let Some(next) = next {
            self.transmit_tracked(next).await;
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if let Some(recovered) = self.codec.expire_stale(now) {
            for payload in recovered {
                if self.link.is_none() {
                    break;
                }
                self.on_payload(payload).await;
            }
        }

        if !self.fw.polling || !self.state.is_connected() {
            return;
        }
        let due = self
            .fw
            .last_poll
            .map_or(true, |last| now.duration_since(last) >= self.config.commands.fw_poll_interval());
        if !due {
            return;
        }
        if self.fw.retries >= self.config.commands.fw_poll_retries {
            tracing::warn!("No firmware reply after {} polls", self.fw.retries);
            self.teardown(Some(NO_FW_RESPONSE_MESSAGE.to_string())).await;
            return;
        }
        self.poll_firmware().await;
    }

    // ==================== Firmware identification ====================

    async fn poll_firmware(&mut self) {
        self.fw.retries += 1;
        self.fw.last_poll = Some(Instant::now());
        match self.dispatcher.untracked(&Request::GetFwVersion) {
            Ok(payload) => {
                if let Err(e) = self.transmit(payload).await {
                    tracing::warn!("Firmware poll not sent: {}", e);
                }
            }
            Err(e) => tracing::warn!("Firmware poll not sent: {}", e),
        }
    }

    fn reset_identification(&mut self) {
        let was_received = self.fw.version.take().is_some();
        self.fw.retries = 0;
        self.fw.last_poll = None;
        self.fw.limited = false;
        if was_received {
            self.publish(InterfaceEvent::FwRxChanged {
                received: false,
                limited: false,
            });
        }
    }

    async fn restart_identification(&mut self) {
        self.reset_identification();
        self.dispatcher.set_limited(false);
        if self.state.is_connected() {
            self.fw.polling = true;
            self.poll_firmware().await;
        }
    }

    async fn on_fw_version(&mut self, fw: FwVersion) {
        let was_received = self.fw.version.is_some();
        self.dispatcher.set_limited(false);

        match classify_firmware(&fw, &self.config.commands) {
            FwCompatibility::Unsupported(message) => {
                tracing::warn!("Unsupported firmware {}", fw);
                self.reset_identification();
                self.teardown(Some(message.to_string())).await;
            }
            FwCompatibility::Limited(message) => {
                tracing::warn!("Firmware {} only allows updates", fw);
                self.dispatcher.set_limited(true);
                if !was_received {
                    self.publish(InterfaceEvent::status(message, false));
                }
                self.mark_received(fw, true);
            }
            FwCompatibility::Supported { outdated } => {
                if outdated && !was_received {
                    self.publish(InterfaceEvent::status(OUTDATED_MESSAGE, false));
                }
                self.publish(InterfaceEvent::status(firmware_status(&fw), true));
                self.mark_received(fw, false);
            }
        }
    }

    fn mark_received(&mut self, fw: FwVersion, limited: bool) {
        let changed = self.fw.version.is_none() || self.fw.limited != limited;
        self.fw.polling = false;
        self.fw.retries = 0;
        self.fw.limited = limited;

        if let Some(endpoint) = &self.endpoint {
            self.store.remember_success(endpoint, &fw.hw);
        }
        for waiter in self.fw_waiters.drain(..) {
            let _ = waiter.send(fw.clone());
        }
        self.fw.version = Some(fw);

        if changed {
            self.publish(InterfaceEvent::FwRxChanged {
                received: true,
                limited,
            });
        }
    }
}

async fn next_link_event(rx: &mut Option<LinkReceiver>) -> LinkEvent {
    match rx {
        Some(rx) => rx.recv().await.unwrap_or(LinkEvent::Closed(None)),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
