//! Event bus
//!
//! Everything the interface reports goes through an [`EventBus`]. Consumers
//! either register a handler for one [`EventKind`] (called on the publishing
//! task, so handlers must be quick) or take a channel subscription and drain
//! it at their own pace:
//!
//! - [`EventBus::channel`] - crossbeam receiver for polling from any thread
//! - [`EventBus::stream`] - tokio receiver for async consumers
//!
//! Channel subscriptions are bounded; when a consumer falls behind, new events
//! for it are dropped and counted in [`EventBus::dropped`].

use crate::protocol::{CommPacketId, Response};
use crate::types::{CanFrame, ConnectionState, FwVersion, McValues};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of each channel subscription
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// Something the interface reports
#[derive(Debug, Clone, PartialEq)]
pub enum InterfaceEvent {
    /// Telemetry reply or push
    ValuesReceived(McValues),
    /// Firmware identification reply
    FwVersionReceived(FwVersion),
    /// The physical link opened or closed
    PortConnectedChanged(bool),
    ConnectionStateChanged(ConnectionState),
    /// Firmware upload progress; `progress` is in `0.0..=1.0`
    FwUploadStatus {
        status: String,
        progress: f64,
        ongoing: bool,
    },
    /// A CAN frame that is not protocol traffic
    CanFrameRx(CanFrame),
    /// Paired controller UUIDs after a change
    PairingListUpdated(Vec<String>),
    AutoConnectProgressUpdated {
        progress: f64,
        finished: bool,
    },
    /// Human readable status line
    StatusMessage {
        message: String,
        is_good: bool,
    },
    /// Firmware identification state; `limited` when only updates are allowed
    FwRxChanged {
        received: bool,
        limited: bool,
    },
    /// Too many consecutive corrupt frames
    TransportQualityWarning {
        consecutive_failures: u32,
    },
    /// A request got no reply in time
    CommandTimeout {
        opcode: CommPacketId,
        after: Duration,
    },
    /// Names of motor configuration parameters that changed
    McConfigUpdated {
        changed: Vec<String>,
    },
    /// Names of app configuration parameters that changed
    AppConfigUpdated {
        changed: Vec<String>,
    },
    /// Any other decoded reply
    Decoded(Response),
}

/// Discriminant of [`InterfaceEvent`] used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ValuesReceived,
    FwVersionReceived,
    PortConnectedChanged,
    ConnectionStateChanged,
    FwUploadStatus,
    CanFrameRx,
    PairingListUpdated,
    AutoConnectProgressUpdated,
    StatusMessage,
    FwRxChanged,
    TransportQualityWarning,
    CommandTimeout,
    McConfigUpdated,
    AppConfigUpdated,
    Decoded,
}

impl InterfaceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InterfaceEvent::ValuesReceived(_) => EventKind::ValuesReceived,
            InterfaceEvent::FwVersionReceived(_) => EventKind::FwVersionReceived,
            InterfaceEvent::PortConnectedChanged(_) => EventKind::PortConnectedChanged,
            InterfaceEvent::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            InterfaceEvent::FwUploadStatus { .. } => EventKind::FwUploadStatus,
            InterfaceEvent::CanFrameRx(_) => EventKind::CanFrameRx,
            InterfaceEvent::PairingListUpdated(_) => EventKind::PairingListUpdated,
            InterfaceEvent::AutoConnectProgressUpdated { .. } => EventKind::AutoConnectProgressUpdated,
            InterfaceEvent::StatusMessage { .. } => EventKind::StatusMessage,
            InterfaceEvent::FwRxChanged { .. } => EventKind::FwRxChanged,
            InterfaceEvent::TransportQualityWarning { .. } => EventKind::TransportQualityWarning,
            InterfaceEvent::CommandTimeout { .. } => EventKind::CommandTimeout,
            InterfaceEvent::McConfigUpdated { .. } => EventKind::McConfigUpdated,
            InterfaceEvent::AppConfigUpdated { .. } => EventKind::AppConfigUpdated,
            InterfaceEvent::Decoded(_) => EventKind::Decoded,
        }
    }

    pub(crate) fn status(message: impl Into<String>, is_good: bool) -> Self {
        InterfaceEvent::StatusMessage {
            message: message.into(),
            is_good,
        }
    }
}

/// Handle returned by subscriptions, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&InterfaceEvent) + Send + Sync>;

enum Sink {
    Handler(Handler),
    Channel(Sender<InterfaceEvent>),
    Stream(mpsc::Sender<InterfaceEvent>),
}

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every kind
    kinds: Option<Vec<EventKind>>,
    sink: Sink,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    dropped: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

/// Shared publish/subscribe hub
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.inner.subscriptions.read().len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, kinds: Option<Vec<EventKind>>, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .write()
            .push(Subscription { id, kinds, sink });
        id
    }

    /// Call `handler` for every event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&InterfaceEvent) + Send + Sync + 'static,
    {
        self.add(Some(vec![kind]), Sink::Handler(Arc::new(handler)))
    }

    /// Call `handler` for every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InterfaceEvent) + Send + Sync + 'static,
    {
        self.add(None, Sink::Handler(Arc::new(handler)))
    }

    /// Channel subscription; an empty `kinds` receives everything
    pub fn channel(&self, kinds: &[EventKind]) -> EventSubscriber {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        let id = self.add(Self::filter(kinds), Sink::Channel(tx));
        EventSubscriber { id, receiver: rx }
    }

    /// Async subscription; an empty `kinds` receives everything
    pub fn stream(&self, kinds: &[EventKind]) -> (SubscriptionId, mpsc::Receiver<InterfaceEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.add(Self::filter(kinds), Sink::Stream(tx));
        (id, rx)
    }

    fn filter(kinds: &[EventKind]) -> Option<Vec<EventKind>> {
        (!kinds.is_empty()).then(|| kinds.to_vec())
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Deliver `event` to every interested subscriber
    pub fn publish(&self, event: InterfaceEvent) {
        let kind = event.kind();
        let mut handlers = Vec::new();
        let mut closed = Vec::new();

        {
            let subs = self.inner.subscriptions.read();
            for sub in subs.iter().filter(|s| s.wants(kind)) {
                match &sub.sink {
                    Sink::Handler(h) => handlers.push(h.clone()),
                    Sink::Channel(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => closed.push(sub.id),
                    },
                    Sink::Stream(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
                    },
                }
            }
        }

        // handlers may subscribe or publish, so the lock is released first
        for handler in handlers {
            handler(&event);
        }

        if !closed.is_empty() {
            self.inner
                .subscriptions
                .write()
                .retain(|s| !closed.contains(&s.id));
        }
    }

    /// Number of subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Events dropped because a channel subscriber was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Polling subscription created by [`EventBus::channel`]
pub struct EventSubscriber {
    id: SubscriptionId,
    receiver: Receiver<InterfaceEvent>,
}

impl EventSubscriber {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn try_recv(&self) -> Option<InterfaceEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive all pending events
    pub fn drain(&self) -> Vec<InterfaceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block until an event arrives or `timeout` passes
    pub fn recv_timeout(&self, timeout: Duration) -> Option<InterfaceEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handler_receives_only_its_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(EventKind::PortConnectedChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(InterfaceEvent::PortConnectedChanged(true));
        bus.publish(InterfaceEvent::status("hello", true));
        bus.publish(InterfaceEvent::PortConnectedChanged(false));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(InterfaceEvent::PortConnectedChanged(true));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(InterfaceEvent::PortConnectedChanged(false));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_drain_and_filter() {
        let bus = EventBus::new();
        let sub = bus.channel(&[EventKind::StatusMessage]);

        bus.publish(InterfaceEvent::status("one", true));
        bus.publish(InterfaceEvent::PortConnectedChanged(true));
        bus.publish(InterfaceEvent::status("two", false));

        let events = sub.drain();
        assert_eq!(
            events,
            vec![
                InterfaceEvent::status("one", true),
                InterfaceEvent::status("two", false)
            ]
        );
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_dropped_channel_is_removed() {
        let bus = EventBus::new();
        let sub = bus.channel(&[]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(InterfaceEvent::PortConnectedChanged(true));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_publish() {
        let bus = EventBus::new();
        let sub = bus.channel(&[EventKind::StatusMessage]);
        let inner = bus.clone();
        bus.subscribe(EventKind::PortConnectedChanged, move |_| {
            inner.publish(InterfaceEvent::status("port changed", true));
        });

        bus.publish(InterfaceEvent::PortConnectedChanged(true));
        assert_eq!(sub.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_subscription() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.stream(&[EventKind::FwRxChanged]);
        bus.publish(InterfaceEvent::FwRxChanged {
            received: true,
            limited: false,
        });
        assert_eq!(
            rx.recv().await,
            Some(InterfaceEvent::FwRxChanged {
                received: true,
                limited: false
            })
        );
    }
}
