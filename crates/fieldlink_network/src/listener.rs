//! Listener slots and the notification context.
//!
//! Each domain has exactly one slot holding a weak reference to its
//! listener. Registering a new listener replaces the previous one; a slot
//! whose listener was dropped simply stops delivering. When more than one
//! internal consumer needs the same events, the slot is the place to grow
//! into an observer list.
//!
//! Events never run on a link's I/O task. [`Notifier`] queues them onto a
//! single task, so listeners observe events one at a time and in order.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use fieldlink_core::RecipientStatusRow;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::payload::{
    CasualtyHandover, ChatMessage, DiscoveryHello, EmergencyNotice, LinkedForm, MapMarker, Order,
    Photo, PositionUpdate, Profile, StatusReport,
};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A decoded inbound message plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound<T> {
    pub from_device_id: String,
    /// Source address, for local-link traffic only.
    pub origin_host: Option<SocketAddr>,
    pub message: T,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    Upserted {
        marker: Inbound<MapMarker>,
        /// The marker arrived while a "request all" window was open.
        via_sync: bool,
    },
    Deleted {
        id: String,
        from_device_id: String,
    },
    /// A peer asked for every marker we know.
    SyncRequested {
        callsign: String,
        from_device_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message(Inbound<ChatMessage>),
    Delivered {
        message_id: String,
        by_device_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent<R> {
    /// A report addressed to this device arrived for the first time.
    Received(Inbound<R>),
    /// A recipient's delivery status for one of our reports changed.
    StatusChanged(RecipientStatusRow),
}

// ---------------------------------------------------------------------------
// Listener + slot
// ---------------------------------------------------------------------------

pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(E) + Send + Sync,
{
    fn on_event(&self, event: E) {
        self(event)
    }
}

/// Single-subscriber slot for one event domain.
pub struct ListenerSlot<E> {
    listener: RwLock<Option<Weak<dyn Listener<E>>>>,
}

impl<E: Send + 'static> ListenerSlot<E> {
    pub fn new() -> Self {
        Self {
            listener: RwLock::new(None),
        }
    }

    /// Register `listener`, replacing any previous one. The slot keeps only
    /// a weak reference; the caller owns the listener.
    pub fn register<L: Listener<E> + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<dyn Listener<E>> = Arc::downgrade(listener) as Weak<dyn Listener<E>>;
        *self.listener.write() = Some(weak);
    }

    pub fn register_dyn(&self, listener: &Arc<dyn Listener<E>>) {
        *self.listener.write() = Some(Arc::downgrade(listener));
    }

    pub fn clear(&self) {
        *self.listener.write() = None;
    }

    /// Whether a live listener is registered.
    pub fn is_registered(&self) -> bool {
        self.listener
            .read()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    fn snapshot(&self) -> Option<Weak<dyn Listener<E>>> {
        self.listener.read().clone()
    }
}

impl<E: Send + 'static> Default for ListenerSlot<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot per domain.
#[derive(Default)]
pub struct ListenerSlots {
    pub position: ListenerSlot<Inbound<PositionUpdate>>,
    pub marker: ListenerSlot<MarkerEvent>,
    pub profile: ListenerSlot<Inbound<Profile>>,
    pub chat: ListenerSlot<ChatEvent>,
    pub order: ListenerSlot<ReportEvent<Order>>,
    pub status_report: ListenerSlot<ReportEvent<StatusReport>>,
    pub emergency_notice: ListenerSlot<ReportEvent<EmergencyNotice>>,
    pub casualty_handover: ListenerSlot<ReportEvent<CasualtyHandover>>,
    pub linked_form: ListenerSlot<Inbound<LinkedForm>>,
    pub discovery: ListenerSlot<Inbound<DiscoveryHello>>,
    pub photo: ListenerSlot<Inbound<Photo>>,
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send>;

/// Serialized delivery context for listener callbacks.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Job>,
}

impl Notifier {
    /// Spawn the delivery task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            debug!("Listener notifier stopped");
        });
        Self { tx }
    }

    /// Queue `event` for the listener currently in `slot`. The weak
    /// reference is upgraded at delivery time, so a listener dropped in the
    /// meantime is skipped.
    pub fn notify<E: Send + 'static>(&self, slot: &ListenerSlot<E>, event: E) {
        let Some(weak) = slot.snapshot() else {
            return;
        };
        let job: Job = Box::new(move || {
            if let Some(listener) = weak.upgrade() {
                listener.on_event(event);
            }
        });
        if self.tx.send(job).is_err() {
            debug!("Notifier closed; dropping event");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl Listener<u32> for Recorder {
        fn on_event(&self, event: u32) {
            self.seen.lock().push(event);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let notifier = Notifier::spawn();
        let slot = ListenerSlot::<u32>::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        slot.register(&recorder);
        assert!(slot.is_registered());

        for i in 0..50 {
            notifier.notify(&slot, i);
        }
        settle().await;
        assert_eq!(*recorder.seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_register_replaces_previous() {
        let notifier = Notifier::spawn();
        let slot = ListenerSlot::<u32>::new();
        let first = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        slot.register(&first);
        slot.register(&second);

        notifier.notify(&slot, 7);
        settle().await;
        assert!(first.seen.lock().is_empty());
        assert_eq!(*second.seen.lock(), vec![7]);
    }

    #[tokio::test]
    async fn test_dropped_listener_is_skipped() {
        let notifier = Notifier::spawn();
        let slot = ListenerSlot::<u32>::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        slot.register(&recorder);
        drop(recorder);

        assert!(!slot.is_registered());
        notifier.notify(&slot, 1);
        settle().await;
    }

    #[tokio::test]
    async fn test_closure_listener() {
        let notifier = Notifier::spawn();
        let slot = ListenerSlot::<u32>::new();
        let total = Arc::new(Mutex::new(0u32));
        let sink = total.clone();
        let listener = Arc::new(move |n: u32| *sink.lock() += n);
        slot.register(&listener);

        notifier.notify(&slot, 2);
        notifier.notify(&slot, 3);
        settle().await;
        assert_eq!(*total.lock(), 5);

        slot.clear();
        assert!(!slot.is_registered());
    }
}
