//! Event publication.
//!
//! Publishers (the session and the capture loop) see only [`EventSink`];
//! consumers see only [`EventBus::subscribe`] and friends.
//!
//! Each subscriber gets its own bounded queue filtered by event kind, so a
//! flood of `FrameAvailable` never crowds out `LiveFrame` for a consumer that
//! only asked for frames. Publishing never blocks: a full queue drops the
//! event for that subscriber only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use sharecast_core::{CaptureEvent, CaptureEventKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One-directional publish surface used inside the engine.
pub(crate) trait EventSink: Send + Sync {
    fn emit(&self, event: CaptureEvent);
}

// ── Subscription ──────────────────────────────────────────────────────────────

/// A consumer's handle on the event stream. Dropping it unsubscribes.
pub struct Subscription {
    id:    u64,
    kinds: Option<Vec<CaptureEventKind>>,
    rx:    mpsc::Receiver<CaptureEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kinds this subscription receives; `None` means all of them.
    pub fn kinds(&self) -> Option<&[CaptureEventKind]> {
        self.kinds.as_deref()
    }

    /// Await the next event. `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<CaptureEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<CaptureEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = self.rx.try_recv() {
            events.push(ev);
        }
        events
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .finish()
    }
}

// ── EventBus ──────────────────────────────────────────────────────────────────

struct Subscriber {
    id:    u64,
    kinds: Option<Vec<CaptureEventKind>>,
    tx:    mpsc::Sender<CaptureEvent>,
}

impl Subscriber {
    fn wants(&self, kind: CaptureEventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

struct BusInner {
    capacity:    usize,
    next_id:     AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Fan-out of [`CaptureEvent`]s to any number of subscribers.
///
/// `EventBus` is `Clone`; every clone publishes to the same subscribers.
/// Late subscribers only see events emitted after they subscribed.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `capacity` is the queue depth of each subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity:    capacity.max(1),
                next_id:     AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Receive events of one kind.
    pub fn subscribe(&self, kind: CaptureEventKind) -> Subscription {
        self.register(Some(vec![kind]))
    }

    /// Receive events of any of the given kinds.
    pub fn subscribe_kinds(&self, kinds: &[CaptureEventKind]) -> Subscription {
        self.register(Some(kinds.to_vec()))
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.register(None)
    }

    /// Stop delivering to `subscription`. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        self.subscribers().retain(|s| s.id != subscription.id);
        debug!("Event subscription #{} removed", subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers();
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    fn register(&self, kinds: Option<Vec<CaptureEventKind>>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.subscribers().push(Subscriber { id, kinds: kinds.clone(), tx });
        debug!("Event subscription #{} added ({:?})", id, kinds);
        Subscription { id, kinds, rx }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: CaptureEvent) {
        let kind = event.kind();
        let mut subs = self.subscribers();
        subs.retain(|sub| {
            if !sub.wants(kind) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Subscriber #{} queue full — dropping {}", sub.id, kind);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber #{} gone", sub.id);
                    false
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
