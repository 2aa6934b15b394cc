//! Per-cluster lifecycle journal with live fan-out to subscribers.
//!
//! Lock order is always slot, then subscriber map. Appends broadcast while
//! still holding their slot's write lock and subscribers register under the
//! slot's read lock, so a new subscriber sees every event exactly once: either
//! in its replay or through its queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use stellar_core::{ClusterStatus, LifecycleEvent, StreamKind, CURRENT_STATUS_MESSAGE};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub const DEFAULT_JOURNAL_CAP: usize = 1000;
pub const DEFAULT_QUEUE_CAP: usize = 256;

type Slot = Arc<RwLock<Vec<LifecycleEvent>>>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LifecycleEvent>,
}

pub struct EventHub {
    slots: RwLock<FxHashMap<String, Slot>>,
    subscribers: RwLock<FxHashMap<(String, StreamKind), Vec<Subscriber>>>,
    next_id: AtomicU64,
    journal_cap: usize,
    queue_cap: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_caps(DEFAULT_JOURNAL_CAP, DEFAULT_QUEUE_CAP)
    }
}

impl EventHub {
    pub fn with_caps(journal_cap: usize, queue_cap: usize) -> Self {
        Self {
            slots: RwLock::new(FxHashMap::default()),
            subscribers: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            journal_cap: journal_cap.max(1),
            queue_cap: queue_cap.max(1),
        }
    }

    fn slot(&self, cluster: &str) -> Slot {
        if let Some(s) = self.slots.read().get(cluster) {
            return Arc::clone(s);
        }
        Arc::clone(self.slots.write().entry(cluster.to_string()).or_default())
    }

    /// Record an event and push it to every live lifecycle subscriber of the cluster.
    pub fn append(&self, cluster: &str, status: &str, message: impl Into<String>) -> LifecycleEvent {
        let ev = LifecycleEvent::new(cluster, status, message);
        info!(cluster = %cluster, status = %status, message = %ev.message, "lifecycle event");
        counter!("lifecycle_events_appended_total", 1u64);
        let slot = self.slot(cluster);
        let mut journal = slot.write();
        if journal.len() < self.journal_cap {
            journal.push(ev.clone());
        } else {
            warn!(cluster = %cluster, cap = self.journal_cap, "journal full; event broadcast but not retained");
        }
        self.broadcast(&ev);
        drop(journal);
        ev
    }

    /// Independent copy of the cluster's journal, oldest first.
    pub fn snapshot(&self, cluster: &str) -> Vec<LifecycleEvent> {
        self.slots.read().get(cluster).map(|s| s.read().clone()).unwrap_or_default()
    }

    pub fn has_events(&self, cluster: &str) -> bool {
        self.slots.read().get(cluster).map(|s| !s.read().is_empty()).unwrap_or(false)
    }

    pub fn clear(&self, cluster: &str) {
        if let Some(s) = self.slots.read().get(cluster) {
            s.write().clear();
            debug!(cluster = %cluster, "journal cleared");
        }
    }

    /// Deliver `ev` to the lifecycle subscribers of its cluster without journaling it.
    /// Full queues drop the event; closed queues are unregistered.
    pub fn broadcast(&self, ev: &LifecycleEvent) {
        let key = (ev.cluster_name.clone(), StreamKind::Lifecycle);
        let targets: Vec<Subscriber> = match self.subscribers.read().get(&key) {
            Some(list) => list.clone(),
            None => return,
        };
        let mut dead = Vec::new();
        for sub in &targets {
            match sub.tx.try_send(ev.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counter!("lifecycle_subscriber_drops_total", 1u64);
                    warn!(cluster = %ev.cluster_name, subscriber = sub.id, status = %ev.status, "channel full, skipping lifecycle event");
                }
                Err(TrySendError::Closed(_)) => dead.push(sub.id),
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            if let Some(list) = subs.get_mut(&key) {
                list.retain(|s| !dead.contains(&s.id));
                if list.is_empty() {
                    subs.remove(&key);
                }
            }
            debug!(cluster = %ev.cluster_name, removed = dead.len(), "dropped disconnected subscribers");
            self.report_subscribers(&subs);
        }
    }

    /// Register a subscriber. Its queue already holds the journal followed by a
    /// synthetic current-status event when this returns. `current` is read under
    /// the slot lock, so writers that update status before their final append
    /// never leave a replay ending in a stale in-progress tag.
    pub fn subscribe(
        self: &Arc<Self>,
        cluster: &str,
        kind: StreamKind,
        current: impl FnOnce() -> Option<ClusterStatus>,
    ) -> Subscription {
        let slot = self.slot(cluster);
        let journal = slot.read();
        let current = current();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(journal.len() + 1 + self.queue_cap);
        for ev in journal.iter() {
            let _ = tx.try_send(ev.clone());
        }
        let tag = match (current, journal.last()) {
            (Some(s), _) if s.is_in_progress() => "InProgress",
            (_, Some(last)) => last.status.as_str(),
            (_, None) => "Unknown",
        };
        let _ = tx.try_send(LifecycleEvent::new(cluster, tag, CURRENT_STATUS_MESSAGE));
        {
            let mut subs = self.subscribers.write();
            subs.entry((cluster.to_string(), kind)).or_default().push(Subscriber { id, tx });
            self.report_subscribers(&subs);
        }
        let position = journal.len();
        drop(journal);
        debug!(cluster = %cluster, kind = %kind, subscriber = id, replayed = position, "subscriber registered");
        Subscription { id, cluster: cluster.to_string(), kind, position, rx, hub: Arc::downgrade(self) }
    }

    pub fn unsubscribe(&self, cluster: &str, kind: StreamKind, id: u64) {
        let key = (cluster.to_string(), kind);
        let mut subs = self.subscribers.write();
        if let Some(list) = subs.get_mut(&key) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(&key);
            }
        }
        self.report_subscribers(&subs);
    }

    pub fn subscriber_count(&self, cluster: &str, kind: StreamKind) -> usize {
        self.subscribers.read().get(&(cluster.to_string(), kind)).map(Vec::len).unwrap_or(0)
    }

    fn report_subscribers(&self, subs: &FxHashMap<(String, StreamKind), Vec<Subscriber>>) {
        gauge!("lifecycle_subscribers", subs.values().map(Vec::len).sum::<usize>() as f64);
    }
}

/// A registered subscriber. Dropping it unregisters.
pub struct Subscription {
    pub id: u64,
    pub cluster: String,
    pub kind: StreamKind,
    /// Number of journal events replayed at registration.
    pub position: usize,
    rx: mpsc::Receiver<LifecycleEvent>,
    hub: Weak<EventHub>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.cluster, self.kind, self.id);
        }
    }
}
