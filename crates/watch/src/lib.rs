//! Stellar watch: the resource stream behind `/ws/namespaces`.
//!
//! One [`ResourceStream`] per client. Opening it lists namespaces, then spins up
//! a manager per visible namespace which launches one list/watch session per
//! high- and medium-priority resource. Everything the stream owns hangs off a
//! single cancellation token that fires when the stream is dropped.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use stellar_core::{Gvr, Priority, ResourceEvent, WatchableResource};
use stellar_kubehub::ResourceSource;
use stellar_store::TtlCache;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod namespace;
pub mod registry;
mod session;

pub use registry::{RegistryGuard, WatcherRegistry};
pub use session::{Backoff, LabelTracker, Resync};

pub const WATCHABLE_RESOURCES_KEY: &str = "watchable_resources";

#[derive(Debug, Clone, Copy)]
pub struct WatchTuning {
    /// Per-client send queue.
    pub queue_capacity: usize,
    /// Sessions allowed to be establishing at once per namespace.
    pub max_starting: usize,
    pub high_stagger: Duration,
    pub medium_stagger: Duration,
    pub medium_warmup: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub session_timeout_secs: u32,
    pub namespace_timeout_secs: u32,
    pub reconnect_pause: Duration,
    pub list_deadline: Duration,
    pub discovery_ttl: Duration,
    pub heartbeat: Duration,
}

impl Default for WatchTuning {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            max_starting: 3,
            high_stagger: Duration::from_millis(200),
            medium_stagger: Duration::from_millis(500),
            medium_warmup: Duration::from_secs(2),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            session_timeout_secs: 60,
            namespace_timeout_secs: 300,
            reconnect_pause: Duration::from_secs(2),
            list_deadline: Duration::from_secs(5),
            discovery_ttl: Duration::from_secs(15 * 60),
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// Used when discovery fails outright.
fn fallback_resources() -> Vec<WatchableResource> {
    [("", "pods", "Pod"), ("apps", "deployments", "Deployment"), ("apps", "statefulsets", "StatefulSet"), ("", "services", "Service")]
        .into_iter()
        .filter_map(|(group, resource, kind)| {
            Priority::classify(resource).map(|priority| WatchableResource {
                gvr: Gvr::new(group, "v1", resource),
                kind: kind.to_string(),
                priority,
            })
        })
        .collect()
}

/// Process-wide entry point; cheap to clone.
#[derive(Clone)]
pub struct WatchEngine {
    source: Arc<dyn ResourceSource>,
    cache: Arc<TtlCache>,
    tuning: WatchTuning,
}

impl WatchEngine {
    pub fn new(source: Arc<dyn ResourceSource>, cache: Arc<TtlCache>, tuning: WatchTuning) -> Self {
        Self { source, cache, tuning }
    }

    pub fn tuning(&self) -> &WatchTuning {
        &self.tuning
    }

    /// Discovered resources in High, Medium, Low order; cached for `discovery_ttl`.
    pub async fn watchable_resources(&self) -> Vec<WatchableResource> {
        if let Some(cached) = self.cache.get(WATCHABLE_RESOURCES_KEY) {
            match serde_json::from_str::<Vec<WatchableResource>>(&cached) {
                Ok(v) => return v,
                Err(e) => {
                    warn!(error = %e, "discarding unreadable discovery cache entry");
                    self.cache.invalidate(WATCHABLE_RESOURCES_KEY);
                }
            }
        }
        match self.source.discover().await {
            Ok(found) => {
                if found.partial {
                    warn!(count = found.resources.len(), "discovery was partial; continuing with what was retrieved");
                }
                match serde_json::to_string(&found.resources) {
                    Ok(s) => self.cache.set(WATCHABLE_RESOURCES_KEY, s, self.tuning.discovery_ttl),
                    Err(e) => warn!(error = %e, "discovery result not cached"),
                }
                found.resources
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "discovery failed; using built-in resource list");
                fallback_resources()
            }
        }
    }

    /// Open a resource stream, optionally limited to one namespace.
    pub fn open(&self, namespace: Option<String>) -> ResourceStream {
        let (tx, rx) = mpsc::channel(self.tuning.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let ctx = Arc::new(StreamCtx {
            id: Uuid::new_v4().to_string(),
            engine: self.clone(),
            registry: WatcherRegistry::new(),
            tx,
            cancel: cancel.clone(),
            namespaces: Mutex::new(FxHashMap::default()),
            active_watchers: AtomicUsize::new(0),
            events_processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        info!(stream = %ctx.id, scope = ?namespace, "resource stream opened");
        tokio::spawn(namespace::run_stream(Arc::clone(&ctx), namespace));

        let mut heartbeat = interval_at(Instant::now() + self.tuning.heartbeat, self.tuning.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ResourceStream { rx, ctx, heartbeat, _cancel: cancel.drop_guard() }
    }
}

/// State shared by every task of one resource stream.
pub(crate) struct StreamCtx {
    pub(crate) id: String,
    pub(crate) engine: WatchEngine,
    pub(crate) registry: WatcherRegistry,
    tx: mpsc::Sender<ResourceEvent>,
    pub(crate) cancel: CancellationToken,
    /// Cancellation per namespace, children of `cancel`.
    namespaces: Mutex<FxHashMap<String, CancellationToken>>,
    pub(crate) active_watchers: AtomicUsize,
    events_processed: AtomicU64,
    dropped: AtomicU64,
}

impl StreamCtx {
    pub(crate) fn source(&self) -> &Arc<dyn ResourceSource> {
        &self.engine.source
    }

    pub(crate) fn tuning(&self) -> &WatchTuning {
        &self.engine.tuning
    }

    /// Non-blocking enqueue; a full queue drops the event and keeps the client.
    pub(crate) fn forward(&self, ev: ResourceEvent) {
        match self.tx.try_send(ev) {
            Ok(()) => {
                self.events_processed.fetch_add(1, Ordering::Relaxed);
                counter!("resource_events_forwarded_total", 1u64);
            }
            Err(TrySendError::Full(ev)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("resource_events_dropped_total", 1u64);
                warn!(stream = %self.id, kind = ?ev.kind, ns = %ev.namespace, resource = %ev.resource, "channel full, skipping event");
            }
            Err(TrySendError::Closed(_)) => debug!(stream = %self.id, "stream receiver gone"),
        }
    }

    pub(crate) fn namespace_token(&self, ns: &str) -> CancellationToken {
        let token = self.cancel.child_token();
        self.namespaces.lock().insert(ns.to_string(), token.clone());
        token
    }

    /// Cancel the namespace's tasks and free their registry keys right away, so a
    /// namespace re-created before those tasks wind down still gets new watchers.
    pub(crate) fn stop_namespace(&self, ns: &str) {
        if let Some(token) = self.namespaces.lock().remove(ns) {
            token.cancel();
        }
        self.registry.release(&registry::namespace_resources_key(ns));
        self.registry.release(&registry::namespace_labels_key(ns));
        let sessions = self.registry.release_prefix(&registry::session_prefix(ns));
        debug!(stream = %self.id, ns = %ns, sessions, "namespace watchers stopped");
    }
}

/// A client's view of the cluster. Dropping it stops every owned watcher.
pub struct ResourceStream {
    rx: mpsc::Receiver<ResourceEvent>,
    ctx: Arc<StreamCtx>,
    heartbeat: Interval,
    _cancel: DropGuard,
}

impl ResourceStream {
    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn active_watchers(&self) -> usize {
        self.ctx.active_watchers.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.ctx.events_processed.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.ctx.dropped.load(Ordering::Relaxed)
    }

    /// Handle on the stream's watcher registry (shares state).
    pub fn registry(&self) -> WatcherRegistry {
        self.ctx.registry.clone()
    }

    /// Next queued event, or a STATUS heartbeat when one is due.
    pub async fn next(&mut self) -> Option<ResourceEvent> {
        tokio::select! {
            ev = self.rx.recv() => ev,
            _ = self.heartbeat.tick() => Some(ResourceEvent::status(self.active_watchers(), self.events_processed())),
        }
    }
}

impl Drop for ResourceStream {
    fn drop(&mut self) {
        info!(stream = %self.ctx.id, processed = self.events_processed(), dropped = self.events_dropped(), "resource stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_list_is_high_priority_core_workloads() {
        let keys: Vec<_> = fallback_resources().iter().map(|r| r.gvr.key()).collect();
        assert_eq!(keys, vec![".v1/pods", "apps.v1/deployments", "apps.v1/statefulsets", ".v1/services"]);
        assert!(fallback_resources().iter().all(|r| r.priority == Priority::High));
    }

    #[test]
    fn defaults_match_operating_limits() {
        let t = WatchTuning::default();
        assert_eq!(t.queue_capacity, 500);
        assert_eq!(t.max_starting, 3);
        assert_eq!(t.backoff_max, Duration::from_secs(30));
        assert_eq!(t.discovery_ttl, Duration::from_secs(900));
    }
}
