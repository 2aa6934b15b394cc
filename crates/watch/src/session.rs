//! One list/watch session: a (namespace, resource) pair kept in sync until cancelled.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, decrement_gauge, increment_gauge};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use stellar_core::{labels_of, name_of, LabelMap, ResourceEvent, ResourceEventType, WatchableResource};
use stellar_kubehub::{is_terminal_error, RawEvent};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::RegistryGuard;
use crate::StreamCtx;

/// Last seen labels per object name.
#[derive(Debug, Default)]
pub struct LabelTracker {
    labels: FxHashMap<String, LabelMap>,
}

/// What changed between the tracked set and a fresh list.
#[derive(Debug, Default)]
pub struct Resync {
    pub added: Vec<Value>,
    pub relabeled: Vec<Value>,
    pub removed: Vec<(String, LabelMap)>,
}

impl LabelTracker {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn seed(&mut self, items: &[Value]) {
        self.labels = items.iter().filter_map(|o| name_of(o).map(|n| (n.to_string(), labels_of(o)))).collect();
    }

    /// Record `labels` for `name`. Returns true when a previous map existed and differs.
    pub fn observe(&mut self, name: &str, labels: LabelMap) -> bool {
        match self.labels.insert(name.to_string(), labels) {
            Some(prev) => Some(&prev) != self.labels.get(name),
            None => false,
        }
    }

    pub fn forget(&mut self, name: &str) {
        self.labels.remove(name);
    }

    /// Replace the tracked set with `items`, reporting the difference.
    pub fn resync(&mut self, items: Vec<Value>) -> Resync {
        let mut out = Resync::default();
        let mut next = FxHashMap::default();
        for obj in items {
            let Some(name) = name_of(&obj).map(str::to_string) else { continue };
            let labels = labels_of(&obj);
            match self.labels.remove(&name) {
                None => out.added.push(obj),
                Some(prev) if prev != labels => out.relabeled.push(obj),
                Some(_) => {}
            }
            next.insert(name, labels);
        }
        let mut removed: Vec<_> = self.labels.drain().collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        out.removed = removed;
        self.labels = next;
        out
    }
}

/// Doubling reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    /// Delay to wait now; the following call returns twice as much, capped.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum WatchEnd {
    Closed,
    Gone,
    Terminal(String),
    Failed(String),
}

/// Counts a session in `active_watchers` while alive.
struct ActiveWatcher<'a>(&'a StreamCtx);

impl<'a> ActiveWatcher<'a> {
    fn enter(ctx: &'a StreamCtx) -> Self {
        ctx.active_watchers.fetch_add(1, Ordering::Relaxed);
        increment_gauge!("resource_watchers_active", 1.0);
        Self(ctx)
    }
}

impl Drop for ActiveWatcher<'_> {
    fn drop(&mut self) {
        self.0.active_watchers.fetch_sub(1, Ordering::Relaxed);
        decrement_gauge!("resource_watchers_active", 1.0);
    }
}

pub(crate) struct Session {
    pub(crate) ctx: Arc<StreamCtx>,
    pub(crate) namespace: String,
    pub(crate) resource: WatchableResource,
    /// Emit ADDED for every object of the first list.
    pub(crate) replay: bool,
    pub(crate) cancel: CancellationToken,
}

impl Session {
    fn key(&self) -> String {
        self.resource.gvr.key()
    }

    fn emit(&self, kind: ResourceEventType, obj: Value) {
        self.ctx.forward(ResourceEvent::object(kind, &self.namespace, self.key(), obj));
    }

    fn emit_relabel(&self, obj: Value) {
        let name = name_of(&obj).unwrap_or_default().to_string();
        let labels = labels_of(&obj);
        self.ctx.forward(ResourceEvent::labels_changed(
            ResourceEventType::ResourceLabelChanged,
            &self.namespace,
            format!("{}/{name}", self.key()),
            labels,
        ));
        self.emit(ResourceEventType::Modified, obj);
    }

    /// Sleep unless cancelled first; false means stop.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(d) => true,
        }
    }

    pub(crate) async fn run(self, permit: OwnedSemaphorePermit, _guard: RegistryGuard) {
        let _active = ActiveWatcher::enter(&self.ctx);
        let key = self.key();
        let tuning = *self.ctx.tuning();
        let mut permit = Some(permit);
        let mut backoff = Backoff::new(tuning.backoff_initial, tuning.backoff_max);
        let mut tracker = LabelTracker::default();
        let mut seeded = false;
        let mut rv = String::new();
        debug!(stream = %self.ctx.id, ns = %self.namespace, resource = %key, "session started");

        loop {
            if rv.is_empty() {
                let listed = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    r = timeout(tuning.list_deadline, self.ctx.source().list(&self.namespace, &self.resource)) => r,
                };
                match listed {
                    Ok(Ok(page)) => {
                        if seeded {
                            let diff = tracker.resync(page.items);
                            for obj in diff.added {
                                self.emit(ResourceEventType::Added, obj);
                            }
                            for obj in diff.relabeled {
                                self.emit_relabel(obj);
                            }
                            for (name, labels) in diff.removed {
                                let obj = json!({"metadata": {"name": name, "namespace": self.namespace, "labels": labels}});
                                self.emit(ResourceEventType::Deleted, obj);
                            }
                        } else {
                            tracker.seed(&page.items);
                            if self.replay {
                                for obj in page.items {
                                    self.emit(ResourceEventType::Added, obj);
                                }
                            }
                            seeded = true;
                        }
                        // an empty version would loop straight back into listing
                        rv = if page.resource_version.is_empty() { "0".to_string() } else { page.resource_version };
                    }
                    Ok(Err(e)) if is_terminal_error(&e) => {
                        warn!(ns = %self.namespace, resource = %key, error = %format!("{e:#}"), "list refused; abandoning session");
                        counter!("resource_sessions_dead_total", 1u64);
                        break;
                    }
                    Ok(Err(e)) => {
                        permit.take();
                        let d = backoff.next_delay();
                        warn!(ns = %self.namespace, resource = %key, error = %format!("{e:#}"), backoff_ms = d.as_millis() as u64, "list failed");
                        if !self.pause(d).await {
                            break;
                        }
                        continue;
                    }
                    Err(_) => {
                        permit.take();
                        let d = backoff.next_delay();
                        warn!(ns = %self.namespace, resource = %key, backoff_ms = d.as_millis() as u64, "list timed out");
                        if !self.pause(d).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.ctx.source().watch(&self.namespace, &self.resource, &rv, tuning.session_timeout_secs) => r,
            };
            let end = match opened {
                Ok(mut stream) => {
                    permit.take();
                    let mut first = true;
                    loop {
                        let item = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            None => break WatchEnd::Closed,
                            Some(Ok(RawEvent::Bookmark { resource_version })) => rv = resource_version,
                            Some(Ok(RawEvent::Error { code: 410, .. })) => break WatchEnd::Gone,
                            Some(Ok(RawEvent::Error { code: code @ (401 | 403 | 405), message })) => {
                                break WatchEnd::Terminal(format!("{code}: {message}"))
                            }
                            Some(Ok(RawEvent::Error { code, message })) => break WatchEnd::Failed(format!("{code}: {message}")),
                            Some(Ok(ev)) => {
                                if first {
                                    backoff.reset();
                                    first = false;
                                }
                                self.apply(ev, &mut tracker, &mut rv);
                            }
                            Some(Err(e)) if is_terminal_error(&e) => break WatchEnd::Terminal(format!("{e:#}")),
                            Some(Err(e)) => break WatchEnd::Failed(format!("{e:#}")),
                        }
                    }
                }
                Err(e) if is_terminal_error(&e) => WatchEnd::Terminal(format!("{e:#}")),
                Err(e) => WatchEnd::Failed(format!("{e:#}")),
            };

            match end {
                WatchEnd::Closed => {
                    backoff.reset();
                    debug!(ns = %self.namespace, resource = %key, "watch closed; resuming");
                    if !self.pause(tuning.reconnect_pause).await {
                        break;
                    }
                }
                WatchEnd::Gone => {
                    info!(ns = %self.namespace, resource = %key, "resource version expired; relisting");
                    counter!("resource_relists_total", 1u64, "reason" => "gone");
                    rv.clear();
                }
                WatchEnd::Terminal(error) => {
                    warn!(ns = %self.namespace, resource = %key, error = %error, "watch refused; abandoning session");
                    counter!("resource_sessions_dead_total", 1u64);
                    break;
                }
                WatchEnd::Failed(error) => {
                    permit.take();
                    let d = backoff.next_delay();
                    warn!(ns = %self.namespace, resource = %key, error = %error, backoff_ms = d.as_millis() as u64, "watch failed");
                    counter!("resource_relists_total", 1u64, "reason" => "error");
                    rv.clear();
                    if !self.pause(d).await {
                        break;
                    }
                }
            }
        }
        debug!(stream = %self.ctx.id, ns = %self.namespace, resource = %key, "session stopped");
    }

    fn apply(&self, ev: RawEvent, tracker: &mut LabelTracker, rv: &mut String) {
        let (kind, obj) = match ev {
            RawEvent::Added(o) => (ResourceEventType::Added, o),
            RawEvent::Modified(o) => (ResourceEventType::Modified, o),
            RawEvent::Deleted(o) => (ResourceEventType::Deleted, o),
            RawEvent::Bookmark { .. } | RawEvent::Error { .. } => return,
        };
        if let Some(v) = obj.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            *rv = v.to_string();
        }
        let name = name_of(&obj).unwrap_or_default().to_string();
        match kind {
            ResourceEventType::Deleted => {
                tracker.forget(&name);
                self.emit(kind, obj);
            }
            ResourceEventType::Modified => {
                if tracker.observe(&name, labels_of(&obj)) {
                    self.emit_relabel(obj);
                } else {
                    self.emit(kind, obj);
                }
            }
            _ => {
                tracker.observe(&name, labels_of(&obj));
                self.emit(kind, obj);
            }
        }
    }
}
