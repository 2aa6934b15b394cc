//! Stream startup, per-namespace managers and the namespace watchers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use stellar_core::{
    is_visible_namespace, labels_of, name_of, LabelMap, Priority, ResourceEvent, ResourceEventType, WatchableResource,
    NAMESPACES_RESOURCE, NAMESPACE_LABELS_RESOURCE,
};
use stellar_kubehub::{is_terminal_error, RawEvent};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{namespace_labels_key, namespace_resources_key, session_key, RegistryGuard, NAMESPACES_WATCHER_KEY};
use crate::session::{Backoff, Session};
use crate::StreamCtx;

type Resources = Arc<Vec<WatchableResource>>;

async fn pause(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(d) => true,
    }
}

fn in_scope(scope: Option<&str>, name: &str) -> bool {
    is_visible_namespace(name) && scope.map_or(true, |s| s == name)
}

pub(crate) async fn run_stream(ctx: Arc<StreamCtx>, scope: Option<String>) {
    let tuning = *ctx.tuning();
    let listed = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        r = timeout(tuning.list_deadline, ctx.source().list_namespaces()) => r,
    };
    let (namespaces, rv) = match listed {
        Ok(Ok(page)) => {
            let items: Vec<Value> =
                page.items.into_iter().filter(|ns| name_of(ns).is_some_and(|n| in_scope(scope.as_deref(), n))).collect();
            (items, page.resource_version)
        }
        Ok(Err(e)) => {
            warn!(stream = %ctx.id, error = %format!("{e:#}"), "namespace list failed; starting empty");
            (Vec::new(), String::new())
        }
        Err(_) => {
            warn!(stream = %ctx.id, "namespace list timed out; starting empty");
            (Vec::new(), String::new())
        }
    };
    let seeds: Vec<(String, LabelMap)> =
        namespaces.iter().filter_map(|ns| name_of(ns).map(|n| (n.to_string(), labels_of(ns)))).collect();
    ctx.forward(ResourceEvent::initial_data(namespaces));
    ctx.forward(ResourceEvent::watching());

    let resources: Resources = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        r = ctx.engine.watchable_resources() => Arc::new(r),
    };
    info!(stream = %ctx.id, namespaces = seeds.len(), resources = resources.len(), "starting resource watchers");

    if scope.is_none() {
        if let Some(guard) = ctx.registry.try_register(NAMESPACES_WATCHER_KEY) {
            tokio::spawn(watch_all_namespaces(Arc::clone(&ctx), Arc::clone(&resources), rv, guard));
        }
    }
    for (ns, labels) in seeds {
        start_namespace(&ctx, &ns, labels, &resources);
    }
}

/// Spin up the manager and label watcher for `ns` unless this stream already runs them.
pub(crate) fn start_namespace(ctx: &Arc<StreamCtx>, ns: &str, labels: LabelMap, resources: &Resources) {
    let Some(guard) = ctx.registry.try_register(namespace_resources_key(ns)) else {
        debug!(stream = %ctx.id, ns = %ns, "namespace manager already running");
        return;
    };
    let token = ctx.namespace_token(ns);
    tokio::spawn(run_manager(Arc::clone(ctx), ns.to_string(), Arc::clone(resources), token.clone(), guard));
    if let Some(guard) = ctx.registry.try_register(namespace_labels_key(ns)) {
        tokio::spawn(watch_namespace_labels(Arc::clone(ctx), ns.to_string(), labels, token, guard));
    }
}

async fn run_manager(ctx: Arc<StreamCtx>, ns: String, resources: Resources, cancel: CancellationToken, _guard: RegistryGuard) {
    let tuning = *ctx.tuning();
    let gate = Arc::new(Semaphore::new(tuning.max_starting.max(1)));
    let high: Vec<_> = resources.iter().filter(|r| r.priority == Priority::High).collect();
    let medium: Vec<_> = resources.iter().filter(|r| r.priority == Priority::Medium).collect();
    debug!(stream = %ctx.id, ns = %ns, high = high.len(), medium = medium.len(), "namespace manager started");

    let launched = launch(&ctx, &ns, &high, true, tuning.high_stagger, &gate, &cancel).await
        && (medium.is_empty()
            || (pause(&cancel, tuning.medium_warmup).await
                && launch(&ctx, &ns, &medium, false, tuning.medium_stagger, &gate, &cancel).await));
    if launched {
        cancel.cancelled().await;
    }
    debug!(stream = %ctx.id, ns = %ns, "namespace manager stopped");
}

/// Start one session per resource, gated and staggered. False once cancelled.
async fn launch(
    ctx: &Arc<StreamCtx>,
    ns: &str,
    resources: &[&WatchableResource],
    replay: bool,
    stagger: Duration,
    gate: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> bool {
    for (i, resource) in resources.iter().enumerate() {
        if i > 0 && !pause(cancel, stagger).await {
            return false;
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => return false,
            p = Arc::clone(gate).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => return false,
            },
        };
        let Some(guard) = ctx.registry.try_register(session_key(ns, &resource.gvr.key())) else { continue };
        let session = Session {
            ctx: Arc::clone(ctx),
            namespace: ns.to_string(),
            resource: (*resource).clone(),
            replay,
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run(permit, guard));
    }
    true
}

/// Follow one namespace object; LABEL_CHANGED on relabel, stop on delete.
async fn watch_namespace_labels(ctx: Arc<StreamCtx>, ns: String, mut labels: LabelMap, cancel: CancellationToken, _guard: RegistryGuard) {
    let tuning = *ctx.tuning();
    let mut backoff = Backoff::new(tuning.backoff_initial, tuning.backoff_max);
    loop {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            r = ctx.source().watch_namespaces(Some(&ns), "0", tuning.namespace_timeout_secs) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if is_terminal_error(&e) => {
                warn!(ns = %ns, error = %format!("{e:#}"), "namespace label watch refused");
                return;
            }
            Err(e) => {
                let d = backoff.next_delay();
                warn!(ns = %ns, error = %format!("{e:#}"), backoff_ms = d.as_millis() as u64, "namespace label watch failed");
                if !pause(&cancel, d).await {
                    return;
                }
                continue;
            }
        };
        let mut failed = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                None => break,
                Some(Ok(RawEvent::Added(obj) | RawEvent::Modified(obj))) => {
                    backoff.reset();
                    let next = labels_of(&obj);
                    if next != labels {
                        debug!(ns = %ns, "namespace labels changed");
                        ctx.forward(ResourceEvent::labels_changed(
                            ResourceEventType::LabelChanged,
                            &ns,
                            NAMESPACE_LABELS_RESOURCE,
                            next.clone(),
                        ));
                        labels = next;
                    }
                }
                Some(Ok(RawEvent::Deleted(_))) => {
                    debug!(ns = %ns, "namespace deleted; label watcher done");
                    return;
                }
                Some(Ok(RawEvent::Bookmark { .. })) => {}
                Some(Ok(RawEvent::Error { code, message })) => {
                    if matches!(code, 401 | 403 | 405) {
                        warn!(ns = %ns, code, message = %message, "namespace label watch refused");
                        return;
                    }
                    failed = true;
                    break;
                }
                Some(Err(e)) => {
                    if is_terminal_error(&e) {
                        return;
                    }
                    failed = true;
                    break;
                }
            }
        }
        let d = if failed { backoff.next_delay() } else { tuning.reconnect_pause };
        if !pause(&cancel, d).await {
            return;
        }
    }
}

/// Cluster-wide namespace watch: starts managers for new namespaces and stops deleted ones.
async fn watch_all_namespaces(ctx: Arc<StreamCtx>, resources: Resources, mut rv: String, _guard: RegistryGuard) {
    let tuning = *ctx.tuning();
    let cancel = ctx.cancel.clone();
    let mut backoff = Backoff::new(tuning.backoff_initial, tuning.backoff_max);
    loop {
        if rv.is_empty() {
            let listed = tokio::select! {
                _ = cancel.cancelled() => return,
                r = ctx.source().list_namespaces() => r,
            };
            match listed {
                Ok(page) => {
                    for ns in &page.items {
                        if let Some(name) = name_of(ns).filter(|n| is_visible_namespace(n)) {
                            start_namespace(&ctx, name, labels_of(ns), &resources);
                        }
                    }
                    rv = if page.resource_version.is_empty() { "0".to_string() } else { page.resource_version };
                }
                Err(e) if is_terminal_error(&e) => {
                    warn!(stream = %ctx.id, error = %format!("{e:#}"), "namespace list refused; cluster watcher stopped");
                    return;
                }
                Err(e) => {
                    let d = backoff.next_delay();
                    warn!(stream = %ctx.id, error = %format!("{e:#}"), backoff_ms = d.as_millis() as u64, "namespace relist failed");
                    if !pause(&cancel, d).await {
                        return;
                    }
                    continue;
                }
            }
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            r = ctx.source().watch_namespaces(None, &rv, tuning.namespace_timeout_secs) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if is_terminal_error(&e) => {
                warn!(stream = %ctx.id, error = %format!("{e:#}"), "namespace watch refused; cluster watcher stopped");
                return;
            }
            Err(e) => {
                let d = backoff.next_delay();
                warn!(stream = %ctx.id, error = %format!("{e:#}"), backoff_ms = d.as_millis() as u64, "namespace watch failed");
                rv.clear();
                if !pause(&cancel, d).await {
                    return;
                }
                continue;
            }
        };

        let mut failed = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            let (kind, obj) = match item {
                None => break,
                Some(Ok(RawEvent::Added(o))) => (ResourceEventType::Added, o),
                Some(Ok(RawEvent::Modified(o))) => (ResourceEventType::Modified, o),
                Some(Ok(RawEvent::Deleted(o))) => (ResourceEventType::Deleted, o),
                Some(Ok(RawEvent::Bookmark { resource_version })) => {
                    rv = resource_version;
                    continue;
                }
                Some(Ok(RawEvent::Error { code: 410, .. })) => {
                    info!(stream = %ctx.id, "namespace resource version expired; relisting");
                    rv.clear();
                    break;
                }
                Some(Ok(RawEvent::Error { code, message })) => {
                    warn!(stream = %ctx.id, code, message = %message, "namespace watch error");
                    if matches!(code, 401 | 403 | 405) {
                        return;
                    }
                    failed = true;
                    break;
                }
                Some(Err(e)) => {
                    warn!(stream = %ctx.id, error = %format!("{e:#}"), "namespace watch error");
                    if is_terminal_error(&e) {
                        return;
                    }
                    failed = true;
                    break;
                }
            };
            backoff.reset();
            if let Some(v) = obj.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
                rv = v.to_string();
            }
            let Some(name) = name_of(&obj).filter(|n| is_visible_namespace(n)).map(str::to_string) else { continue };
            let labels = labels_of(&obj);
            ctx.forward(ResourceEvent::object(kind, &name, NAMESPACES_RESOURCE, obj));
            match kind {
                ResourceEventType::Added => {
                    info!(stream = %ctx.id, ns = %name, "namespace added; starting watchers");
                    start_namespace(&ctx, &name, labels, &resources);
                }
                ResourceEventType::Deleted => {
                    info!(stream = %ctx.id, ns = %name, "namespace deleted; stopping watchers");
                    ctx.stop_namespace(&name);
                }
                _ => {}
            }
        }
        if failed {
            rv.clear();
            let d = backoff.next_delay();
            if !pause(&cancel, d).await {
                return;
            }
        } else if !rv.is_empty() && !pause(&cancel, tuning.reconnect_pause).await {
            return;
        }
    }
}
