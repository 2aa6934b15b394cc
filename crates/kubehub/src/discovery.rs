//! Watchable-resource discovery over the server's preferred group versions.

use std::time::Instant;

use anyhow::{anyhow, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::Client;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use stellar_core::{Gvr, Priority, WatchableResource};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Discovered {
    /// Ordered High, Medium, Low.
    pub resources: Vec<WatchableResource>,
    /// Some groups failed to answer; `resources` holds what was retrieved.
    pub partial: bool,
}

/// Filter one APIResourceList down to namespaced, watchable, non-skipped resources.
pub fn watchable_from(group: &str, version: &str, resources: &[APIResource]) -> Vec<WatchableResource> {
    resources
        .iter()
        .filter(|r| r.namespaced && r.verbs.iter().any(|v| v == "watch"))
        .filter_map(|r| {
            Priority::classify(&r.name).map(|priority| WatchableResource {
                gvr: Gvr::new(group, version, r.name.clone()),
                kind: r.kind.clone(),
                priority,
            })
        })
        .collect()
}

/// Walk core/v1 and every group's preferred version. Per-group failures are
/// logged and yield a partial result; only a total failure is an error.
pub async fn discover_watchable(client: &Client) -> Result<Discovered> {
    let started = Instant::now();
    let mut out: Vec<WatchableResource> = Vec::new();
    let mut partial = false;
    let mut first_err: Option<anyhow::Error> = None;

    match client.list_core_api_versions().await {
        Ok(versions) => {
            if let Some(version) = versions.versions.first() {
                match client.list_core_api_resources(version).await {
                    Ok(list) => out.extend(watchable_from("", version, &list.resources)),
                    Err(e) => {
                        warn!(version = %version, error = %e, "core resources discovery failed");
                        partial = true;
                        first_err.get_or_insert(e.into());
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "core api versions discovery failed");
            partial = true;
            first_err.get_or_insert(e.into());
        }
    }

    match client.list_api_groups().await {
        Ok(groups) => {
            for group in groups.groups {
                let Some(gv) = group.preferred_version.clone().or_else(|| group.versions.first().cloned()) else {
                    continue;
                };
                match client.list_api_group_resources(&gv.group_version).await {
                    Ok(list) => out.extend(watchable_from(&group.name, &gv.version, &list.resources)),
                    Err(e) => {
                        warn!(group_version = %gv.group_version, error = %e, "group discovery failed; continuing");
                        partial = true;
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "api groups discovery failed");
            partial = true;
            first_err.get_or_insert(e.into());
        }
    }

    if out.is_empty() {
        if let Some(e) = first_err {
            return Err(e);
        }
        if partial {
            return Err(anyhow!("discovery returned no resources"));
        }
    }
    // stable sort keeps server order within a priority
    out.sort_by_key(|r| r.priority);
    let took_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("discovery_latency_ms", took_ms);
    info!(count = out.len(), partial, took_ms = took_ms as u64, "watchable resources discovered");
    Ok(Discovered { resources: out, partial })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(name: &str, namespaced: bool, verbs: &[&str]) -> APIResource {
        APIResource {
            name: name.into(),
            namespaced,
            kind: "Kind".into(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn filters_scope_verbs_subresources_and_skips() {
        let list = vec![
            res("pods", true, &["get", "list", "watch"]),
            res("pods/log", true, &["get"]),
            res("pods/status", true, &["get", "watch"]),
            res("nodes", false, &["list", "watch"]),
            res("events", true, &["list", "watch"]),
            res("bindings", true, &["create"]),
            res("configmaps", true, &["list", "watch"]),
            res("podtemplates", true, &["list", "watch"]),
        ];
        let got = watchable_from("", "v1", &list);
        let names: Vec<_> = got.iter().map(|r| (r.gvr.resource.as_str(), r.priority)).collect();
        assert_eq!(
            names,
            vec![("pods", Priority::High), ("configmaps", Priority::Medium), ("podtemplates", Priority::Low)]
        );
        assert_eq!(got[0].gvr.key(), ".v1/pods");
    }
}
