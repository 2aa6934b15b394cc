//! Stellar kubehub: per-context clients, discovery, list/watch and OCM hub access.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

pub mod discovery;
pub mod hub;
pub mod kubeconfig;
pub mod policy;
pub mod probe;
pub mod source;

pub use discovery::{discover_watchable, watchable_from, Discovered};
pub use hub::{managed_cluster_info, HubClient, HubConnector, KubeHub, KubeHubConnector, ManagedClusterInfo};
pub use kubeconfig::{parse_kubeconfig, KubeconfigError, ParsedKubeconfig};
pub use policy::{KubePolicyBackend, PolicyBackend};
pub use probe::{ClusterProbe, KubeProbe};
pub use source::{EventStream, KubeSource, ListPage, RawEvent, ResourceSource};

/// Hands out one client per kubeconfig context, built lazily and cached.
pub struct ContextProvider {
    kubeconfig_path: Option<PathBuf>,
    clients: Mutex<FxHashMap<String, Client>>,
}

impl ContextProvider {
    pub fn new(kubeconfig_path: Option<PathBuf>) -> Self {
        Self { kubeconfig_path, clients: Mutex::new(FxHashMap::default()) }
    }

    /// Client for `context`, or for the kubeconfig's current context when `None`.
    /// Falls back to in-cluster config when no kubeconfig exists and no context was asked for.
    pub async fn client(&self, context: Option<&str>) -> Result<Client> {
        let key = context.unwrap_or_default().to_string();
        if let Some(c) = self.clients.lock().get(&key) {
            return Ok(c.clone());
        }
        let kubeconfig = match &self.kubeconfig_path {
            Some(path) => Some(Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?),
            None => Kubeconfig::read().ok(),
        };
        let config = match (kubeconfig, context) {
            (Some(kc), _) => {
                let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
                Config::from_custom_kubeconfig(kc, &opts)
                    .await
                    .with_context(|| format!("building config for context {:?}", context.unwrap_or("<current>")))?
            }
            (None, None) => Config::infer().await.context("inferring cluster config")?,
            (None, Some(ctx)) => anyhow::bail!("context {ctx} requested but no kubeconfig was found"),
        };
        debug!(context = %key, url = %config.cluster_url, "client config resolved");
        let client = Client::try_from(config)?;
        self.clients.lock().insert(key.clone(), client.clone());
        info!(context = %context.unwrap_or("<current>"), "kube client ready");
        Ok(client)
    }
}

fn api_status_code(err: &anyhow::Error) -> Option<u16> {
    err.chain().find_map(|e| match e.downcast_ref::<kube::Error>() {
        Some(kube::Error::Api(resp)) => Some(resp.code),
        _ => None,
    })
}

fn error_text(err: &anyhow::Error) -> String {
    format!("{err:#}").to_lowercase()
}

/// Permission failures never heal by retrying.
pub fn is_permission_error(err: &anyhow::Error) -> bool {
    matches!(api_status_code(err), Some(401 | 403)) || {
        let text = error_text(err);
        text.contains("forbidden") || text.contains("unauthorized")
    }
}

/// The API refuses the verb for this resource (e.g. no watch support).
pub fn is_unsupported_error(err: &anyhow::Error) -> bool {
    matches!(api_status_code(err), Some(405)) || {
        let text = error_text(err);
        text.contains("not supported") || text.contains("method not allowed")
    }
}

pub fn is_terminal_error(err: &anyhow::Error) -> bool {
    is_permission_error(err) || is_unsupported_error(err)
}

pub fn is_not_found_error(err: &anyhow::Error) -> bool {
    matches!(api_status_code(err), Some(404)) || error_text(err).contains("not found")
}

pub fn is_conflict_error(err: &anyhow::Error) -> bool {
    matches!(api_status_code(err), Some(409)) || error_text(err).contains("already exists")
}

/// Drop server-side bookkeeping that clients never render.
pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> anyhow::Error {
        anyhow::Error::new(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} for test"),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn classifies_by_status_code() {
        assert!(is_permission_error(&api_err(403, "Forbidden")));
        assert!(is_permission_error(&api_err(401, "Unauthorized")));
        assert!(is_unsupported_error(&api_err(405, "MethodNotAllowed")));
        assert!(is_not_found_error(&api_err(404, "NotFound")));
        assert!(is_conflict_error(&api_err(409, "AlreadyExists")));
        assert!(!is_terminal_error(&api_err(500, "InternalError")));
    }

    #[test]
    fn classifies_by_text() {
        assert!(is_permission_error(&anyhow::anyhow!("pods is forbidden: User cannot watch")));
        assert!(is_unsupported_error(&anyhow::anyhow!("the server does not allow this method: method not allowed")));
        assert!(is_terminal_error(&anyhow::anyhow!("watch is not supported on this resource")));
        assert!(!is_terminal_error(&anyhow::anyhow!("connection reset by peer")));
    }

    #[test]
    fn strips_managed_fields() {
        let mut v = serde_json::json!({"metadata": {"name": "a", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "a");
    }
}
