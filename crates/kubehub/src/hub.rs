//! OCM hub access: `managedclusters` existence, deletion and listing.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stellar_core::{labels_of, name_of, LabelMap};
use tracing::debug;

use crate::ContextProvider;

/// Operations the lifecycle manager needs from the hub.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn managed_cluster_exists(&self, name: &str) -> Result<bool>;
    async fn delete_managed_cluster(&self, name: &str) -> Result<()>;
    async fn list_managed_clusters(&self) -> Result<Vec<ManagedClusterInfo>>;
}

/// Resolves a client for the configured hub context.
#[async_trait]
pub trait HubConnector: Send + Sync {
    fn context(&self) -> Option<&str>;
    async fn connect(&self) -> Result<Arc<dyn HubClient>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterInfo {
    pub name: String,
    pub labels: LabelMap,
    pub available: bool,
    pub joined: bool,
    pub creation_timestamp: Option<String>,
}

fn condition_true(obj: &Value, kind: &str) -> bool {
    obj.pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|cs| {
            cs.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind) && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Summarize an unstructured `ManagedCluster`.
pub fn managed_cluster_info(obj: &Value) -> ManagedClusterInfo {
    ManagedClusterInfo {
        name: name_of(obj).unwrap_or_default().to_string(),
        labels: labels_of(obj),
        available: condition_true(obj, "ManagedClusterConditionAvailable"),
        joined: condition_true(obj, "ManagedClusterJoined"),
        creation_timestamp: obj.pointer("/metadata/creationTimestamp").and_then(Value::as_str).map(str::to_string),
    }
}

fn managed_cluster_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("cluster.open-cluster-management.io", "v1", "ManagedCluster");
    ApiResource::from_gvk_with_plural(&gvk, "managedclusters")
}

/// kube-rs backed hub client (`/apis/cluster.open-cluster-management.io/v1/managedclusters`).
pub struct KubeHub {
    api: Api<DynamicObject>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all_with(client, &managed_cluster_resource()) }
    }
}

#[async_trait]
impl HubClient for KubeHub {
    async fn managed_cluster_exists(&self, name: &str) -> Result<bool> {
        let found = self.api.get_opt(name).await.with_context(|| format!("getting managedcluster {name}"))?;
        debug!(cluster = %name, exists = found.is_some(), "managedcluster lookup");
        Ok(found.is_some())
    }

    async fn delete_managed_cluster(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting managedcluster {name}"))?;
        Ok(())
    }

    async fn list_managed_clusters(&self) -> Result<Vec<ManagedClusterInfo>> {
        let list = self.api.list(&ListParams::default()).await.context("listing managedclusters")?;
        list.items
            .iter()
            .map(|o| Ok(managed_cluster_info(&serde_json::to_value(o)?)))
            .collect()
    }
}

/// Connects to the hub through the shared context provider.
pub struct KubeHubConnector {
    provider: Arc<ContextProvider>,
    context: Option<String>,
}

impl KubeHubConnector {
    pub fn new(provider: Arc<ContextProvider>, context: Option<String>) -> Self {
        Self { provider, context }
    }
}

#[async_trait]
impl HubConnector for KubeHubConnector {
    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    async fn connect(&self) -> Result<Arc<dyn HubClient>> {
        let ctx = self.context.as_deref().ok_or_else(|| anyhow!("hub context not configured"))?;
        let client = self.provider.client(Some(ctx)).await?;
        Ok(Arc::new(KubeHub::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summarizes_conditions_and_labels() {
        let obj = json!({
            "metadata": {"name": "cluster1", "labels": {"location-group": "edge"}, "creationTimestamp": "2024-05-01T10:00:00Z"},
            "status": {"conditions": [
                {"type": "ManagedClusterJoined", "status": "True"},
                {"type": "ManagedClusterConditionAvailable", "status": "Unknown"}
            ]}
        });
        let info = managed_cluster_info(&obj);
        assert_eq!(info.name, "cluster1");
        assert!(info.joined);
        assert!(!info.available);
        assert_eq!(info.labels.get("location-group").map(String::as_str), Some("edge"));
        assert_eq!(info.creation_timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn missing_status_means_not_ready() {
        let info = managed_cluster_info(&json!({"metadata": {"name": "bare"}}));
        assert!(!info.joined && !info.available);
        assert!(info.labels.is_empty());
    }
}
