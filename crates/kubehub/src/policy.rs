//! KubeStellar `BindingPolicy` objects in the workload description space.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde_json::Value;

#[async_trait]
pub trait PolicyBackend: Send + Sync {
    async fn create(&self, document: &Value) -> Result<Value>;
    async fn get(&self, name: &str) -> Result<Option<Value>>;
    async fn list(&self) -> Result<Vec<Value>>;
    async fn delete(&self, name: &str) -> Result<()>;
}

pub const BINDING_POLICY_API_VERSION: &str = "control.kubestellar.io/v1alpha1";
pub const BINDING_POLICY_KIND: &str = "BindingPolicy";

fn binding_policy_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("control.kubestellar.io", "v1alpha1", BINDING_POLICY_KIND);
    ApiResource::from_gvk_with_plural(&gvk, "bindingpolicies")
}

/// Binding policies are cluster scoped.
pub struct KubePolicyBackend {
    api: Api<DynamicObject>,
}

impl KubePolicyBackend {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all_with(client, &binding_policy_resource()) }
    }
}

#[async_trait]
impl PolicyBackend for KubePolicyBackend {
    async fn create(&self, document: &Value) -> Result<Value> {
        let obj: DynamicObject = serde_json::from_value(document.clone()).context("decoding binding policy")?;
        let created = self.api.create(&PostParams::default(), &obj).await.context("creating binding policy")?;
        Ok(serde_json::to_value(created)?)
    }

    async fn get(&self, name: &str) -> Result<Option<Value>> {
        let found = self.api.get_opt(name).await.with_context(|| format!("getting binding policy {name}"))?;
        found.map(serde_json::to_value).transpose().map_err(Into::into)
    }

    async fn list(&self) -> Result<Vec<Value>> {
        let list = self.api.list(&ListParams::default()).await.context("listing binding policies")?;
        list.items.iter().map(|o| serde_json::to_value(o).map_err(Into::into)).collect()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting binding policy {name}"))?;
        Ok(())
    }
}
