//! GVR-addressed list/watch against the workload cluster.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, TypeMeta},
    Client,
};
use serde::Serialize;
use serde_json::Value;
use stellar_core::WatchableResource;

use crate::{discover_watchable, strip_managed_fields, Discovered};

/// One decoded watch notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Bookmark { resource_version: String },
    /// Error object delivered inside the watch stream (e.g. 410 Gone).
    Error { code: u16, message: String },
}

pub type EventStream = BoxStream<'static, Result<RawEvent>>;

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<Value>,
    pub resource_version: String,
}

/// The workload cluster as seen by the watcher engine.
#[async_trait]
pub trait ResourceSource: Send + Sync + 'static {
    async fn discover(&self) -> Result<Discovered>;
    async fn list_namespaces(&self) -> Result<ListPage>;
    /// Watch namespaces; `name` narrows to one via `metadata.name` field selector.
    async fn watch_namespaces(&self, name: Option<&str>, resource_version: &str, timeout_secs: u32) -> Result<EventStream>;
    async fn list(&self, namespace: &str, resource: &WatchableResource) -> Result<ListPage>;
    async fn watch(&self, namespace: &str, resource: &WatchableResource, resource_version: &str, timeout_secs: u32)
        -> Result<EventStream>;
}

/// kube-rs backed source over the dynamic API.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_resource(resource: &WatchableResource) -> ApiResource {
        ApiResource {
            group: resource.gvr.group.clone(),
            version: resource.gvr.version.clone(),
            api_version: resource.gvr.api_version(),
            kind: resource.kind.clone(),
            plural: resource.gvr.resource.clone(),
        }
    }
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value> {
    let mut v = serde_json::to_value(obj).context("serializing object")?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn convert<K: Serialize>(ev: kube::Result<WatchEvent<K>>) -> Result<RawEvent> {
    Ok(match ev? {
        WatchEvent::Added(o) => RawEvent::Added(to_value(&o)?),
        WatchEvent::Modified(o) => RawEvent::Modified(to_value(&o)?),
        WatchEvent::Deleted(o) => RawEvent::Deleted(to_value(&o)?),
        WatchEvent::Bookmark(b) => RawEvent::Bookmark { resource_version: b.metadata.resource_version },
        WatchEvent::Error(e) => RawEvent::Error { code: e.code, message: e.message },
    })
}

fn watch_params(timeout_secs: u32) -> WatchParams {
    // the API server rejects timeouts of 295s and above
    WatchParams::default().timeout(timeout_secs.min(290))
}

#[async_trait]
impl ResourceSource for KubeSource {
    async fn discover(&self) -> Result<Discovered> {
        discover_watchable(&self.client).await
    }

    async fn list_namespaces(&self) -> Result<ListPage> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing namespaces")?;
        let items = list
            .items
            .iter()
            .map(|ns| {
                let mut v = to_value(ns)?;
                if let Some(obj) = v.as_object_mut() {
                    obj.entry("apiVersion").or_insert_with(|| Value::from("v1"));
                    obj.entry("kind").or_insert_with(|| Value::from("Namespace"));
                }
                Ok(v)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ListPage { items, resource_version: list.metadata.resource_version.unwrap_or_default() })
    }

    async fn watch_namespaces(&self, name: Option<&str>, resource_version: &str, timeout_secs: u32) -> Result<EventStream> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut wp = watch_params(timeout_secs);
        if let Some(name) = name {
            wp = wp.fields(&format!("metadata.name={name}"));
        }
        let stream = api.watch(&wp, resource_version).await.context("watching namespaces")?;
        Ok(stream.map(convert).boxed())
    }

    async fn list(&self, namespace: &str, resource: &WatchableResource) -> Result<ListPage> {
        let ar = Self::api_resource(resource);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {} in {namespace}", resource.gvr))?;
        let items = list
            .items
            .into_iter()
            .map(|mut o| {
                if o.types.is_none() && !ar.kind.is_empty() {
                    o.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
                }
                to_value(&o)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ListPage { items, resource_version: list.metadata.resource_version.unwrap_or_default() })
    }

    async fn watch(&self, namespace: &str, resource: &WatchableResource, resource_version: &str, timeout_secs: u32)
        -> Result<EventStream> {
        let ar = Self::api_resource(resource);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let stream = api
            .watch(&watch_params(timeout_secs), resource_version)
            .await
            .with_context(|| format!("watching {} in {namespace}", resource.gvr))?;
        Ok(stream.map(convert).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_timeout_is_clamped_below_server_limit() {
        assert_eq!(watch_params(300).timeout, Some(290));
        assert_eq!(watch_params(60).timeout, Some(60));
    }
}
