//! Watchable resources, namespace visibility and the resource-stream event model.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kubernetes labels, ordered by key.
pub type LabelMap = BTreeMap<String, String>;

/// Group/version/resource-plural triple addressing a dynamic API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// Key used in the `resource` field of stream events: `<group>.<version>/<resource>`.
    /// The core group keeps its empty prefix (`.v1/pods`).
    pub fn key(&self) -> String {
        format!("{}.{}/{}", self.group, self.version, self.resource)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Watch priority; derives `Ord` so that sorting yields High, Medium, Low.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

const HIGH_PRIORITY: &[&str] = &["pods", "deployments", "services", "statefulsets", "daemonsets"];
const MEDIUM_PRIORITY: &[&str] = &["configmaps", "secrets", "persistentvolumeclaims", "ingresses", "jobs"];
const SKIPPED: &[&str] = &["events", "leases", "endpointslices", "replicationcontrollers"];

impl Priority {
    /// Classify a resource plural. `None` means the resource is never watched
    /// (skip list or subresource).
    pub fn classify(resource: &str) -> Option<Priority> {
        if resource.contains('/') || SKIPPED.contains(&resource) {
            return None;
        }
        if HIGH_PRIORITY.contains(&resource) {
            Some(Priority::High)
        } else if MEDIUM_PRIORITY.contains(&resource) {
            Some(Priority::Medium)
        } else {
            Some(Priority::Low)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchableResource {
    #[serde(flatten)]
    pub gvr: Gvr,
    /// Kind reported by discovery; list items lack their own type meta.
    #[serde(default)]
    pub kind: String,
    pub priority: Priority,
}

/// Namespaces hidden from the resource stream.
const SYSTEM_NAMESPACES: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

pub fn is_visible_namespace(name: &str) -> bool {
    !(SYSTEM_NAMESPACES.contains(&name) || name.starts_with("openshift-") || name.starts_with("system-"))
}

pub fn name_of(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(Value::as_str)
}

pub fn namespace_of(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/namespace").and_then(Value::as_str)
}

/// `metadata.labels` of an unstructured object; non-string values are ignored.
pub fn labels_of(obj: &Value) -> LabelMap {
    obj.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

/// Set inequality on key/value pairs.
pub fn labels_differ(prev: &LabelMap, next: &LabelMap) -> bool {
    prev != next
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceEventType {
    InitialData,
    Watching,
    Added,
    Modified,
    Deleted,
    ResourceLabelChanged,
    LabelChanged,
    Status,
}

/// One message on the resource stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceEvent {
    #[serde(rename = "type")]
    pub kind: ResourceEventType,
    pub object: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelMap>,
    #[serde(rename = "labelCount", default, skip_serializing_if = "Option::is_none")]
    pub label_count: Option<usize>,
}

/// Resource tag of cluster-wide namespace events.
pub const NAMESPACES_RESOURCE: &str = "v1/namespaces";
/// Resource tag of namespace label changes.
pub const NAMESPACE_LABELS_RESOURCE: &str = "namespace.labels";

impl ResourceEvent {
    fn control(kind: ResourceEventType, object: Value) -> Self {
        Self { kind, object, namespace: String::new(), resource: String::new(), labels: None, label_count: None }
    }

    pub fn initial_data(namespaces: Vec<Value>) -> Self {
        Self::control(ResourceEventType::InitialData, Value::Array(namespaces))
    }

    pub fn watching() -> Self {
        Self::control(ResourceEventType::Watching, json!({ "message": "Starting resource watchers" }))
    }

    pub fn status(active_watchers: usize, events_processed: u64) -> Self {
        Self::control(
            ResourceEventType::Status,
            json!({
                "activeWatchers": active_watchers,
                "eventsProcessed": events_processed,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
    }

    /// ADDED/MODIFIED/DELETED for an object; labels are read from the object.
    pub fn object(kind: ResourceEventType, namespace: &str, resource: impl Into<String>, object: Value) -> Self {
        let labels = labels_of(&object);
        Self {
            kind,
            namespace: namespace.to_string(),
            resource: resource.into(),
            label_count: Some(labels.len()),
            labels: Some(labels),
            object,
        }
    }

    /// Label-only events carry the label map as their object.
    pub fn labels_changed(kind: ResourceEventType, namespace: &str, resource: impl Into<String>, labels: LabelMap) -> Self {
        let object = serde_json::to_value(&labels).unwrap_or(Value::Null);
        Self {
            kind,
            object,
            namespace: namespace.to_string(),
            resource: resource.into(),
            label_count: Some(labels.len()),
            labels: Some(labels),
        }
    }

    pub fn object_name(&self) -> Option<&str> {
        name_of(&self.object)
    }
}
