//! Stellar core types shared by the lifecycle, journal, watcher and policy crates.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod resources;

pub use resources::{
    is_visible_namespace, labels_differ, labels_of, name_of, namespace_of, Gvr, LabelMap, Priority, ResourceEvent,
    ResourceEventType, WatchableResource, NAMESPACES_RESOURCE, NAMESPACE_LABELS_RESOURCE,
};

/// Lifecycle state of a cluster as tracked by the status board.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ClusterStatus {
    Pending,
    Onboarded,
    Failed,
    Detaching,
    Detached,
    DetachmentFailed,
}

impl ClusterStatus {
    /// A workflow is still running for the cluster.
    pub fn is_in_progress(self) -> bool {
        matches!(self, ClusterStatus::Pending | ClusterStatus::Detaching)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Pending => "Pending",
            ClusterStatus::Onboarded => "Onboarded",
            ClusterStatus::Failed => "Failed",
            ClusterStatus::Detaching => "Detaching",
            ClusterStatus::Detached => "Detached",
            ClusterStatus::DetachmentFailed => "DetachmentFailed",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusEntry {
    pub cluster_name: String,
    pub status: ClusterStatus,
}

/// A single journal record. `status` is an uninterpreted stage tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub cluster_name: String,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(cluster_name: impl Into<String>, status: impl Into<String>, message: impl Into<String>) -> Self {
        Self { cluster_name: cluster_name.into(), status: status.into(), message: message.into(), timestamp: Utc::now() }
    }
}

/// Message tag of the synthetic event sent to a subscriber right after its replay.
pub const CURRENT_STATUS_MESSAGE: &str = "Current status";

/// Which stream a subscriber is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Lifecycle,
    Resources,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Lifecycle => f.write_str("lifecycle"),
            StreamKind::Resources => f.write_str("resources"),
        }
    }
}

pub mod prelude {
    pub use super::{
        ClusterStatus, ClusterStatusEntry, Gvr, LabelMap, LifecycleEvent, Priority, ResourceEvent, ResourceEventType, StreamKind,
        WatchableResource,
    };
}
