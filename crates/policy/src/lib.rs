//! Stellar policy: author intent of binding policies and what they target.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stellar_core::LabelMap;
use thiserror::Error;
use tracing::debug;

mod derive;
mod document;

pub use derive::{derive, Derived, CLUSTER_NAME_LABEL};
pub use document::{intent_from_object, parse_document, policy_status, to_document, MAX_DOCUMENT_BYTES};

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("invalid binding policy document: {0}")]
    InvalidDocument(String),
    #[error("binding policy has no metadata.name")]
    MissingName,
}

/// A single named object selected by a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// What the author asked for, independent of how the hub later normalizes the object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyIntent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub cluster_selectors: Vec<LabelMap>,
    /// Positionally aligned with `resources`.
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub specific_workloads: Vec<WorkloadRef>,
    #[serde(default)]
    pub raw_document: String,
}

/// Process-lifetime intent store keyed by policy name.
#[derive(Default)]
pub struct IntentCache {
    inner: RwLock<FxHashMap<String, Arc<PolicyIntent>>>,
}

impl IntentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, intent: PolicyIntent) {
        let mut inner = self.inner.write();
        inner.insert(name.to_string(), Arc::new(intent));
        gauge!("policy_intents", inner.len() as f64);
        debug!(policy = %name, "intent recorded");
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<PolicyIntent>> {
        self.inner.read().get(name).cloned()
    }

    pub fn forget(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.remove(name).is_some();
        gauge!("policy_intents", inner.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive from the cached intent, else from the object the hub returned.
    pub fn derive_for(&self, name: &str, object: Option<&Value>) -> Option<Derived> {
        if let Some(intent) = self.lookup(name) {
            return Some(derive(&intent));
        }
        let intent = intent_from_object(object?, String::new()).ok()?;
        Some(derive(&intent))
    }
}
