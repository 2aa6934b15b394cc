use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::PolicyIntent;

pub const CLUSTER_NAME_LABEL: &str = "kubernetes.io/cluster-name";

/// Human-readable targeting summary of a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Derived {
    pub clusters: Vec<String>,
    pub workloads: Vec<String>,
}

/// Insertion-ordered list that ignores repeats.
#[derive(Default)]
struct Ordered {
    seen: FxHashSet<String>,
    items: Vec<String>,
}

impl Ordered {
    fn push(&mut self, s: String) {
        if self.seen.insert(s.clone()) {
            self.items.push(s);
        }
    }
}

pub fn derive(intent: &PolicyIntent) -> Derived {
    let mut clusters = Ordered::default();
    for selector in &intent.cluster_selectors {
        if let Some(name) = selector.get(CLUSTER_NAME_LABEL) {
            clusters.push(name.clone());
        }
        for (k, v) in selector.iter().filter(|(k, _)| k.as_str() != CLUSTER_NAME_LABEL) {
            clusters.push(format!("{k}:{v}"));
        }
    }

    let mut workloads = Ordered::default();
    for (i, resource) in intent.resources.iter().enumerate() {
        let group = match intent.api_groups.get(i).map(String::as_str) {
            Some(g) if !g.is_empty() => g,
            _ => "core",
        };
        let resource = resource.to_lowercase();
        if intent.namespaces.is_empty() {
            workloads.push(format!("{group}/{resource}"));
        } else {
            for ns in &intent.namespaces {
                workloads.push(format!("{group}/{resource} (ns:{ns})"));
            }
        }
    }
    for w in &intent.specific_workloads {
        let mut line = format!("Specific: {}/{}", w.api_version, w.kind);
        if !w.name.is_empty() {
            line.push_str(&format!(": {}", w.name));
        }
        if !w.namespace.is_empty() {
            line.push_str(&format!(" (ns:{})", w.namespace));
        }
        workloads.push(line);
    }

    Derived { clusters: clusters.items, workloads: workloads.items }
}
