//! BindingPolicy documents: parsing into intent, rendering from intent, status.

use serde_json::{json, Map, Value};
use stellar_core::{name_of, namespace_of, LabelMap};

use crate::{PolicyError, PolicyIntent, WorkloadRef};

pub const MAX_DOCUMENT_BYTES: usize = 1_000_000;

const API_VERSION: &str = "control.kubestellar.io/v1alpha1";
const KIND: &str = "BindingPolicy";

fn strings(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn string_map(v: Option<&Value>) -> LabelMap {
    v.and_then(Value::as_object)
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Parse a YAML BindingPolicy. Returns the JSON document to submit and the intent it carries.
pub fn parse_document(yaml: &str) -> Result<(Value, PolicyIntent), PolicyError> {
    if yaml.len() > MAX_DOCUMENT_BYTES {
        return Err(PolicyError::InvalidDocument(format!("document exceeds {MAX_DOCUMENT_BYTES} bytes")));
    }
    let mut doc: Value = serde_yaml::from_str(yaml).map_err(|e| PolicyError::InvalidDocument(e.to_string()))?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| PolicyError::InvalidDocument("expected a mapping at the top level".into()))?;
    obj.entry("apiVersion").or_insert_with(|| Value::from(API_VERSION));
    let kind = obj.entry("kind").or_insert_with(|| Value::from(KIND));
    if kind.as_str() != Some(KIND) {
        return Err(PolicyError::InvalidDocument(format!("expected kind {KIND}, got {kind}")));
    }
    let intent = intent_from_object(&doc, yaml.to_string())?;
    Ok((doc, intent))
}

/// Read intent out of a BindingPolicy object (`spec.clusterSelectors[].matchLabels`,
/// `spec.downsync[]`, `spec.workloads[]`).
pub fn intent_from_object(obj: &Value, raw_document: String) -> Result<PolicyIntent, PolicyError> {
    let name = name_of(obj).filter(|n| !n.is_empty()).ok_or(PolicyError::MissingName)?.to_string();
    let namespace = namespace_of(obj).filter(|n| !n.is_empty()).unwrap_or("default").to_string();
    let spec = obj.get("spec").cloned().unwrap_or(Value::Null);

    let cluster_selectors = spec
        .get("clusterSelectors")
        .and_then(Value::as_array)
        .map(|sels| sels.iter().map(|s| string_map(s.get("matchLabels"))).filter(|m| !m.is_empty()).collect())
        .unwrap_or_default();

    let mut api_groups = Vec::new();
    let mut resources = Vec::new();
    let mut namespaces: Vec<String> = Vec::new();
    for rule in spec.get("downsync").and_then(Value::as_array).into_iter().flatten() {
        let group = str_field(rule, "apiGroup");
        for resource in strings(rule.get("resources")) {
            api_groups.push(group.clone());
            resources.push(resource);
        }
        for ns in strings(rule.get("namespaces")) {
            if !namespaces.contains(&ns) {
                namespaces.push(ns);
            }
        }
    }

    let specific_workloads = spec
        .get("workloads")
        .and_then(Value::as_array)
        .map(|ws| {
            ws.iter()
                .map(|w| WorkloadRef {
                    api_version: str_field(w, "apiVersion"),
                    kind: str_field(w, "kind"),
                    name: str_field(w, "name"),
                    namespace: str_field(w, "namespace"),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(PolicyIntent { name, namespace, cluster_selectors, api_groups, resources, namespaces, specific_workloads, raw_document })
}

/// Render a BindingPolicy manifest for an intent built outside a YAML document.
pub fn to_document(intent: &PolicyIntent) -> Value {
    let selectors: Vec<Value> = intent.cluster_selectors.iter().map(|s| json!({ "matchLabels": s })).collect();
    let downsync: Vec<Value> = intent
        .resources
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let mut rule = Map::new();
            rule.insert("apiGroup".into(), Value::from(intent.api_groups.get(i).cloned().unwrap_or_default()));
            rule.insert("resources".into(), json!([r.to_lowercase()]));
            if !intent.namespaces.is_empty() {
                rule.insert("namespaces".into(), json!(intent.namespaces));
            }
            Value::Object(rule)
        })
        .collect();
    let mut spec = Map::new();
    spec.insert("clusterSelectors".into(), Value::Array(selectors));
    spec.insert("downsync".into(), Value::Array(downsync));
    if !intent.specific_workloads.is_empty() {
        spec.insert("workloads".into(), json!(intent.specific_workloads));
    }
    json!({
        "apiVersion": API_VERSION,
        "kind": KIND,
        "metadata": { "name": intent.name },
        "spec": spec,
    })
}

/// `Active` when Ready is True, `Inactive` when conditions exist without it, else `Pending`.
pub fn policy_status(obj: &Value) -> &'static str {
    let conditions = obj.pointer("/status/conditions").and_then(Value::as_array);
    match conditions {
        Some(cs) if !cs.is_empty() => {
            let ready = cs.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready") && c.get("status").and_then(Value::as_str) == Some("True")
            });
            if ready {
                "Active"
            } else {
                "Inactive"
            }
        }
        _ => "Pending",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive;

    const DOC: &str = r#"
apiVersion: control.kubestellar.io/v1alpha1
kind: BindingPolicy
metadata:
  name: nginx-bp
spec:
  clusterSelectors:
  - matchLabels:
      location-group: edge
      kubernetes.io/cluster-name: cluster1
  downsync:
  - apiGroup: apps
    resources: [deployments]
    namespaces: [nginx]
  - resources: [ConfigMaps, services]
    namespaces: [nginx, web]
  workloads:
  - apiVersion: apps/v1
    kind: Deployment
    name: nginx
    namespace: nginx
"#;

    #[test]
    fn parses_intent_from_yaml() {
        let (doc, intent) = parse_document(DOC).expect("parse");
        assert_eq!(doc["kind"], "BindingPolicy");
        assert_eq!(intent.name, "nginx-bp");
        assert_eq!(intent.namespace, "default");
        assert_eq!(intent.api_groups, vec!["apps", "", ""]);
        assert_eq!(intent.resources, vec!["deployments", "ConfigMaps", "services"]);
        assert_eq!(intent.namespaces, vec!["nginx", "web"]);
        assert_eq!(intent.raw_document, DOC);

        let d = derive(&intent);
        assert_eq!(d.clusters, vec!["cluster1", "location-group:edge"]);
        assert_eq!(
            d.workloads,
            vec![
                "apps/deployments (ns:nginx)",
                "apps/deployments (ns:web)",
                "core/configmaps (ns:nginx)",
                "core/configmaps (ns:web)",
                "core/services (ns:nginx)",
                "core/services (ns:web)",
                "Specific: apps/v1/Deployment: nginx (ns:nginx)",
            ]
        );
    }

    #[test]
    fn name_is_required() {
        let err = parse_document("kind: BindingPolicy\nmetadata: {}\n").expect_err("no name");
        assert_eq!(err, PolicyError::MissingName);
    }

    #[test]
    fn rejects_other_kinds_and_non_mappings() {
        assert!(matches!(parse_document("kind: Deployment\nmetadata: {name: x}\n"), Err(PolicyError::InvalidDocument(_))));
        assert!(matches!(parse_document("- a\n- b\n"), Err(PolicyError::InvalidDocument(_))));
        assert!(matches!(parse_document("key: [unclosed"), Err(PolicyError::InvalidDocument(_))));
    }

    #[test]
    fn rendered_document_reparses_to_same_targets() {
        let intent = PolicyIntent {
            name: "p".into(),
            namespace: "default".into(),
            cluster_selectors: vec![[("env".to_string(), "prod".to_string())].into_iter().collect()],
            api_groups: vec!["apps".into()],
            resources: vec!["Deployment".into()],
            namespaces: vec!["n1".into()],
            ..Default::default()
        };
        let doc = to_document(&intent);
        let back = intent_from_object(&doc, String::new()).expect("intent");
        assert_eq!(derive(&back), derive(&intent));
    }

    #[test]
    fn status_from_conditions() {
        assert_eq!(policy_status(&json!({})), "Pending");
        assert_eq!(policy_status(&json!({"status": {"conditions": []}})), "Pending");
        assert_eq!(
            policy_status(&json!({"status": {"conditions": [{"type": "Synced", "status": "True"}]}})),
            "Inactive"
        );
        assert_eq!(
            policy_status(&json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}})),
            "Active"
        );
    }
}
