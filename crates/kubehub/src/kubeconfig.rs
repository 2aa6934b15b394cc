//! Parsing of operator-supplied kubeconfig documents.

use kube::config::Kubeconfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("failed to parse kubeconfig: {0}")]
    Parse(String),
    #[error("kubeconfig has no current-context")]
    NoCurrentContext,
    #[error("current-context {0:?} is not defined in kubeconfig")]
    UnknownContext(String),
}

/// A kubeconfig with its current context resolved.
#[derive(Debug, Clone)]
pub struct ParsedKubeconfig {
    pub config: Kubeconfig,
    pub context: String,
    /// Cluster referenced by the current context; this is the cluster's identity.
    pub cluster: String,
}

pub fn parse_kubeconfig(doc: &str) -> Result<ParsedKubeconfig, KubeconfigError> {
    if doc.trim().is_empty() {
        return Err(KubeconfigError::Parse("empty document".into()));
    }
    let config = Kubeconfig::from_yaml(doc).map_err(|e| KubeconfigError::Parse(e.to_string()))?;
    let context = config
        .current_context
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or(KubeconfigError::NoCurrentContext)?;
    let cluster = config
        .contexts
        .iter()
        .find(|c| c.name == context)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| KubeconfigError::UnknownContext(context.clone()))?;
    Ok(ParsedKubeconfig { config, context, cluster })
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"
apiVersion: v1
kind: Config
current-context: demo-admin
clusters:
- name: demoC
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: demo-admin
  context:
    cluster: demoC
    user: admin
users:
- name: admin
  user:
    token: abc
"#;
