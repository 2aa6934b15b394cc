//! Connectivity probe for clusters being onboarded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    config::KubeConfigOptions,
    Client, Config,
};

use crate::ParsedKubeconfig;

#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Reach the cluster described by `kubeconfig`; returns its node count.
    async fn probe(&self, kubeconfig: &ParsedKubeconfig) -> Result<usize>;
}

/// Lists nodes with a client built from the supplied document.
#[derive(Debug, Default, Clone, Copy)]
pub struct KubeProbe;

#[async_trait]
impl ClusterProbe for KubeProbe {
    async fn probe(&self, kubeconfig: &ParsedKubeconfig) -> Result<usize> {
        let opts = KubeConfigOptions { context: Some(kubeconfig.context.clone()), ..Default::default() };
        let config = Config::from_custom_kubeconfig(kubeconfig.config.clone(), &opts)
            .await
            .context("building REST config from kubeconfig")?;
        let client = Client::try_from(config).context("creating client")?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes.list(&ListParams::default()).await.context("listing nodes")?;
        Ok(list.items.len())
    }
}
