//! Stellar ops: cluster onboarding and detachment workflows.
//!
//! Both workflows run as background tasks and report every stage into the
//! lifecycle journal; the HTTP layer only sees acceptance or refusal.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use metrics::{counter, histogram};
use stellar_core::{ClusterStatus, ClusterStatusEntry};
use stellar_kubehub::{parse_kubeconfig, ClusterProbe, HubClient, HubConnector, KubeconfigError, ParsedKubeconfig};
use stellar_store::{EventHub, StatusBoard};
use thiserror::Error;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

/// Journal stage tags.
pub mod stage {
    pub const STARTED: &str = "Started";
    pub const CONNECTING: &str = "Connecting";
    pub const CONNECTED: &str = "Connected";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const DETACHING: &str = "Detaching";
    pub const CHECKING: &str = "Checking";
    pub const FOUND: &str = "Found";
    pub const NOT_FOUND: &str = "NotFound";
    pub const EXECUTING: &str = "Executing";
    pub const COMMAND_EXECUTED: &str = "CommandExecuted";
    pub const WAITING: &str = "Waiting";
    pub const REMOVED: &str = "Removed";
    pub const SUCCESS: &str = "Success";
    pub const ERROR: &str = "Error";
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    InvalidKubeconfig(#[from] KubeconfigError),
    #[error("invalid cluster name {0:?}")]
    InvalidName(String),
    #[error("cluster {0} not found")]
    NotFound(String),
    #[error("cluster {name} is {status}; wait for the running operation to finish")]
    InProgress { name: String, status: ClusterStatus },
    #[error("{0:#}")]
    Hub(anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct OnboardTuning {
    pub probe_timeout: Duration,
}

impl Default for OnboardTuning {
    fn default() -> Self {
        Self { probe_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetachTuning {
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Deadline of each hub get/delete call.
    pub fetch_timeout: Duration,
}

impl Default for DetachTuning {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(10), deadline: Duration::from_secs(300), fetch_timeout: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardOutcome {
    Accepted,
    AlreadyPresent(ClusterStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Onboarding {
    pub cluster: String,
    pub outcome: OnboardOutcome,
}

/// Names end up in API paths; anything path-like is refused.
pub fn validate_cluster_name(name: &str) -> Result<(), LifecycleError> {
    if name.trim().is_empty() || name.len() > 253 || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(LifecycleError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct LifecycleManager {
    statuses: Arc<StatusBoard>,
    events: Arc<EventHub>,
    probe: Arc<dyn ClusterProbe>,
    hub: Arc<dyn HubConnector>,
    onboard_tuning: OnboardTuning,
    detach_tuning: DetachTuning,
}

impl LifecycleManager {
    pub fn new(
        statuses: Arc<StatusBoard>,
        events: Arc<EventHub>,
        probe: Arc<dyn ClusterProbe>,
        hub: Arc<dyn HubConnector>,
    ) -> Self {
        Self {
            statuses,
            events,
            probe,
            hub,
            onboard_tuning: OnboardTuning::default(),
            detach_tuning: DetachTuning::default(),
        }
    }

    pub fn with_tuning(mut self, onboard: OnboardTuning, detach: DetachTuning) -> Self {
        self.onboard_tuning = onboard;
        self.detach_tuning = detach;
        self
    }

    pub fn status(&self) -> Vec<ClusterStatusEntry> {
        self.statuses.snapshot()
    }

    /// Start onboarding the cluster named by the document's current context (or `name_override`).
    pub fn onboard(&self, kubeconfig: &str, name_override: Option<&str>) -> Result<Onboarding, LifecycleError> {
        let parsed = parse_kubeconfig(kubeconfig)?;
        let cluster = name_override.map(str::trim).filter(|n| !n.is_empty()).unwrap_or(parsed.cluster.as_str()).to_string();
        validate_cluster_name(&cluster)?;

        let claimed = self.statuses.claim(&cluster, ClusterStatus::Pending, |cur| cur.is_none(), || {
            self.events.clear(&cluster);
            self.events.append(&cluster, stage::STARTED, "Onboarding process initiated");
        });
        if let Err(existing) = claimed {
            let existing = existing.unwrap_or(ClusterStatus::Pending);
            info!(cluster = %cluster, status = %existing, "cluster already known; onboarding not restarted");
            return Ok(Onboarding { cluster, outcome: OnboardOutcome::AlreadyPresent(existing) });
        }
        counter!("onboardings_started_total", 1u64);

        let this = self.clone();
        let name = cluster.clone();
        tokio::spawn(async move { this.run_onboarding(&name, parsed).await });
        Ok(Onboarding { cluster, outcome: OnboardOutcome::Accepted })
    }

    async fn run_onboarding(&self, cluster: &str, kubeconfig: ParsedKubeconfig) {
        let started = Instant::now();
        self.events.append(cluster, stage::CONNECTING, format!("Validating connectivity to cluster {cluster}"));
        let probed = match timeout(self.onboard_tuning.probe_timeout, self.probe.probe(&kubeconfig)).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("timed out after {:?} reaching the cluster API", self.onboard_tuning.probe_timeout)),
        };
        match probed {
            Ok(nodes) => {
                self.events.append(cluster, stage::CONNECTED, format!("Cluster API reachable ({nodes} nodes)"));
                if self.statuses.transition(cluster, ClusterStatus::Pending, ClusterStatus::Onboarded) {
                    self.events.append(cluster, stage::COMPLETED, "Onboarding completed successfully");
                    counter!("onboardings_total", 1u64, "result" => "ok");
                } else {
                    warn!(cluster = %cluster, "status changed while onboarding; result discarded");
                }
            }
            Err(e) => {
                self.statuses.transition(cluster, ClusterStatus::Pending, ClusterStatus::Failed);
                self.events.append(cluster, stage::FAILED, format!("Onboarding failed: {e:#}"));
                counter!("onboardings_total", 1u64, "result" => "failed");
            }
        }
        histogram!("onboarding_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Start detaching `cluster` from the OCM hub.
    pub async fn detach(&self, cluster: &str) -> Result<(), LifecycleError> {
        validate_cluster_name(cluster)?;
        if self.hub.context().is_none() {
            return Err(LifecycleError::Hub(anyhow!("hub context not configured")));
        }
        match self.statuses.get(cluster) {
            Some(status) if status.is_in_progress() => {
                return Err(LifecycleError::InProgress { name: cluster.to_string(), status });
            }
            Some(_) => {}
            None => {
                let hub = self.hub.connect().await.map_err(LifecycleError::Hub)?;
                match self.hub_call(hub.managed_cluster_exists(cluster)).await {
                    Ok(true) => {}
                    Ok(false) => return Err(LifecycleError::NotFound(cluster.to_string())),
                    Err(e) => return Err(LifecycleError::Hub(e)),
                }
            }
        }

        let admit = |cur: Option<ClusterStatus>| !cur.is_some_and(ClusterStatus::is_in_progress);
        let claimed = self.statuses.claim(cluster, ClusterStatus::Detaching, admit, || {
            self.events.append(cluster, stage::DETACHING, "Starting cluster detachment process");
        });
        if let Err(current) = claimed {
            let status = current.unwrap_or(ClusterStatus::Detaching);
            return Err(LifecycleError::InProgress { name: cluster.to_string(), status });
        }
        counter!("detachments_started_total", 1u64);

        let this = self.clone();
        let name = cluster.to_string();
        tokio::spawn(async move { this.run_detachment(&name).await });
        Ok(())
    }

    async fn hub_call<T>(&self, fut: impl std::future::Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        match timeout(self.detach_tuning.fetch_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("hub request timed out after {:?}", self.detach_tuning.fetch_timeout)),
        }
    }

    async fn run_detachment(&self, cluster: &str) {
        let started = Instant::now();
        let ok = self.detach_steps(cluster).await;
        if ok {
            // status first: a subscriber replaying the final event must not see Detaching
            if !self.statuses.remove_if(cluster, ClusterStatus::Detaching) {
                warn!(cluster = %cluster, "status changed during detachment; entry left in place");
            }
            self.events.append(cluster, stage::SUCCESS, "Cluster detached successfully");
        } else {
            self.statuses.transition(cluster, ClusterStatus::Detaching, ClusterStatus::DetachmentFailed);
        }
        counter!("detachments_total", 1u64, "result" => if ok { "ok" } else { "failed" });
        histogram!("detachment_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Runs the hub-side stages; every failure is journaled before returning false.
    async fn detach_steps(&self, cluster: &str) -> bool {
        let context = self.hub.context().unwrap_or("<unset>");
        self.events.append(cluster, stage::CONNECTING, format!("Connecting to ITS hub context: {context}"));
        let hub = match self.hub.connect().await {
            Ok(h) => h,
            Err(e) => return self.fail(cluster, stage::ERROR, format!("Failed to get hub client: {e:#}")),
        };
        self.events.append(cluster, stage::CONNECTED, "Successfully connected to ITS hub");

        self.events.append(cluster, stage::CHECKING, "Verifying cluster exists in OCM hub");
        match self.hub_call(hub.managed_cluster_exists(cluster)).await {
            Ok(true) => {
                self.events.append(cluster, stage::FOUND, "Cluster found in OCM hub");
            }
            Ok(false) => return self.fail(cluster, stage::NOT_FOUND, format!("Cluster {cluster} not found in OCM hub")),
            Err(e) => return self.fail(cluster, stage::ERROR, format!("Failed to verify cluster: {e:#}")),
        }

        self.events.append(cluster, stage::EXECUTING, "Executing detachment operation via Kubernetes API");
        if let Err(e) = self.hub_call(hub.delete_managed_cluster(cluster)).await {
            return self.fail(cluster, stage::ERROR, format!("Failed to detach cluster: {e:#}"));
        }
        self.events.append(cluster, stage::COMMAND_EXECUTED, "Detach operation executed successfully");

        self.events.append(cluster, stage::WAITING, "Waiting for cluster to be removed from OCM hub");
        if let Err(reason) = self.await_removal(hub.as_ref(), cluster).await {
            return self.fail(cluster, stage::ERROR, reason);
        }
        self.events.append(cluster, stage::REMOVED, "Cluster removed from OCM hub");
        true
    }

    async fn await_removal(&self, hub: &dyn HubClient, cluster: &str) -> Result<(), String> {
        let DetachTuning { poll_interval, deadline, .. } = self.detach_tuning;
        let deadline_at = Instant::now() + deadline;
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        loop {
            ticker.tick().await;
            match self.hub_call(hub.managed_cluster_exists(cluster)).await {
                Ok(false) => return Ok(()),
                Ok(true) => debug!(cluster = %cluster, "managedcluster still present"),
                Err(e) => warn!(cluster = %cluster, error = %format!("{e:#}"), "removal poll failed; retrying"),
            }
            if Instant::now() >= deadline_at {
                return Err(format!("timeout waiting for cluster {cluster} to be removed after {deadline:?}"));
            }
        }
    }

    fn fail(&self, cluster: &str, tag: &str, message: String) -> bool {
        self.events.append(cluster, tag, message);
        false
    }
}
