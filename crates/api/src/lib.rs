//! Stellar console API: HTTP and WebSocket routes over the lifecycle manager,
//! event journal, watcher engine and policy intent cache.
//!
//! Everything a handler needs hangs off one [`Coordinator`] shared as axum state.
//! Kubernetes access stays behind the kubehub traits so tests can inject fakes.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use stellar_kubehub::{ClusterProbe, HubConnector, PolicyBackend, ResourceSource};
use stellar_ops::{DetachTuning, LifecycleManager, OnboardTuning};
use stellar_policy::IntentCache;
use stellar_store::{EventHub, StatusBoard, TtlCache};
use stellar_watch::{WatchEngine, WatchTuning};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod clusters;
mod error;
mod policies;
mod ws;

pub use error::{ConsoleError, ConsoleResult};

/// WebSocket keepalive and write limits.
#[derive(Debug, Clone, Copy)]
pub struct StreamTuning {
    pub ping_interval: Duration,
    pub pong_deadline: Duration,
    pub write_deadline: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_deadline: Duration::from_secs(10),
            write_deadline: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tuning {
    pub onboard: OnboardTuning,
    pub detach: DetachTuning,
    pub watch: WatchTuning,
    pub stream: StreamTuning,
}

/// The Kubernetes seams the console talks through.
pub struct Backends {
    /// Validates onboarded kubeconfigs.
    pub probe: Arc<dyn ClusterProbe>,
    /// OCM hub used for detachment and managed cluster listing.
    pub hub: Arc<dyn HubConnector>,
    /// Workload description space behind the resource stream.
    pub source: Arc<dyn ResourceSource>,
    pub policies: Arc<dyn PolicyBackend>,
}

pub struct Coordinator {
    pub statuses: Arc<StatusBoard>,
    pub events: Arc<EventHub>,
    pub lifecycle: LifecycleManager,
    pub resources: WatchEngine,
    pub intents: Arc<IntentCache>,
    pub policies: Arc<dyn PolicyBackend>,
    pub hub: Arc<dyn HubConnector>,
    pub stream: StreamTuning,
}

impl Coordinator {
    pub fn new(backends: Backends, tuning: Tuning) -> Self {
        let statuses = Arc::new(StatusBoard::new());
        let events = Arc::new(EventHub::default());
        let lifecycle = LifecycleManager::new(statuses.clone(), events.clone(), backends.probe, backends.hub.clone())
            .with_tuning(tuning.onboard, tuning.detach);
        let resources = WatchEngine::new(backends.source, Arc::new(TtlCache::new()), tuning.watch);
        Self {
            statuses,
            events,
            lifecycle,
            resources,
            intents: Arc::new(IntentCache::new()),
            policies: backends.policies,
            hub: backends.hub,
            stream: tuning.stream,
        }
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Full console router with permissive CORS.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/clusters/onboard", post(clusters::onboard))
        .route("/clusters/status", get(clusters::status))
        .route("/clusters/detach", post(clusters::detach))
        .route("/clusters/onboard/logs/:cluster", get(clusters::onboard_logs))
        .route("/clusters/detach/logs/:cluster", get(clusters::detach_logs))
        .route("/api/clusters/managed", get(clusters::managed))
        .route("/ws/onboarding", get(ws::lifecycle))
        .route("/ws/detachment", get(ws::lifecycle))
        .route("/ws/namespaces", get(ws::resources))
        .route("/api/bp", get(policies::list))
        .route("/api/bp/create", post(policies::create))
        .route("/api/bp/create-json", post(policies::create_json))
        .route("/api/bp/status", get(policies::status))
        .route("/api/bp/delete/:name", delete(policies::remove))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}
