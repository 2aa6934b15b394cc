//! Cluster onboarding, detachment and status routes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    extract::{FromRequest, Multipart, Path, Request, State},
    http::header::CONTENT_TYPE,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use stellar_core::{ClusterStatus, ClusterStatusEntry, LifecycleEvent};
use stellar_ops::OnboardOutcome;
use tracing::info;

use crate::{ConsoleError, ConsoleResult, Coordinator};

/// Onboard request: multipart `kubeconfig` file (+ optional `name`) or JSON.
pub(crate) struct OnboardRequest {
    kubeconfig: String,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardJson {
    kubeconfig: String,
    #[serde(default)]
    cluster_name: Option<String>,
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for OnboardRequest {
    type Rejection = ConsoleError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        if !is_multipart(&req) {
            let Json(body) =
                Json::<OnboardJson>::from_request(req, state).await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
            return Ok(Self { kubeconfig: body.kubeconfig, name: body.cluster_name });
        }
        let mut form = Multipart::from_request(req, state).await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
        let (mut kubeconfig, mut name) = (None, None);
        while let Some(field) = form.next_field().await.map_err(|e| ConsoleError::BadRequest(e.body_text()))? {
            let field_name = field.name().unwrap_or_default().to_string();
            let text = field.text().await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
            match field_name.as_str() {
                "kubeconfig" => kubeconfig = Some(text),
                "name" | "clusterName" => name = Some(text),
                _ => {}
            }
        }
        let kubeconfig = kubeconfig.ok_or_else(|| ConsoleError::BadRequest("kubeconfig file is required".into()))?;
        Ok(Self { kubeconfig, name })
    }
}

pub(crate) async fn onboard(State(c): State<Arc<Coordinator>>, req: OnboardRequest) -> ConsoleResult<Json<Value>> {
    let t0 = Instant::now();
    if req.kubeconfig.trim().is_empty() {
        return Err(ConsoleError::BadRequest("kubeconfig is empty".into()));
    }
    let onboarding = c.lifecycle.onboard(&req.kubeconfig, req.name.as_deref())?;
    let cluster = onboarding.cluster;
    info!(cluster = %cluster, outcome = ?onboarding.outcome, took_ms = %t0.elapsed().as_millis(), "api: onboard");
    Ok(Json(match onboarding.outcome {
        OnboardOutcome::Accepted => json!({
            "message": format!("Cluster '{cluster}' onboarding started"),
            "clusterName": cluster,
            "status": ClusterStatus::Pending.as_str(),
            "logsEndpoint": format!("/clusters/onboard/logs/{cluster}"),
            "websocketEndpoint": format!("/ws/onboarding?cluster={cluster}"),
        }),
        OnboardOutcome::AlreadyPresent(status) => json!({
            "message": format!("Cluster '{cluster}' is already known"),
            "clusterName": cluster,
            "status": status.as_str(),
            "logsEndpoint": format!("/clusters/onboard/logs/{cluster}"),
        }),
    }))
}

pub(crate) async fn status(State(c): State<Arc<Coordinator>>) -> Json<Vec<ClusterStatusEntry>> {
    Json(c.lifecycle.status())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DetachRequest {
    #[serde(default)]
    cluster_name: String,
}

pub(crate) async fn detach(State(c): State<Arc<Coordinator>>, body: Option<Json<DetachRequest>>) -> ConsoleResult<Json<Value>> {
    let cluster = body.map(|Json(b)| b.cluster_name.trim().to_string()).unwrap_or_default();
    if cluster.is_empty() {
        return Err(ConsoleError::BadRequest("clusterName is required".into()));
    }
    let t0 = Instant::now();
    c.lifecycle.detach(&cluster).await?;
    info!(cluster = %cluster, took_ms = %t0.elapsed().as_millis(), "api: detach accepted");
    Ok(Json(json!({
        "message": format!("Cluster '{cluster}' detachment started"),
        "clusterName": cluster,
        "status": ClusterStatus::Detaching.as_str(),
        "logsEndpoint": format!("/clusters/detach/logs/{cluster}"),
        "websocketEndpoint": format!("/ws/detachment?cluster={cluster}"),
    })))
}

fn logs_body(cluster: &str, status: &str, logs: Vec<LifecycleEvent>) -> Json<Value> {
    Json(json!({
        "clusterName": cluster,
        "status": status,
        "count": logs.len(),
        "logs": logs,
    }))
}

pub(crate) async fn onboard_logs(State(c): State<Arc<Coordinator>>, Path(cluster): Path<String>) -> ConsoleResult<Json<Value>> {
    let status = c
        .statuses
        .get(&cluster)
        .ok_or_else(|| ConsoleError::NotFound(format!("no onboarding data found for cluster '{cluster}'")))?;
    Ok(logs_body(&cluster, status.as_str(), c.events.snapshot(&cluster)))
}

/// A gone status entry with a journal left behind means the detachment finished.
pub(crate) async fn detach_logs(State(c): State<Arc<Coordinator>>, Path(cluster): Path<String>) -> ConsoleResult<Json<Value>> {
    let logs = c.events.snapshot(&cluster);
    let status = match c.statuses.get(&cluster) {
        Some(s) => s,
        None if !logs.is_empty() => ClusterStatus::Detached,
        None => return Err(ConsoleError::NotFound(format!("no detachment data found for cluster '{cluster}'"))),
    };
    Ok(logs_body(&cluster, status.as_str(), logs))
}

pub(crate) async fn managed(State(c): State<Arc<Coordinator>>) -> ConsoleResult<Json<Value>> {
    let hub = c.hub.connect().await.map_err(ConsoleError::upstream)?;
    let clusters = hub.list_managed_clusters().await.map_err(ConsoleError::upstream)?;
    Ok(Json(json!({ "clusters": clusters, "count": clusters.len() })))
}
