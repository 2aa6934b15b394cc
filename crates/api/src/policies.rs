//! Binding policy routes; intent is captured in the cache as policies are created.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Multipart, Path, Query, Request, State},
    http::header::CONTENT_TYPE,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use stellar_core::name_of;
use stellar_kubehub::{is_conflict_error, is_not_found_error};
use stellar_policy::{parse_document, policy_status, to_document, PolicyError, PolicyIntent, MAX_DOCUMENT_BYTES};
use tracing::info;

use crate::{ConsoleError, ConsoleResult, Coordinator};

/// Policy YAML from a multipart `bpYaml` field or the raw request body.
pub(crate) struct PolicyYaml(String);

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for PolicyYaml {
    type Rejection = ConsoleError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));
        if !multipart {
            let body = Bytes::from_request(req, state).await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
            let text = String::from_utf8(body.to_vec()).map_err(|_| ConsoleError::BadRequest("body is not UTF-8".into()))?;
            return Ok(Self(text));
        }
        let mut form = Multipart::from_request(req, state).await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
        while let Some(field) = form.next_field().await.map_err(|e| ConsoleError::BadRequest(e.body_text()))? {
            if field.name() == Some("bpYaml") {
                let text = field.text().await.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
                return Ok(Self(text));
            }
        }
        Err(ConsoleError::BadRequest("bpYaml field is required".into()))
    }
}

fn summary(c: &Coordinator, name: &str, obj: &Value) -> Value {
    let derived = c.intents.derive_for(name, Some(obj)).unwrap_or_default();
    let namespace = c.intents.lookup(name).map(|i| i.namespace.clone()).unwrap_or_else(|| "default".to_string());
    json!({
        "name": name,
        "namespace": namespace,
        "status": policy_status(obj),
        "clusters": derived.clusters,
        "workloads": derived.workloads,
        "clustersCount": derived.clusters.len(),
        "workloadsCount": derived.workloads.len(),
        "creationTimestamp": obj.pointer("/metadata/creationTimestamp").cloned().unwrap_or(Value::Null),
    })
}

async fn submit(c: &Coordinator, document: Value, intent: PolicyIntent) -> ConsoleResult<Json<Value>> {
    let t0 = Instant::now();
    let name = intent.name.clone();
    let created = c.policies.create(&document).await.map_err(|e| {
        if is_conflict_error(&e) {
            ConsoleError::Conflict(format!("binding policy '{name}' already exists"))
        } else {
            ConsoleError::upstream(e)
        }
    })?;
    c.intents.record(&name, intent);
    info!(policy = %name, took_ms = %t0.elapsed().as_millis(), "api: binding policy created");
    Ok(Json(json!({
        "message": format!("Created binding policy '{name}'"),
        "bindingPolicy": summary(c, &name, &created),
    })))
}

pub(crate) async fn create(State(c): State<Arc<Coordinator>>, PolicyYaml(yaml): PolicyYaml) -> ConsoleResult<Json<Value>> {
    if yaml.trim().is_empty() {
        return Err(ConsoleError::BadRequest("binding policy YAML is empty".into()));
    }
    let (document, intent) = parse_document(&yaml)?;
    submit(&c, document, intent).await
}

pub(crate) async fn create_json(
    State(c): State<Arc<Coordinator>>,
    body: Result<Json<PolicyIntent>, JsonRejection>,
) -> ConsoleResult<Json<Value>> {
    let Json(mut intent) = body.map_err(|e| ConsoleError::BadRequest(e.body_text()))?;
    if intent.name.trim().is_empty() {
        return Err(PolicyError::MissingName.into());
    }
    if intent.namespace.is_empty() {
        intent.namespace = "default".to_string();
    }
    let document = to_document(&intent);
    if intent.raw_document.is_empty() {
        intent.raw_document = serde_json::to_string_pretty(&document).map_err(|e| ConsoleError::Internal(e.to_string()))?;
    }
    if intent.raw_document.len() > MAX_DOCUMENT_BYTES {
        return Err(PolicyError::InvalidDocument(format!("document exceeds {MAX_DOCUMENT_BYTES} bytes")).into());
    }
    submit(&c, document, intent).await
}

#[derive(Deserialize)]
pub(crate) struct NameQuery {
    name: Option<String>,
}

pub(crate) async fn status(State(c): State<Arc<Coordinator>>, Query(q): Query<NameQuery>) -> ConsoleResult<Json<Value>> {
    let name = q
        .name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConsoleError::BadRequest("name parameter is required".into()))?;
    let obj = c
        .policies
        .get(&name)
        .await
        .map_err(ConsoleError::upstream)?
        .ok_or_else(|| ConsoleError::NotFound(format!("binding policy '{name}' not found")))?;
    Ok(Json(summary(&c, &name, &obj)))
}

pub(crate) async fn list(State(c): State<Arc<Coordinator>>) -> ConsoleResult<Json<Value>> {
    let objs = c.policies.list().await.map_err(ConsoleError::upstream)?;
    let policies: Vec<Value> =
        objs.iter().filter_map(|o| name_of(o).map(|n| summary(&c, n, o))).collect();
    Ok(Json(json!({ "bindingPolicies": policies, "count": policies.len() })))
}

pub(crate) async fn remove(State(c): State<Arc<Coordinator>>, Path(name): Path<String>) -> ConsoleResult<Json<Value>> {
    c.policies.delete(&name).await.map_err(|e| {
        if is_not_found_error(&e) {
            ConsoleError::NotFound(format!("binding policy '{name}' not found"))
        } else {
            ConsoleError::upstream(e)
        }
    })?;
    c.intents.forget(&name);
    info!(policy = %name, "api: binding policy deleted");
    Ok(Json(json!({ "message": format!("Deleted binding policy '{name}'") })))
}
