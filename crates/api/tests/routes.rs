#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use stellar_api::{router, Backends, Coordinator, Tuning};
use stellar_core::WatchableResource;
use stellar_kubehub::{
    ClusterProbe, Discovered, EventStream, HubClient, HubConnector, ListPage, ManagedClusterInfo, ParsedKubeconfig,
    PolicyBackend, RawEvent, ResourceSource,
};
use tower::ServiceExt;

const KUBECONFIG: &str = "apiVersion: v1
kind: Config
current-context: demo
clusters:
- name: demoC
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: demo
  context:
    cluster: demoC
    user: admin
users:
- name: admin
  user:
    token: abc
";

const POLICY: &str = "apiVersion: control.kubestellar.io/v1alpha1
kind: BindingPolicy
metadata:
  name: nginx-bp
spec:
  clusterSelectors:
  - matchLabels:
      kubernetes.io/cluster-name: cluster1
      location-group: edge
  downsync:
  - apiGroup: apps
    resources: [deployments]
    namespaces: [nginx]
";

/// Never answers, so onboarded clusters stay Pending.
struct StuckProbe;

#[async_trait]
impl ClusterProbe for StuckProbe {
    async fn probe(&self, _kubeconfig: &ParsedKubeconfig) -> Result<usize> {
        futures::future::pending::<()>().await;
        Ok(0)
    }
}

struct FakeHub {
    clusters: Vec<&'static str>,
}

#[async_trait]
impl HubClient for FakeHub {
    async fn managed_cluster_exists(&self, name: &str) -> Result<bool> {
        Ok(self.clusters.contains(&name))
    }

    async fn delete_managed_cluster(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_managed_clusters(&self) -> Result<Vec<ManagedClusterInfo>> {
        Ok(self
            .clusters
            .iter()
            .map(|n| ManagedClusterInfo {
                name: n.to_string(),
                labels: Default::default(),
                available: true,
                joined: true,
                creation_timestamp: None,
            })
            .collect())
    }
}

struct FakeConnector {
    context: Option<String>,
    hub: Arc<FakeHub>,
}

#[async_trait]
impl HubConnector for FakeConnector {
    fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    async fn connect(&self) -> Result<Arc<dyn HubClient>> {
        if self.context.is_none() {
            return Err(anyhow!("hub context not configured"));
        }
        let hub: Arc<dyn HubClient> = self.hub.clone();
        Ok(hub)
    }
}

/// Empty cluster whose watches stay open without events.
struct QuietSource;

fn idle() -> EventStream {
    async_stream::stream! {
        futures::future::pending::<()>().await;
        yield Ok(RawEvent::Bookmark { resource_version: String::new() });
    }
    .boxed()
}

#[async_trait]
impl ResourceSource for QuietSource {
    async fn discover(&self) -> Result<Discovered> {
        Ok(Discovered::default())
    }

    async fn list_namespaces(&self) -> Result<ListPage> {
        Ok(ListPage::default())
    }

    async fn watch_namespaces(&self, _name: Option<&str>, _rv: &str, _timeout_secs: u32) -> Result<EventStream> {
        Ok(idle())
    }

    async fn list(&self, _namespace: &str, _resource: &WatchableResource) -> Result<ListPage> {
        Ok(ListPage::default())
    }

    async fn watch(&self, _namespace: &str, _resource: &WatchableResource, _rv: &str, _timeout_secs: u32) -> Result<EventStream> {
        Ok(idle())
    }
}

#[derive(Default)]
struct FakePolicies {
    objects: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl PolicyBackend for FakePolicies {
    async fn create(&self, document: &Value) -> Result<Value> {
        let name = document["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let mut objects = self.objects.lock();
        if objects.contains_key(&name) {
            return Err(anyhow!("bindingpolicies \"{name}\" already exists"));
        }
        let mut created = document.clone();
        created["metadata"]["creationTimestamp"] = json!("2026-01-01T00:00:00Z");
        objects.insert(name, created.clone());
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.objects.lock().get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Value>> {
        let mut all: Vec<Value> = self.objects.lock().values().cloned().collect();
        all.sort_by_key(|o| o["metadata"]["name"].as_str().unwrap_or_default().to_string());
        Ok(all)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.objects.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(anyhow!("bindingpolicies \"{name}\" not found")),
        }
    }
}

fn app_with(context: Option<&str>) -> (Router, Arc<Coordinator>) {
    let backends = Backends {
        probe: Arc::new(StuckProbe),
        hub: Arc::new(FakeConnector { context: context.map(str::to_string), hub: Arc::new(FakeHub { clusters: vec!["c1"] }) }),
        source: Arc::new(QuietSource),
        policies: Arc::new(FakePolicies::default()),
    };
    let coordinator = Arc::new(Coordinator::new(backends, Tuning::default()));
    (router(coordinator.clone()), coordinator)
}

fn app() -> (Router, Arc<Coordinator>) {
    app_with(Some("its1"))
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).expect("json body") };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn multipart(uri: &str, fields: &[(&str, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--XBOUNDARY\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str("--XBOUNDARY--\r\n");
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
        .body(Body::from(body))
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _) = app();
    assert_eq!(call(&app, get("/healthz")).await, (StatusCode::OK, json!({"status": "ok"})));
}

#[tokio::test]
async fn json_onboarding_is_pending_in_status() {
    let (app, _) = app();
    let (code, body) = call(&app, post_json("/clusters/onboard", json!({"kubeconfig": KUBECONFIG}))).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Pending");
    assert_eq!(body["logsEndpoint"], "/clusters/onboard/logs/demoC");
    assert_eq!(body["websocketEndpoint"], "/ws/onboarding?cluster=demoC");

    let (code, body) = call(&app, get("/clusters/status")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body, json!([{"clusterName": "demoC", "status": "Pending"}]));

    let (code, body) = call(&app, get("/clusters/onboard/logs/demoC")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Pending");
    assert_eq!(body["logs"][0]["status"], "Started");

    // second submission reports the existing entry
    let (code, body) = call(&app, post_json("/clusters/onboard", json!({"kubeconfig": KUBECONFIG}))).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Pending");
    assert!(body.get("websocketEndpoint").is_none());
}

#[tokio::test]
async fn multipart_onboarding_honours_name_override() {
    let (app, c) = app();
    let (code, body) = call(&app, multipart("/clusters/onboard", &[("kubeconfig", KUBECONFIG), ("name", "edge-7")])).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["clusterName"], "edge-7");
    assert!(c.statuses.get("edge-7").is_some());
}

#[tokio::test]
async fn bad_onboarding_requests_are_rejected() {
    let (app, c) = app();
    let (code, body) = call(&app, post_json("/clusters/onboard", json!({"kubeconfig": "not: [yaml"}))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (code, _) = call(&app, multipart("/clusters/onboard", &[("name", "x")])).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(c.lifecycle.status().is_empty());
}

#[tokio::test]
async fn detaching_unknown_cluster_is_404_without_state() {
    let (app, c) = app();
    let (code, body) = call(&app, post_json("/clusters/detach", json!({"clusterName": "ghost"}))).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap_or_default().contains("ghost"));
    assert!(c.statuses.get("ghost").is_none());

    let (code, _) = call(&app, post_json("/clusters/detach", json!({}))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn detach_is_accepted_for_hub_clusters() {
    let (app, _) = app();
    let (code, body) = call(&app, post_json("/clusters/detach", json!({"clusterName": "c1"}))).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Detaching");
    assert_eq!(body["websocketEndpoint"], "/ws/detachment?cluster=c1");

    let (code, _) = call(&app, post_json("/clusters/detach", json!({"clusterName": "c1"}))).await;
    assert_eq!(code, StatusCode::CONFLICT);
}

#[tokio::test]
async fn detach_without_hub_context_is_500() {
    let (app, _) = app_with(None);
    let (code, body) = call(&app, post_json("/clusters/detach", json!({"clusterName": "c1"}))).await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "hub context not configured");
}

#[tokio::test]
async fn detach_logs_report_detached_once_entry_is_gone() {
    let (app, c) = app();
    assert_eq!(call(&app, get("/clusters/detach/logs/c9")).await.0, StatusCode::NOT_FOUND);
    assert_eq!(call(&app, get("/clusters/onboard/logs/c9")).await.0, StatusCode::NOT_FOUND);

    c.events.append("c9", "Success", "Cluster detached successfully");
    let (code, body) = call(&app, get("/clusters/detach/logs/c9")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Detached");
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn managed_clusters_come_from_the_hub() {
    let (app, _) = app();
    let (code, body) = call(&app, get("/api/clusters/managed")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["clusters"][0]["name"], "c1");
    assert_eq!(body["clusters"][0]["available"], true);
}

#[tokio::test]
async fn binding_policy_lifecycle() {
    let (app, c) = app();
    let req = Request::builder()
        .method("POST")
        .uri("/api/bp/create")
        .header("content-type", "application/yaml")
        .body(Body::from(POLICY))
        .expect("request");
    let (code, body) = call(&app, req).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["bindingPolicy"]["clusters"], json!(["cluster1", "location-group:edge"]));
    assert_eq!(body["bindingPolicy"]["workloads"], json!(["apps/deployments (ns:nginx)"]));
    assert!(c.intents.lookup("nginx-bp").is_some());

    let (code, _) = call(&app, multipart("/api/bp/create", &[("bpYaml", POLICY)])).await;
    assert_eq!(code, StatusCode::CONFLICT);

    let (code, body) = call(&app, get("/api/bp/status?name=nginx-bp")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "Pending");
    assert_eq!(body["clusters"][0], "cluster1");

    let (code, body) = call(&app, get("/api/bp")).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let del = Request::builder().method("DELETE").uri("/api/bp/delete/nginx-bp").body(Body::empty()).expect("request");
    assert_eq!(call(&app, del).await.0, StatusCode::OK);
    assert!(c.intents.lookup("nginx-bp").is_none());
    assert_eq!(call(&app, get("/api/bp/status?name=nginx-bp")).await.0, StatusCode::NOT_FOUND);

    let del = Request::builder().method("DELETE").uri("/api/bp/delete/nginx-bp").body(Body::empty()).expect("request");
    assert_eq!(call(&app, del).await.0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn json_policy_is_rendered_and_recorded() {
    let (app, c) = app();
    let intent = json!({
        "name": "web-bp",
        "clusterSelectors": [{"env": "prod"}],
        "apiGroups": ["apps"],
        "resources": ["Deployment"],
        "namespaces": ["web"],
    });
    let (code, body) = call(&app, post_json("/api/bp/create-json", intent)).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["bindingPolicy"]["clusters"], json!(["env:prod"]));
    assert_eq!(body["bindingPolicy"]["workloads"], json!(["apps/deployment (ns:web)"]));
    let recorded = c.intents.lookup("web-bp").expect("intent");
    assert_eq!(recorded.namespace, "default");
    assert!(recorded.raw_document.contains("BindingPolicy"));

    let (code, _) = call(&app, post_json("/api/bp/create-json", json!({"name": ""}))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn json_policy_without_name_or_with_bad_shape_is_400() {
    let (app, c) = app();
    let (code, body) =
        call(&app, post_json("/api/bp/create-json", json!({"clusterSelectors": [{"env": "prod"}]}))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()), "error body: {body}");

    let (code, body) = call(&app, post_json("/api/bp/create-json", json!({"name": "x", "clusterSelectors": "env=prod"}))).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(c.intents.lookup("x").is_none());
}

#[tokio::test]
async fn policy_status_requires_a_name() {
    let (app, _) = app();
    assert_eq!(call(&app, get("/api/bp/status")).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_routes_require_an_upgrade() {
    let (app, _) = app();
    let resp = app.clone().oneshot(get("/ws/namespaces")).await.expect("response");
    assert_ne!(resp.status(), StatusCode::OK);
}
