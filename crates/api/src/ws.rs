//! WebSocket streams: lifecycle journals and the resource view.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use metrics::{decrement_gauge, increment_gauge};
use serde::{Deserialize, Serialize};
use stellar_core::StreamKind;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::{ConsoleError, ConsoleResult, Coordinator, StreamTuning};

#[derive(Deserialize)]
pub(crate) struct ClusterQuery {
    cluster: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct NamespaceQuery {
    namespace: Option<String>,
}

pub(crate) async fn lifecycle(
    State(c): State<Arc<Coordinator>>,
    Query(q): Query<ClusterQuery>,
    ws: WebSocketUpgrade,
) -> ConsoleResult<Response> {
    let cluster = q
        .cluster
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConsoleError::BadRequest("cluster parameter is required".into()))?;
    Ok(ws.on_upgrade(move |socket| async move {
        let sub = c.events.subscribe(&cluster, StreamKind::Lifecycle, || c.statuses.get(&cluster));
        info!(cluster = %cluster, position = sub.position, "api: lifecycle stream opened");
        let feed = stream::unfold(sub, |mut sub| async move { sub.recv().await.map(|ev| (ev, sub)) }).boxed();
        pump(socket, feed, c.stream, StreamKind::Lifecycle).await;
        info!(cluster = %cluster, "api: lifecycle stream closed");
    }))
}

pub(crate) async fn resources(
    State(c): State<Arc<Coordinator>>,
    Query(q): Query<NamespaceQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let scope = q.namespace.filter(|s| !s.is_empty());
    ws.on_upgrade(move |socket| async move {
        let rs = c.resources.open(scope);
        let feed = stream::unfold(rs, |mut rs| async move { rs.next().await.map(|ev| (ev, rs)) }).boxed();
        pump(socket, feed, c.stream, StreamKind::Resources).await;
    })
}

/// Forward `feed` as JSON text frames until the client goes away.
/// Pings every `ping_interval`; a missing pong or a slow write ends the stream.
async fn pump<T: Serialize + Send>(socket: WebSocket, mut feed: BoxStream<'static, T>, tuning: StreamTuning, kind: StreamKind) {
    let (mut tx, mut rx) = socket.split();
    let mut ping = interval_at(Instant::now() + tuning.ping_interval, tuning.ping_interval);
    let pong = sleep(tuning.pong_deadline);
    tokio::pin!(pong);
    let mut awaiting_pong = false;
    increment_gauge!("ws_connections", 1.0, "stream" => kind.to_string());

    loop {
        tokio::select! {
            item = feed.next() => {
                let Some(item) = item else { break };
                let text = match serde_json::to_string(&item) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "api: dropping unserializable stream event");
                        continue;
                    }
                };
                match timeout(tuning.write_deadline, tx.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, stream = %kind, "api: websocket write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(stream = %kind, "api: websocket write deadline exceeded");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if !matches!(timeout(tuning.write_deadline, tx.send(Message::Ping(Vec::new()))).await, Ok(Ok(()))) {
                    break;
                }
                if !awaiting_pong {
                    pong.as_mut().reset(Instant::now() + tuning.pong_deadline);
                    awaiting_pong = true;
                }
            }
            _ = &mut pong, if awaiting_pong => {
                warn!(stream = %kind, "api: pong deadline exceeded; closing");
                break;
            }
            msg = rx.next() => match msg {
                Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, stream = %kind, "api: websocket read failed");
                    break;
                }
            },
        }
    }
    let _ = tx.close().await;
    decrement_gauge!("ws_connections", 1.0, "stream" => kind.to_string());
}
