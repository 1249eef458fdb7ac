use std::{convert::Infallible, time::Duration};

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use db::models::run::Run;
use deployment::Deployment;
use futures::stream::{self, Stream};
use maestro::events::RunEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

fn event_stream(
    receiver: broadcast::Receiver<RunEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().event("run_event").json_data(&event) {
                    Ok(sse_event) => return Some((Ok(sse_event), rx)),
                    Err(e) => {
                        tracing::error!("Failed to serialize run event: {}", e);
                        continue;
                    }
                },
                // A lagged subscriber loses the skipped events but the
                // stream keeps going; delivery is best effort.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Run event subscriber lagged by {} messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Firehose of events across every run, including runs created after
/// the subscription.
pub async fn stream_all_events(
    State(deployment): State<DeploymentImpl>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = deployment.events().subscribe_all();
    Sse::new(event_stream(receiver)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Per-run SSE feed. Unknown runs 404; a terminal run still gets a
/// channel, it just stays quiet.
pub async fn stream_run_events(
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    Run::find_by_id(&deployment.db().pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Run not found".to_string()))?;

    let receiver = deployment.events().subscribe(run_id);
    Ok(Sse::new(event_stream(receiver)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

pub async fn stream_run_events_ws(
    ws: WebSocketUpgrade,
    Path(run_id): Path<Uuid>,
    State(deployment): State<DeploymentImpl>,
) -> Result<impl IntoResponse, ApiError> {
    Run::find_by_id(&deployment.db().pool, run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Run not found".to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_run_events_ws(socket, deployment, run_id)))
}

async fn handle_run_events_ws(mut socket: WebSocket, deployment: DeploymentImpl, run_id: Uuid) {
    let mut receiver = deployment.events().subscribe(run_id);

    loop {
        tokio::select! {
            socket_msg = socket.recv() => {
                match socket_msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(p))) => {
                        if socket.send(Message::Pong(p)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Run event WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            event = receiver.recv() => {
                match event {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!("Failed to serialize run event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Run event receiver lagged by {} messages", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;

    // Drop our receiver first so an idle channel can actually go away.
    drop(receiver);
    deployment.events().prune(run_id);
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    Router::new()
        .route("/events", get(stream_all_events))
        .route("/runs/{run_id}/events", get(stream_run_events))
        .route("/runs/{run_id}/events/ws", get(stream_run_events_ws))
}
