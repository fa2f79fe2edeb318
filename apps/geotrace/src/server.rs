//! HTTP, WebSocket and SSE front end over trace sessions.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{future, SinkExt, Stream, StreamExt};
use geotrace_model::{EventEnvelope, ErrorResponse, TraceRequest, TraceResponse};
use geotrace_trace::{SessionEmitter, TraceError, TraceMode, Tracer};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub tracer: Tracer,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/traceroute", post(handle_trace))
        .route("/api/traceroute/ws", get(handle_ws))
        .route("/api/traceroute/stream", get(handle_sse))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_root() -> &'static str {
    "Traceroute API is running"
}

async fn handle_health() -> &'static str {
    "ok"
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: TraceError) -> ApiError {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// One-shot trace: answers once the whole path is known.
async fn handle_trace(
    State(state): State<AppState>,
    Json(request): Json<TraceRequest>,
) -> Result<Json<TraceResponse>, ApiError> {
    let hops = state
        .tracer
        .run_one_shot(&request.target)
        .await
        .map_err(api_error)?;
    Ok(Json(TraceResponse { hops }))
}

async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_failed_upgrade(|err| debug!("websocket upgrade failed: {err}"))
        .on_upgrade(move |socket| serve_socket(socket, state.tracer))
}

/// Each text frame starts a trace; a newer request or a closed socket
/// cancels the one in flight.
async fn serve_socket(socket: WebSocket, tracer: Tracer) {
    let (mut sink, incoming) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<EventEnvelope>();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let Some(frame) = text_frame(&envelope) else {
                continue;
            };
            if sink.send(frame).await.is_err() {
                debug!("websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let requests = incoming
        .take_while(|message| {
            let open = match message {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(err) => {
                    debug!("websocket receive failed: {err}");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(start_target(&text)),
                _ => None,
            })
        });

    relay_requests(requests, tracer, out_tx).await;
    let _ = writer.await;
    debug!("websocket closed");
}

/// Runs one streaming session per requested target, all feeding `out_tx`.
/// A session is fully wound down before its successor starts, so no event
/// of an older session follows a newer `traceroute-started`.
async fn relay_requests<S>(requests: S, tracer: Tracer, out_tx: UnboundedSender<EventEnvelope>)
where
    S: Stream<Item = String>,
{
    futures::pin_mut!(requests);
    let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;

    while let Some(target) = requests.next().await {
        if let Some((cancel, task)) = current.take() {
            cancel.cancel();
            let _ = task.await;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tracer = tracer.clone();
        let emitter = SessionEmitter::new(out_tx.clone());
        let task = tokio::spawn(async move {
            tracer
                .run(&target, TraceMode::Streaming, emitter, token)
                .await;
        });
        current = Some((cancel, task));
    }

    if let Some((cancel, task)) = current {
        cancel.cancel();
        let _ = task.await;
    }
}

fn text_frame(envelope: &EventEnvelope) -> Option<Message> {
    match serde_json::to_string(envelope) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!("failed to encode event: {err}");
            None
        }
    }
}

/// Accepts `{"target": ".."}`, a JSON string, or the bare target.
fn start_target(text: &str) -> String {
    if let Ok(request) = serde_json::from_str::<TraceRequest>(text) {
        return request.target;
    }
    if let Ok(target) = serde_json::from_str::<String>(text) {
        return target;
    }
    text.trim().to_string()
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    target: String,
}

/// Streaming trace over Server-Sent Events. Dropping the response stream
/// cancels the session.
async fn handle_sse(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (emitter, rx) = SessionEmitter::channel();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let tracer = state.tracer.clone();
    tokio::spawn(async move {
        let outcome = tracer
            .run(&query.target, TraceMode::Streaming, emitter, cancel)
            .await;
        info!(session = outcome.session_id, status = ?outcome.status, "sse trace finished");
    });

    let stream = UnboundedReceiverStream::new(rx).map(move |envelope| {
        let _guard = &guard;
        Ok(sse_event(&envelope))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("alive"),
    )
}

fn sse_event(envelope: &EventEnvelope) -> Event {
    match Event::default().json_data(envelope) {
        Ok(event) => event
            .event(envelope.event.name())
            .id(envelope.seq.to_string()),
        Err(err) => {
            warn!("failed to encode event: {err}");
            Event::default().comment("unencodable event")
        }
    }
}
