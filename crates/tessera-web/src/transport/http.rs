use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tessera_runtime::OwnerId;
use tessera_wire::{Response as RpcResponse, RpcError, event_notification};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::StreamOptions;
use crate::hub::Hub;
use crate::session::Session;

/// Header carrying the HTTP session id, issued in reply to `initialize`.
pub const SESSION_HEADER: &str = "tessera-session";

/// Sessions with no request and no open event stream for this long are
/// closed, releasing their subscriptions.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(10 * 60);

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

struct HttpSession {
    session: tokio::sync::Mutex<Session>,
    owner: OwnerId,
    last_seen: parking_lot::Mutex<Instant>,
}

impl HttpSession {
    fn new(hub: Arc<Hub>) -> Self {
        let session = Session::new(hub);
        Self {
            owner: session.owner(),
            session: tokio::sync::Mutex::new(session),
            last_seen: parking_lot::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

type SharedSession = Arc<HttpSession>;
type SessionTable = parking_lot::Mutex<HashMap<String, SharedSession>>;

#[derive(Clone)]
pub struct HttpState {
    hub: Arc<Hub>,
    sessions: Arc<SessionTable>,
    options: StreamOptions,
}

impl HttpState {
    fn session(&self, id: &str) -> Option<SharedSession> {
        let session = self.sessions.lock().get(id).cloned()?;
        session.touch();
        Some(session)
    }

    fn open_session(&self) -> (String, SharedSession) {
        let id = format!("{:032x}", rand::random::<u128>());
        let session = Arc::new(HttpSession::new(self.hub.clone()));
        self.sessions.lock().insert(id.clone(), session.clone());
        info!(session = %id, owner = session.owner.0, "http session opened");
        (id, session)
    }
}

pub fn router(hub: Arc<Hub>, options: StreamOptions) -> Router {
    router_with_ttl(hub, options, SESSION_IDLE_TTL)
}

/// [`router`] with a custom idle TTL. Must be called inside a tokio runtime;
/// the reaper task stops once the router is dropped.
pub fn router_with_ttl(hub: Arc<Hub>, options: StreamOptions, ttl: Duration) -> Router {
    let state = HttpState {
        hub,
        sessions: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        options,
    };
    spawn_reaper(&state, ttl);
    Router::new()
        .route("/rpc", post(rpc_post).delete(rpc_delete))
        .route("/events", get(events_sse))
        .route("/ws", get(ws_upgrade))
        .layer(DefaultBodyLimit::max(options.max_frame_bytes))
        .with_state(state)
}

/// Closes sessions idle past `ttl`. A session with a live SSE stream is
/// never idle.
fn spawn_reaper(state: &HttpState, ttl: Duration) {
    let sessions = Arc::downgrade(&state.sessions);
    let hub = state.hub.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval((ttl / 2).max(MIN_REAP_INTERVAL));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(sessions) = sessions.upgrade() else {
                break;
            };
            let expired: Vec<(String, SharedSession)> = {
                let mut table = sessions.lock();
                let ids: Vec<String> = table
                    .iter()
                    .filter(|(_, s)| s.idle_for() >= ttl && !hub.has_live_sink(s.owner))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| table.remove(&id).map(|s| (id, s)))
                    .collect()
            };
            for (id, session) in expired {
                session.session.lock().await.close();
                info!(session = %id, ttl_ms = ttl.as_millis() as u64, "http session expired");
            }
        }
        debug!("http session reaper stopped");
    });
}

fn session_id_from(headers: &HeaderMap, query: &SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.session.clone())
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session: Option<String>,
}

fn unknown_session(id: &str) -> Response {
    let body = RpcResponse::failure(
        None,
        &RpcError::InvalidRequest(format!("unknown {SESSION_HEADER} `{id}`")),
    );
    (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
}

/// Whether a frame (single or batch) carries an `initialize` request.
fn initializes(body: &[u8]) -> bool {
    let is_initialize =
        |message: &Value| message.get("method").and_then(Value::as_str) == Some("initialize");
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(messages)) => messages.iter().any(is_initialize),
        Ok(message) => is_initialize(&message),
        Err(_) => false,
    }
}

// ── POST /rpc ───────────────────────────────────────────────────

/// Requests without a session header are answered by a throwaway session
/// unless they initialize, which mints a session and returns its id.
async fn rpc_post(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (id, session) = match session_id_from(&headers, &query) {
        Some(id) => match state.session(&id) {
            Some(session) => (Some(id), session),
            None => return unknown_session(&id),
        },
        None if initializes(&body) => {
            let (id, session) = state.open_session();
            (Some(id), session)
        }
        None => (None, Arc::new(HttpSession::new(state.hub.clone()))),
    };
    let label = id.as_deref().unwrap_or("-");

    if state.options.protocol_trace {
        info!(direction = "in", session = %label, frame = %String::from_utf8_lossy(&body), "protocol");
    }
    let reply = session.session.lock().await.handle_frame(&body).await;
    let mut response = match reply {
        Some(reply) => {
            if state.options.protocol_trace {
                info!(direction = "out", session = %label, frame = %reply, "protocol");
            }
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                reply,
            )
                .into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(value) = id.as_deref().and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn rpc_delete(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = session_id_from(&headers, &query) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(session) = state.sessions.lock().remove(&id) else {
        return unknown_session(&id);
    };
    session.session.lock().await.close();
    info!(session = %id, "http session closed");
    StatusCode::NO_CONTENT.into_response()
}

// ── GET /events ─────────────────────────────────────────────────

async fn events_sse(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(id) = session_id_from(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "missing session").into_response();
    };
    let Some(session) = state.session(&id) else {
        return unknown_session(&id);
    };
    let events = state.hub.attach(session.owner);
    debug!(session = %id, "sse stream attached");
    Sse::new(event_stream(events))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_stream(
    events: tokio::sync::mpsc::Receiver<tessera_types::WireEnvelope>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(events).filter_map(|envelope| async move {
        match Event::default().event("event").json_data(&envelope) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                warn!(%e, "failed to encode sse event");
                None
            }
        }
    })
}

// ── GET /ws ─────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    ws.max_message_size(state.options.max_frame_bytes)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

/// One JSON-RPC message (or batch) per text frame in each direction.
async fn handle_ws(mut socket: WebSocket, state: HttpState) {
    let mut session = Session::new(state.hub.clone());
    let mut events = state.hub.attach(session.owner());
    info!(owner = session.owner().0, "websocket session opened");

    loop {
        tokio::select! {
            message = socket.recv() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%e, "websocket receive failed");
                        break;
                    }
                };
                if state.options.protocol_trace {
                    info!(direction = "in", frame = %String::from_utf8_lossy(&frame), "protocol");
                }
                if let Some(reply) = session.handle_frame(&frame).await
                    && socket.send(Message::Text(reply.into())).await.is_err()
                {
                    break;
                }
            }
            Some(envelope) = events.recv() => {
                let body = match event_notification(&envelope).and_then(|n| serde_json::to_string(&n)) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(%e, "failed to encode event notification");
                        continue;
                    }
                };
                if socket.send(Message::Text(body.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close();
    info!(owner = session.owner().0, "websocket session closed");
}
