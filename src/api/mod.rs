//! Minimal demo transport (§11). Full API/protocol design is out of scope
//! (§1 Non-goals); these routes are thin pass-throughs onto the core so it
//! can be exercised end-to-end, mirroring the teacher's `build_router`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::bus::{Event, TopicKind};
use crate::context::AppContext;
use crate::error::{CoreError, ErrorCode};

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/status", get(status))
        .route("/api/v1/cue-lists/{id}/status", get(cue_list_status))
        .route("/api/v1/cue-lists/{id}/start", post(cue_list_start))
        .route("/api/v1/cue-lists/{id}/next", post(cue_list_next))
        .route("/api/v1/cue-lists/{id}/previous", post(cue_list_previous))
        .route("/api/v1/cue-lists/{id}/stop", post(cue_list_stop))
        .route("/ws/events", get(ws_events))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Wraps a `CoreError` so its §7 error code and HTTP status travel together
/// in the response body, rather than leaving `ErrorCode` an unused type.
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::AtBoundary => StatusCode::CONFLICT,
            ErrorCode::EmptyCueList => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::TransientIo | ErrorCode::FatalIo => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "code": code, "message": self.0.to_string() }))).into_response()
    }
}

async fn cue_list_status(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Json<impl Serialize>, ApiError> {
    let status = ctx.playback.status(&id).await.map_err(CoreError::from)?;
    Ok(Json(status))
}

async fn cue_list_start(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.playback.start(&id, 0).await.map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cue_list_next(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.playback.next(&id, None).await.map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cue_list_previous(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    ctx.playback.previous(&id, None).await.map_err(CoreError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cue_list_stop(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> StatusCode {
    ctx.playback.stop(&id).await;
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct UniverseStatus {
    universe: u16,
    packets_sent: u64,
    send_errors: u64,
    rate_mode: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    universes: Vec<UniverseStatus>,
}

async fn status(State(ctx): State<Arc<AppContext>>) -> Json<StatusResponse> {
    let universes = (1..=ctx.config.universe_count)
        .filter_map(|u| {
            ctx.output.stats(u).map(|s| UniverseStatus {
                universe: u,
                packets_sent: s.packets_sent,
                send_errors: s.send_errors,
                rate_mode: s.rate_mode.map(|m| format!("{m:?}")),
            })
        })
        .collect();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        universes,
    })
}

async fn ws_events(ws: WebSocketUpgrade, State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| bridge_events(socket, ctx))
}

/// Bridges Change Bus subscriptions onto a WebSocket. No business logic
/// lives here: every event is forwarded as a JSON envelope.
async fn bridge_events(mut socket: WebSocket, ctx: Arc<AppContext>) {
    let dmx = ctx.bus.subscribe(TopicKind::DmxOutputChanged, None).await;
    let playback = ctx.bus.subscribe(TopicKind::CueListPlaybackUpdated, None).await;
    let preview = ctx.bus.subscribe(TopicKind::PreviewSessionUpdated, None).await;

    loop {
        let envelope = tokio::select! {
            ev = dmx.recv() => match ev {
                Some(Event::DmxOutputChanged { universe, channels }) => {
                    json!({"type": "dmx_output_changed", "universe": universe, "channels": channels.to_vec()})
                }
                Some(_) => continue,
                None => break,
            },
            ev = playback.recv() => match ev {
                Some(Event::CueListPlaybackUpdated(s)) => json!({"type": "cue_list_playback_updated", "data": s}),
                Some(_) => continue,
                None => break,
            },
            ev = preview.recv() => match ev {
                Some(Event::PreviewSessionUpdated(s)) => json!({"type": "preview_session_updated", "data": s}),
                Some(_) => continue,
                None => break,
            },
        };

        if socket.send(Message::Text(envelope.to_string())).await.is_err() {
            debug!("ws/events: client disconnected");
            break;
        }
    }
}
