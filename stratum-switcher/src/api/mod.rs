//! Debug HTTP endpoint.
//!
//! Read-only views of the running switcher, served with Axum when
//! `EnableHTTPDebug` is set.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::manager::SwitcherContext;
use crate::session::SessionInfo;
use crate::tracing::prelude::*;
use crate::types::{ChainType, SessionId};

/// Response of `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub server_id: u8,
    pub chain_type: ChainType,
    /// Sessions currently proxying
    pub sessions: usize,
    /// Session ids in use, including sessions still in their handshake
    pub allocated_ids: u32,
    /// Paths with an open coin watch
    pub watched_paths: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(ctx): State<Arc<SwitcherContext>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        server_id: ctx.server_id,
        chain_type: ctx.config.chain_type,
        sessions: ctx.registry.len(),
        allocated_ids: ctx.ids.count(),
        watched_paths: ctx.watch.watched_paths(),
    })
}

async fn list_sessions(State(ctx): State<Arc<SwitcherContext>>) -> Json<Vec<SessionInfo>> {
    Json(ctx.registry.infos())
}

/// `GET /sessions/:id` with the id in hex, as it appears in logs.
async fn get_session(
    State(ctx): State<Arc<SwitcherContext>>,
    Path(id): Path<String>,
) -> Response {
    let Ok(raw) = u32::from_str_radix(&id, 16) else {
        let error = ErrorResponse {
            error: format!("{:?} is not a hex session id", id),
        };
        return (StatusCode::BAD_REQUEST, Json(error)).into_response();
    };

    match ctx.registry.get(SessionId::from_raw(raw)) {
        Some(session) => Json(session.info()).into_response(),
        None => {
            let error = ErrorResponse {
                error: format!("session {} not found", id),
            };
            (StatusCode::NOT_FOUND, Json(error)).into_response()
        }
    }
}

/// Build the debug routes.
pub fn routes(ctx: Arc<SwitcherContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve the debug routes until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<SwitcherContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Debug HTTP server listening.");
    axum::serve(listener, routes(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    debug!("Debug HTTP server stopped.");
    Ok(())
}
