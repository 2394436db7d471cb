//! The axum HTTP handler: runs the admission policy (§4.4) against the
//! pre-upgrade request and, if it passes, hands the upgraded socket off to
//! [`crate::session::run`]. On refusal, no web socket handshake ever
//! happens — the client gets an ordinary HTTP error response (§6).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::registry::{AdmissionRequest, SessionRegistry};
use crate::session;

/// Shared application state handed to every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    let host = headers.get("host").and_then(|v| v.to_str().ok());
    let req = AdmissionRequest {
        path: uri.path(),
        origin,
        host,
    };

    // `try_admit` checks the policy and inserts the session under one lock
    // acquisition (§4.4) — the `on_upgrade` callback below only actually
    // runs once the connection has completed its I/O-level upgrade, which
    // would be too late to close a check-then-insert race against a second
    // concurrent request.
    let session_id = match state.registry.try_admit(&req) {
        Ok(id) => id,
        Err(e) => {
            warn!(peer = %peer_addr, reason = %e, "web socket upgrade refused");
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
    };
    let config = state.config.clone();
    let registry = state.registry.clone();

    info!(peer = %peer_addr, session_id, "web socket upgrade accepted");
    ws.on_upgrade(move |socket| async move {
        session::run(socket, peer_addr, config, registry, session_id).await;
    })
}
