// SPDX-License-Identifier: MIT
//! HTTP surface: index page, static assets, the OAuth callback, the
//! WebSocket upgrade, and the operator mode switch.
//!
//! The WebSocket endpoint authenticates by session cookie before handing
//! the socket to the session machine; the auth outcome frames (`U`,
//! `E :Database error`) are sent on the socket itself so automated clients
//! get a deterministic first frame even when rejected.

pub mod auth;

use crate::modes::Mode;
use crate::protocol;
use crate::session;
use crate::AppContext;
use anyhow::{Context as _, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Form, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::SinkExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// WebSocket subprotocol spoken by course-selection clients.
const SUBPROTOCOL: &str = "cca1";

/// Bind the configured listener and serve until the shutdown signal.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr = ctx.config.listener.addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind listener on {addr}"))?;
    info!(addr = %addr, "listening");

    let router = build_router(ctx.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown(ctx.clone()))
        .await
        .context("serve http")?;
    info!(
        uptime_secs = ctx.started_at.elapsed().as_secs(),
        "server stopped"
    );
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    use tower_http::services::{ServeDir, ServeFile};
    let static_dir = ctx.config.static_dir.clone();
    Router::new()
        .route_service("/", ServeFile::new(static_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(static_dir))
        .route("/auth", get(auth::callback))
        .route("/ws", get(ws_upgrade))
        .route("/admin/mode", post(set_mode))
        .with_state(ctx)
}

/// Resolve on SIGTERM (Unix) or Ctrl-C, then fire every session's cancel
/// handle so the graceful drain actually drains.
async fn shutdown(ctx: Arc<AppContext>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    info!("shutdown signal received — cancelling sessions");
    ctx.registry.cancel_all();
}

// ─── WebSocket upgrade ───────────────────────────────────────────────────────

async fn ws_upgrade(
    State(ctx): State<Arc<AppContext>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    let cookie = session_cookie(&headers);
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| attach(ctx, socket, cookie))
}

/// Authenticate the socket, then run the session.
async fn attach(ctx: Arc<AppContext>, mut socket: WebSocket, cookie: Option<String>) {
    let Some(cookie) = cookie else {
        let _ = send_raw(&mut socket, protocol::unauthenticated()).await;
        let _ = socket.close().await;
        return;
    };

    let now = chrono::Utc::now().timestamp();
    let lookup = tokio::time::timeout(
        Duration::from_secs(ctx.config.perf.read_header_timeout_secs),
        ctx.storage.userid_for_cookie(&cookie, now),
    )
    .await;

    let user_id = match lookup {
        Ok(Ok(Some(user))) => user,
        Ok(Ok(None)) => {
            let _ = send_raw(&mut socket, protocol::unauthenticated()).await;
            let _ = socket.close().await;
            return;
        }
        Ok(Err(e)) => {
            warn!(err = %e, "cookie lookup failed");
            let _ = send_raw(&mut socket, protocol::error("Database error")).await;
            let _ = socket.close().await;
            return;
        }
        Err(_) => {
            warn!("cookie lookup timed out");
            let _ = send_raw(&mut socket, protocol::error("Database error")).await;
            let _ = socket.close().await;
            return;
        }
    };

    session::run(ctx, socket, user_id).await;
}

async fn send_raw(socket: &mut WebSocket, frame: protocol::Message) -> Result<(), axum::Error> {
    socket.send(WsMessage::Text(frame.encode().into())).await
}

/// Pull the `session` cookie out of the Cookie header(s).
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(axum::http::header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "session" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

// ─── Operator mode switch ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ModeForm {
    state: i64,
}

/// `POST /admin/mode` with form field `state=<0|1|2>`. Requires a session
/// cookie whose userid is in `auth.admin_users`.
async fn set_mode(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Form(form): Form<ModeForm>,
) -> Response {
    let Some(cookie) = session_cookie(&headers) else {
        return (StatusCode::UNAUTHORIZED, "no session cookie\n").into_response();
    };
    let now = chrono::Utc::now().timestamp();
    let user = match ctx.storage.userid_for_cookie(&cookie, now).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "unknown session\n").into_response(),
        Err(e) => {
            warn!(err = %e, "cookie lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "database error\n").into_response();
        }
    };
    if !ctx.config.auth.admin_users.contains(&user) {
        return (StatusCode::FORBIDDEN, "not an admin\n").into_response();
    }

    let Some(mode) = Mode::from_i64(form.state) else {
        return (StatusCode::BAD_REQUEST, "state must be 0, 1 or 2\n").into_response();
    };
    match ctx.modes.set(&ctx.registry, mode).await {
        Ok(()) => {
            info!(admin = %user, mode = %mode, "mode set by operator");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(err = %e, "mode persistence failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "could not persist mode\n").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn headers(raw: &[&str]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for v in raw {
            h.append(COOKIE, v.parse().unwrap());
        }
        h
    }

    #[test]
    fn finds_the_session_cookie() {
        let h = headers(&["session=abc123"]);
        assert_eq!(session_cookie(&h).as_deref(), Some("abc123"));
    }

    #[test]
    fn finds_it_among_other_cookies() {
        let h = headers(&["theme=dark; session=abc123; lang=en"]);
        assert_eq!(session_cookie(&h).as_deref(), Some("abc123"));
    }

    #[test]
    fn searches_multiple_cookie_headers() {
        let h = headers(&["theme=dark", "session=xyz"]);
        assert_eq!(session_cookie(&h).as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_or_empty_cookie_is_none() {
        assert_eq!(session_cookie(&headers(&[])), None);
        assert_eq!(session_cookie(&headers(&["theme=dark"])), None);
        assert_eq!(session_cookie(&headers(&["session="])), None);
    }

    #[test]
    fn cookie_value_is_taken_verbatim() {
        // No percent-decoding; the value is an opaque uuid we minted.
        let h = headers(&["session=5bd30b89-2a04-4d65-9a8c-0d0f2f2e7a10"]);
        assert_eq!(
            session_cookie(&h).as_deref(),
            Some("5bd30b89-2a04-4d65-9a8c-0d0f2f2e7a10")
        );
    }
}
