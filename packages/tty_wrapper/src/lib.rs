//! Pty-backed terminal server.
//!
//! One [`TtyServer`] runs one interactive command on a pseudo terminal and
//! exposes it over HTTP and WebSocket on a single local address. Every route is
//! gated by HTTP Basic auth when a credential is configured.
//!
//! The server stops when its cancellation token fires or when the child process
//! exits; [`TtyServer::finished`] resolves once the listener is closed and the
//! child has been reaped.

pub mod auth;
mod page;
pub mod pty_actor;
pub mod pty_session;
pub mod websocket;

pub use pty_session::{OutputEvent, PtySession, PtyState};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// How a single terminal server is launched.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub address: IpAddr,
    /// 0 lets the OS pick.
    pub port: u16,
    /// Whether WebSocket clients may type into the terminal.
    pub permit_write: bool,
    /// Client reconnect interval advertised to the page; `None` disables reconnect.
    pub reconnect: Option<Duration>,
    pub title: String,
    /// `user:password` for HTTP Basic auth; `None` serves without auth.
    pub credential: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            permit_write: false,
            reconnect: None,
            title: "Terminal".to_string(),
            credential: None,
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

#[derive(Clone)]
pub struct WrapperState {
    pub session: Arc<PtySession>,
    pub options: Arc<ServerOptions>,
    /// Cancelled when the server starts shutting down; open sockets watch it.
    pub closing: CancellationToken,
}

pub fn create_routes(state: WrapperState) -> Router {
    Router::new()
        .route("/", get(page::index))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn websocket_handler(
    State(state): State<WrapperState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_websocket(socket, state))
}

/// Child state as JSON; 503 once the pty actor is gone.
async fn health(State(state): State<WrapperState>) -> impl IntoResponse {
    match state.session.get_state().await {
        Ok(pty) => (StatusCode::OK, Json(pty)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// A running terminal server.
#[derive(Debug)]
pub struct TtyServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl TtyServer {
    /// Bind the listener, start the pty child and serve until `cancel` fires or
    /// the child exits.
    ///
    /// The listener is bound before the child is spawned; if spawning fails the
    /// listener is dropped before this returns.
    pub async fn start(options: ServerOptions, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind((options.address, options.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", options.address, options.port))?;
        let addr = listener.local_addr()?;

        let session = PtySession::spawn(
            &options.command,
            &options.args,
            options.working_dir.as_deref(),
        )
        .with_context(|| format!("Failed to start '{}'", options.command))?;
        let session = Arc::new(session);

        let closing = cancel.child_token();
        let state = WrapperState {
            session: session.clone(),
            options: Arc::new(options),
            closing: closing.clone(),
        };
        let app = create_routes(state);

        let finished = CancellationToken::new();
        let done = finished.clone();
        let exited = session.exited();
        tokio::spawn(async move {
            let shutdown = async move {
                tokio::select! {
                    _ = closing.cancelled() => {}
                    _ = exited.cancelled() => info!("Child on {} exited", addr),
                }
                closing.cancel();
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Terminal server on {} failed: {}", addr, e);
            }

            session.close().await;
            info!("Terminal server on {} stopped", addr);
            done.cancel();
        });

        info!("Terminal server listening on http://{}", addr);

        Ok(Self {
            addr,
            cancel,
            finished,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancelled once the listener is closed and the child is reaped.
    pub fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Cancel and wait for the listener and child to be released.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.finished.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_bind_localhost_read_only() {
        let options = ServerOptions::default();
        assert_eq!(options.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(options.port, 0);
        assert!(!options.permit_write);
        assert!(options.credential.is_none());
        assert!(options.reconnect.is_none());
    }

    #[tokio::test]
    async fn start_fails_when_port_is_taken() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let options = ServerOptions {
            port,
            command: "/bin/sh".to_string(),
            ..Default::default()
        };
        let result = TtyServer::start(options, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn start_releases_listener_when_command_is_missing() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let options = ServerOptions {
            port,
            command: "/nonexistent/definitely-not-a-shell".to_string(),
            ..Default::default()
        };
        let result = TtyServer::start(options, CancellationToken::new()).await;
        assert!(result.is_err());

        // Nothing may still be listening on the port.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
