//! Starting and stopping the terminal server behind each session.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tty_wrapper::{ServerOptions, TtyServer};

use crate::credential::Credential;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start terminal backend: {0}")]
    Start(String),

    #[error("terminal backend did not stop within {0:?}")]
    StopTimedOut(Duration),
}

/// Everything a backend needs to serve one terminal.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub port: u16,
    pub credential: Credential,
    pub title: String,
    pub shell: String,
    pub working_dir: Option<String>,
}

/// Cancellation plumbing for a running backend.
///
/// `cancel` asks the backend to stop; `finished` is cancelled by the backend
/// once its listener and pty are released, whether it was asked to or not.
#[derive(Debug, Clone)]
pub struct BackendHandle {
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl BackendHandle {
    pub fn new(cancel: CancellationToken, finished: CancellationToken) -> Self {
        Self { cancel, finished }
    }

    /// Signal the backend without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Cancel and wait for the backend to release its resources. `None` waits
    /// as long as it takes.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<(), BackendError> {
        self.cancel.cancel();
        match timeout {
            None => {
                self.finished.cancelled().await;
                Ok(())
            }
            Some(limit) => tokio::time::timeout(limit, self.finished.cancelled())
                .await
                .map_err(|_| BackendError::StopTimedOut(limit)),
        }
    }
}

#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Start serving on `localhost:request.port`. Nothing may be left listening
    /// if this returns an error. `cancel` is owned by the caller and stops the
    /// backend when cancelled.
    async fn start(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<BackendHandle, BackendError>;
}

/// Runs each terminal on an in-process [`TtyServer`].
#[derive(Debug, Clone)]
pub struct TtyBackend {
    reconnect: Duration,
}

impl Default for TtyBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TtyBackend {
    pub fn new(reconnect: Duration) -> Self {
        Self { reconnect }
    }
}

#[async_trait]
impl TerminalBackend for TtyBackend {
    async fn start(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<BackendHandle, BackendError> {
        let (command, args) = shell_invocation(&request.shell, request.working_dir.as_deref());
        debug!(
            "Starting backend on port {}: {} {:?}",
            request.port, command, args
        );

        let options = ServerOptions {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: request.port,
            permit_write: true,
            reconnect: Some(self.reconnect),
            title: request.title,
            credential: Some(request.credential.as_pair()),
            command,
            args,
            working_dir: None,
        };

        let server = TtyServer::start(options, cancel)
            .await
            .map_err(|e| BackendError::Start(format!("{e:#}")))?;
        info!("Backend serving on {}", server.local_addr());

        Ok(BackendHandle::new(
            server.cancel_token(),
            server.finished_token(),
        ))
    }
}

/// The program and arguments that start `shell`, entering `working_dir` first
/// when one is given.
pub fn shell_invocation(shell: &str, working_dir: Option<&str>) -> (String, Vec<String>) {
    match working_dir.filter(|d| !d.is_empty()) {
        Some(dir) => (
            "/bin/sh".to_string(),
            vec![
                "-c".to_string(),
                format!("cd {} && exec {}", shell_quote(dir), shell_quote(shell)),
            ],
        ),
        None => (shell.to_string(), Vec::new()),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
