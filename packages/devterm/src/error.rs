//! Error taxonomy for terminal orchestration.

use crate::backend::BackendError;
use crate::credential::CredentialError;
use crate::manager::TerminalId;
use crate::port_pool::PortPoolError;

/// Shown to users for any failure to acquire a terminal's resources; the
/// detail goes to the server log.
pub const SPAWN_FAILED_MESSAGE: &str = "failed to create terminal session";

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("maximum number of terminals ({max}) reached")]
    MaxTerminalsReached { max: usize },

    #[error("port allocation failed: {0}")]
    PortAllocationFailed(#[from] PortPoolError),

    #[error("credential generation failed: {0}")]
    CredentialGenerationFailed(#[from] CredentialError),

    #[error("backend start failed: {0}")]
    BackendStartFailed(#[source] BackendError),

    #[error("terminal {0} not found")]
    TerminalNotFound(TerminalId),

    #[error("workspace {0} not found")]
    WorkspaceNotFound(i64),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("invalid title: {0}")]
    InvalidTitle(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{failed} terminal(s) did not stop cleanly during shutdown")]
    ShutdownIncomplete { failed: usize },
}

impl TerminalError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MaxTerminalsReached { .. } => "max_terminals_reached",
            Self::PortAllocationFailed(_) => "port_allocation_failed",
            Self::CredentialGenerationFailed(_) => "credential_generation_failed",
            Self::BackendStartFailed(_) => "backend_start_failed",
            Self::TerminalNotFound(_) => "terminal_not_found",
            Self::WorkspaceNotFound(_) => "workspace_not_found",
            Self::PersistenceFailed(_) => "persistence_failed",
            Self::InvalidTitle(_) => "invalid_title",
            Self::InvalidLayout(_) => "invalid_layout",
            Self::InvalidInput(_) => "invalid_input",
            Self::ShutdownIncomplete { .. } => "shutdown_incomplete",
        }
    }

    /// Text safe to show in a user interface.
    pub fn user_message(&self) -> String {
        match self {
            Self::PortAllocationFailed(_)
            | Self::CredentialGenerationFailed(_)
            | Self::BackendStartFailed(_) => SPAWN_FAILED_MESSAGE.to_string(),
            Self::PersistenceFailed(_) => "failed to access saved state".to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::PersistenceFailed(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_visible_errors_are_verbatim() {
        let err = TerminalError::MaxTerminalsReached { max: 10 };
        assert_eq!(err.user_message(), "maximum number of terminals (10) reached");
        assert_eq!(err.error_code(), "max_terminals_reached");

        let err = TerminalError::TerminalNotFound(TerminalId(7));
        assert_eq!(err.user_message(), "terminal 7 not found");
    }

    #[test]
    fn acquisition_errors_are_generic() {
        let err = TerminalError::BackendStartFailed(BackendError::Start(
            "bind 127.0.0.1:4000: address in use".to_string(),
        ));
        assert_eq!(err.user_message(), SPAWN_FAILED_MESSAGE);

        let err = TerminalError::from(CredentialError::RandomSource("getrandom".to_string()));
        assert_eq!(err.user_message(), SPAWN_FAILED_MESSAGE);
        assert_eq!(err.error_code(), "credential_generation_failed");
    }

    #[test]
    fn persistence_keeps_context_chain() {
        let err = TerminalError::persistence(
            anyhow::anyhow!("disk full").context("Failed to save workspace"),
        );
        assert_eq!(
            err.to_string(),
            "persistence failed: Failed to save workspace: disk full"
        );
    }
}
