//! Terminal session orchestration.
//!
//! A [`TerminalManager`] owns a bounded set of live terminals. Each terminal is
//! a pty-backed web terminal (see `tty_wrapper`) listening on its own
//! OS-assigned localhost port behind a per-terminal basic-auth credential. A
//! reverse proxy in front of the manager reaches a terminal through
//! [`Terminal::proxy_target`].
//!
//! Session records, the active layout and saved workspaces go through a
//! [`SessionStore`]; state-changing operations are reported to an
//! [`AuditSink`].

pub mod audit;
pub mod backend;
pub mod config;
pub mod credential;
pub mod error;
pub mod layout;
pub mod manager;
pub mod port_pool;
mod restore;
pub mod store;
pub mod validation;
mod workspace;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAudit, NoopAudit, Outcome, TracingAudit};
pub use backend::{BackendError, BackendHandle, StartRequest, TerminalBackend, TtyBackend};
pub use credential::{Credential, CredentialError, CredentialSource, OsCredentials};
pub use error::TerminalError;
pub use layout::LayoutType;
pub use manager::{
    ManagerOptions, ProxyTarget, Terminal, TerminalId, TerminalManager, TerminalManagerBuilder,
};
pub use port_pool::{PortPool, PortPoolError};
pub use store::{MemoryStore, SessionStore, SqliteStore};
