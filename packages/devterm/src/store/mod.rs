//! Persistence for live-session records, the active layout and saved
//! workspaces.
//!
//! The manager never assumes a store call is atomic with its own in-memory
//! changes. Session and layout writes are best-effort from its point of view;
//! workspace operations surface failures because they have nothing else to do.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::LayoutType;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key of a persisted live-session record.
pub type StorageId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredSession {
    pub id: StorageId,
    pub port: u16,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// The layout exactly as stored; `layout_type` is not guaranteed to name a
/// known [`LayoutType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredLayout {
    pub layout_type: String,
    pub terminal_count: usize,
}

impl Default for StoredLayout {
    fn default() -> Self {
        Self {
            layout_type: LayoutType::Horizontal.as_str().to_string(),
            terminal_count: LayoutType::Horizontal.terminal_count(),
        }
    }
}

/// One terminal as recorded in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceTerminal {
    pub title: String,
    pub shell: String,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub layout_type: Option<String>,
    pub terminal_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub layout_type: Option<String>,
    /// In saved order.
    pub terminals: Vec<WorkspaceTerminal>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_session(&self, port: u16, title: &str) -> Result<StorageId>;

    async fn update_session_title(&self, id: StorageId, title: &str) -> Result<()>;

    async fn delete_session(&self, id: StorageId) -> Result<()>;

    async fn clear_sessions(&self) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<StoredSession>>;

    async fn get_layout(&self) -> Result<StoredLayout>;

    async fn set_layout(&self, layout: LayoutType, terminal_count: usize) -> Result<()>;

    async fn save_workspace(
        &self,
        name: &str,
        description: &str,
        layout_type: Option<&str>,
        terminals: &[WorkspaceTerminal],
    ) -> Result<i64>;

    /// Most recently updated first.
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>>;

    async fn load_workspace(&self, id: i64) -> Result<Option<Workspace>>;
}
