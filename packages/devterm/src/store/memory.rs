use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{
    SessionStore, StorageId, StoredLayout, StoredSession, Workspace, WorkspaceSummary,
    WorkspaceTerminal,
};
use crate::layout::LayoutType;

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_session_id: StorageId,
    sessions: BTreeMap<StorageId, StoredSession>,
    layout: StoredLayout,
    last_workspace_id: i64,
    workspaces: BTreeMap<i64, (Workspace, chrono::DateTime<Utc>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the raw layout row, including names no [`LayoutType`] parses.
    pub async fn set_raw_layout(&self, layout_type: &str, terminal_count: usize) {
        self.inner.lock().await.layout = StoredLayout {
            layout_type: layout_type.to_string(),
            terminal_count,
        };
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, port: u16, title: &str) -> Result<StorageId> {
        let mut inner = self.inner.lock().await;
        inner.last_session_id += 1;
        let id = inner.last_session_id;
        inner.sessions.insert(
            id,
            StoredSession {
                id,
                port,
                title: title.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update_session_title(&self, id: StorageId, title: &str) -> Result<()> {
        if let Some(session) = self.inner.lock().await.sessions.get_mut(&id) {
            session.title = title.to_string();
        }
        Ok(())
    }

    async fn delete_session(&self, id: StorageId) -> Result<()> {
        self.inner.lock().await.sessions.remove(&id);
        Ok(())
    }

    async fn clear_sessions(&self) -> Result<()> {
        self.inner.lock().await.sessions.clear();
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Ok(self.inner.lock().await.sessions.values().cloned().collect())
    }

    async fn get_layout(&self) -> Result<StoredLayout> {
        Ok(self.inner.lock().await.layout.clone())
    }

    async fn set_layout(&self, layout: LayoutType, terminal_count: usize) -> Result<()> {
        self.inner.lock().await.layout = StoredLayout {
            layout_type: layout.as_str().to_string(),
            terminal_count,
        };
        Ok(())
    }

    async fn save_workspace(
        &self,
        name: &str,
        description: &str,
        layout_type: Option<&str>,
        terminals: &[WorkspaceTerminal],
    ) -> Result<i64> {
        if name.is_empty() {
            bail!("workspace name cannot be empty");
        }
        let mut inner = self.inner.lock().await;
        inner.last_workspace_id += 1;
        let id = inner.last_workspace_id;
        let now = Utc::now();
        inner.workspaces.insert(
            id,
            (
                Workspace {
                    id,
                    name: name.to_string(),
                    description: description.to_string(),
                    layout_type: layout_type.map(str::to_string),
                    terminals: terminals.to_vec(),
                    created_at: now,
                },
                now,
            ),
        );
        Ok(id)
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        let inner = self.inner.lock().await;
        let mut summaries: Vec<WorkspaceSummary> = inner
            .workspaces
            .values()
            .map(|(ws, updated_at)| WorkspaceSummary {
                id: ws.id,
                name: ws.name.clone(),
                description: ws.description.clone(),
                layout_type: ws.layout_type.clone(),
                terminal_count: ws.terminals.len(),
                created_at: ws.created_at,
                updated_at: *updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(summaries)
    }

    async fn load_workspace(&self, id: i64) -> Result<Option<Workspace>> {
        Ok(self
            .inner
            .lock()
            .await
            .workspaces
            .get(&id)
            .map(|(ws, _)| ws.clone()))
    }
}
