//! Named snapshots of the terminal set that can be reloaded later.

use tracing::{info, warn};

use crate::audit::{AuditAction, AuditEvent};
use crate::error::TerminalError;
use crate::layout::LayoutType;
use crate::manager::{Terminal, TerminalManager};
use crate::store::{WorkspaceSummary, WorkspaceTerminal};
use crate::validation;

impl TerminalManager {
    /// Record every live terminal (in id order) and the current layout under
    /// `name`. Returns the workspace id.
    pub async fn save_workspace(
        &self,
        name: &str,
        description: &str,
    ) -> Result<i64, TerminalError> {
        let result = self.save_workspace_inner(name, description).await;
        match &result {
            Ok(id) => self.audit.record(
                AuditEvent::success(AuditAction::WorkspaceSave)
                    .target(id)
                    .detail("name", name.trim()),
            ),
            Err(e) => self.audit.record(
                AuditEvent::failure(AuditAction::WorkspaceSave, e).detail("name", name.trim()),
            ),
        }
        result
    }

    async fn save_workspace_inner(
        &self,
        name: &str,
        description: &str,
    ) -> Result<i64, TerminalError> {
        let name = validation::validate_workspace_name(name)?;
        let description = validation::sanitize_description(description)?;

        let terminals: Vec<WorkspaceTerminal> = self
            .terminals()
            .await
            .into_iter()
            .map(|t| WorkspaceTerminal {
                title: t.title,
                shell: t.shell,
                working_dir: t.working_dir,
            })
            .collect();

        let layout_type = match self.store.get_layout().await {
            Ok(layout) => Some(layout.layout_type),
            Err(e) => {
                warn!("Saving workspace '{}' without a layout: {:#}", name, e);
                None
            }
        };

        let id = self
            .store
            .save_workspace(&name, &description, layout_type.as_deref(), &terminals)
            .await
            .map_err(TerminalError::persistence)?;

        info!(
            "Saved workspace {} '{}' with {} terminal(s)",
            id,
            name,
            terminals.len()
        );
        Ok(id)
    }

    /// Replace the live set with the terminals saved in workspace `id`.
    ///
    /// The saved terminals are spawned before any existing one is killed. If a
    /// spawn fails, the terminals spawned so far are killed and the existing
    /// set is left as it was.
    pub async fn load_workspace(&self, id: i64) -> Result<Vec<Terminal>, TerminalError> {
        let _guard = self.layout_lock.lock().await;
        let result = self.load_workspace_locked(id).await;
        match &result {
            Ok(terminals) => self.audit.record(
                AuditEvent::success(AuditAction::WorkspaceLoad)
                    .target(id)
                    .detail("terminal_count", terminals.len()),
            ),
            Err(e) => self
                .audit
                .record(AuditEvent::failure(AuditAction::WorkspaceLoad, e).target(id)),
        }
        result
    }

    async fn load_workspace_locked(&self, id: i64) -> Result<Vec<Terminal>, TerminalError> {
        let workspace = self
            .store
            .load_workspace(id)
            .await
            .map_err(TerminalError::persistence)?
            .ok_or(TerminalError::WorkspaceNotFound(id))?;

        let previous = self.terminal_ids().await;

        let mut spawned: Vec<Terminal> = Vec::with_capacity(workspace.terminals.len());
        for saved in &workspace.terminals {
            match self
                .spawn_terminal(&saved.title, &saved.shell, saved.working_dir.as_deref())
                .await
            {
                Ok(terminal) => spawned.push(terminal),
                Err(e) => {
                    warn!(
                        "Workspace {} load failed at '{}', rolling back {} terminal(s): {}",
                        id,
                        saved.title,
                        spawned.len(),
                        e
                    );
                    for terminal in &spawned {
                        if let Err(kill_err) = self.kill_terminal(terminal.id).await {
                            warn!("Rollback of terminal {} failed: {}", terminal.id, kill_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        for old in previous {
            match self.kill_terminal(old).await {
                Ok(()) | Err(TerminalError::TerminalNotFound(_)) => {}
                Err(e) => warn!("Failed to kill previous terminal {}: {}", old, e),
            }
        }

        let count = workspace.terminals.len();
        let layout = workspace
            .layout_type
            .as_deref()
            .and_then(|name| name.parse::<LayoutType>().ok())
            .unwrap_or_else(|| LayoutType::for_terminal_count(count));
        if let Err(e) = self.store.set_layout(layout, count).await {
            warn!("Failed to persist layout after loading workspace {}: {:#}", id, e);
        }

        info!(
            "Loaded workspace {} '{}' ({} terminal(s), {} layout)",
            id, workspace.name, count, layout
        );
        Ok(spawned)
    }

    pub async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>, TerminalError> {
        self.store
            .list_workspaces()
            .await
            .map_err(TerminalError::persistence)
    }
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditAction, Outcome};
    use crate::error::TerminalError;
    use crate::layout::LayoutType;
    use crate::manager::ManagerOptions;
    use crate::store::{SessionStore, WorkspaceTerminal};
    use crate::test_helpers::TestRig;

    #[tokio::test]
    async fn save_captures_terminals_in_order() {
        let rig = TestRig::new(10);
        rig.manager.apply_layout(LayoutType::Vertical).await.unwrap();
        rig.manager
            .spawn_terminal("logs", "/bin/sh", Some("/var/log"))
            .await
            .unwrap();

        let id = rig
            .manager
            .save_workspace(" backend ", "api\x00 work")
            .await
            .unwrap();

        let saved = rig.store.load_workspace(id).await.unwrap().unwrap();
        assert_eq!(saved.name, "backend");
        assert_eq!(saved.description, "api work");
        assert_eq!(saved.layout_type.as_deref(), Some("vertical"));
        let titles: Vec<&str> = saved.terminals.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["Terminal 1", "Terminal 2", "logs"]);
        assert_eq!(saved.terminals[2].working_dir.as_deref(), Some("/var/log"));

        let listed = rig.manager.list_workspaces().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].terminal_count, 3);
        assert_eq!(rig.audit.count(AuditAction::WorkspaceSave, Outcome::Success), 1);
    }

    #[tokio::test]
    async fn save_rejects_bad_names() {
        let rig = TestRig::new(10);
        let err = rig.manager.save_workspace("  ", "").await.unwrap_err();
        assert!(matches!(err, TerminalError::InvalidInput(_)));
        assert!(rig.manager.list_workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_replaces_live_set() {
        let rig = TestRig::new(10);
        let saved = vec![
            WorkspaceTerminal {
                title: "editor".to_string(),
                shell: "/bin/bash".to_string(),
                working_dir: Some("/srv/app".to_string()),
            },
            WorkspaceTerminal {
                title: "server".to_string(),
                shell: "/bin/bash".to_string(),
                working_dir: None,
            },
            WorkspaceTerminal {
                title: "tests".to_string(),
                shell: "/bin/sh".to_string(),
                working_dir: None,
            },
        ];
        let id = rig
            .store
            .save_workspace("dev", "", None, &saved)
            .await
            .unwrap();

        rig.manager.apply_layout(LayoutType::Horizontal).await.unwrap();
        let old: Vec<u16> = rig.manager.terminals().await.iter().map(|t| t.port).collect();

        let loaded = rig.manager.load_workspace(id).await.unwrap();
        assert_eq!(loaded.len(), 3);

        let live = rig.manager.terminals().await;
        let titles: Vec<&str> = live.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["editor", "server", "tests"]);
        assert!(old.iter().all(|p| !rig.manager.ports().is_allocated(*p)));

        // No saved layout and more than two terminals.
        let layout = rig.store.get_layout().await.unwrap();
        assert_eq!(layout.layout_type, "grid");
        assert_eq!(layout.terminal_count, 3);
    }

    #[tokio::test]
    async fn load_uses_saved_layout() {
        let rig = TestRig::new(10);
        rig.manager.apply_layout(LayoutType::Vertical).await.unwrap();
        let id = rig.manager.save_workspace("pair", "").await.unwrap();
        rig.manager.apply_layout(LayoutType::Grid).await.unwrap();

        rig.manager.load_workspace(id).await.unwrap();
        assert_eq!(rig.manager.terminal_count().await, 2);
        assert_eq!(rig.store.get_layout().await.unwrap().layout_type, "vertical");
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_terminals() {
        let rig = TestRig::with_options(ManagerOptions {
            max_terminals: 5,
            ..Default::default()
        });
        let saved: Vec<WorkspaceTerminal> = (1..=4)
            .map(|i| WorkspaceTerminal {
                title: format!("saved {i}"),
                shell: "/bin/bash".to_string(),
                working_dir: None,
            })
            .collect();
        let id = rig
            .store
            .save_workspace("big", "", Some("grid"), &saved)
            .await
            .unwrap();

        rig.manager.apply_layout(LayoutType::Horizontal).await.unwrap();
        let before: Vec<String> = rig
            .manager
            .terminals()
            .await
            .into_iter()
            .map(|t| t.title)
            .collect();

        // 2 live + 4 saved exceeds the capacity of 5 on the fourth spawn.
        let err = rig.manager.load_workspace(id).await.unwrap_err();
        assert!(matches!(err, TerminalError::MaxTerminalsReached { .. }));

        let after: Vec<String> = rig
            .manager
            .terminals()
            .await
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(after, before);
        assert_eq!(rig.manager.ports().allocated_count(), 2);
        assert_eq!(rig.audit.count(AuditAction::WorkspaceLoad, Outcome::Failure), 1);
    }

    #[tokio::test]
    async fn load_unknown_workspace() {
        let rig = TestRig::new(10);
        let err = rig.manager.load_workspace(77).await.unwrap_err();
        assert!(matches!(err, TerminalError::WorkspaceNotFound(77)));
    }
}
