//! Startup restore.
//!
//! No backend outlives the process, so persisted live-session records are
//! discarded and the stored layout is re-applied, which spawns fresh terminals
//! (new ports, new credentials) and records them again.

use tracing::{info, warn};

use crate::error::TerminalError;
use crate::layout::LayoutType;
use crate::manager::TerminalManager;

impl TerminalManager {
    /// Run once at startup before serving requests. Returns the layout that
    /// was applied.
    pub async fn restore(&self) -> Result<LayoutType, TerminalError> {
        if let Err(e) = self.store.clear_sessions().await {
            warn!("Failed to clear stale session records: {:#}", e);
        }

        let stored = self
            .store
            .get_layout()
            .await
            .map_err(TerminalError::persistence)?;

        let layout = stored.layout_type.parse::<LayoutType>().unwrap_or_else(|_| {
            warn!(
                "Stored layout '{}' is unknown, falling back to {}",
                stored.layout_type,
                LayoutType::default()
            );
            LayoutType::default()
        });

        info!("Restoring {} layout", layout);
        self.apply_layout(layout).await?;
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use crate::layout::LayoutType;
    use crate::store::SessionStore;
    use crate::test_helpers::{FailingStore, TestRig};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn restores_grid_with_fresh_sessions() {
        let before = TestRig::new(10);
        before.manager.apply_layout(LayoutType::Grid).await.unwrap();
        assert_eq!(before.store.list_sessions().await.unwrap().len(), 4);

        // Simulate a restart: the backends are gone, the store is not.
        before.manager.cancel_all();
        before.wait_until_count(0).await;
        let store = before.store.clone();
        drop(before);

        let after = TestRig::restarted(store.clone());
        let layout = after.manager.restore().await.unwrap();
        assert_eq!(layout, LayoutType::Grid);

        let terminals = after.manager.terminals().await;
        assert_eq!(terminals.len(), 4);

        let stored = store.list_sessions().await.unwrap();
        assert_eq!(stored.len(), 4);
        let stored_ports: HashSet<u16> = stored.iter().map(|s| s.port).collect();
        let live_ports: HashSet<u16> = terminals.iter().map(|t| t.port).collect();
        assert_eq!(stored_ports, live_ports);
        // Every live port is freshly allocated by the new pool.
        assert!(live_ports.iter().all(|p| after.manager.ports().is_allocated(*p)));
        assert_eq!(after.backend.started(), 4);
    }

    #[tokio::test]
    async fn clears_stale_records() {
        let rig = TestRig::new(10);
        rig.store.save_session(40001, "stale").await.unwrap();
        rig.store.save_session(40002, "stale").await.unwrap();

        rig.manager.restore().await.unwrap();

        let stored = rig.store.list_sessions().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|s| s.title != "stale"));
    }

    #[tokio::test]
    async fn unknown_stored_layout_falls_back_to_horizontal() {
        let rig = TestRig::new(10);
        rig.store.set_raw_layout("diagonal", 7).await;

        let layout = rig.manager.restore().await.unwrap();
        assert_eq!(layout, LayoutType::Horizontal);
        assert_eq!(rig.manager.terminal_count().await, 2);
        assert_eq!(rig.store.get_layout().await.unwrap().layout_type, "horizontal");
    }

    #[tokio::test]
    async fn unreadable_layout_is_an_error() {
        let rig = TestRig::with_store(10, Arc::new(FailingStore));
        let err = rig.manager.restore().await.unwrap_err();
        assert_eq!(err.error_code(), "persistence_failed");
        assert_eq!(rig.manager.terminal_count().await, 0);
    }
}
