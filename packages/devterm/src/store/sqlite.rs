use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{
    SessionStore, StorageId, StoredLayout, StoredSession, Workspace, WorkspaceSummary,
    WorkspaceTerminal,
};
use crate::layout::LayoutType;

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 2;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and bring its schema up
    /// to date.
    pub async fn open(url: &str) -> Result<Self> {
        info!("Connecting to database: {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database url: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", url))?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database; lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade devterm.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        info!(
            "Database schema is up to date (version {})",
            current_version
        );
        return Ok(());
    }

    info!(
        "Migrating database from version {} to {}",
        current_version, SCHEMA_VERSION
    );

    if current_version < 1 {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                port INTEGER NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_layout (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                layout_type TEXT NOT NULL,
                terminal_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO active_layout (id, layout_type, terminal_count) VALUES (1, 'horizontal', 2)",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version, description) VALUES (1, 'Live sessions and active layout')")
            .execute(pool)
            .await?;
    }

    if current_version < 2 {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                layout_type TEXT,
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspace_terminals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                title TEXT NOT NULL,
                shell TEXT NOT NULL,
                working_dir TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workspace_terminals_workspace ON workspace_terminals(workspace_id, position)",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version, description) VALUES (2, 'Saved workspaces')")
            .execute(pool)
            .await?;
    }

    info!("Database migrated to version {}", SCHEMA_VERSION);
    Ok(())
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn save_session(&self, port: u16, title: &str) -> Result<StorageId> {
        let result = sqlx::query("INSERT INTO active_sessions (port, title) VALUES (?, ?)")
            .bind(i64::from(port))
            .bind(title)
            .execute(&self.pool)
            .await
            .context("Failed to save session")?;
        Ok(result.last_insert_rowid())
    }

    async fn update_session_title(&self, id: StorageId, title: &str) -> Result<()> {
        sqlx::query("UPDATE active_sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update session title")?;
        Ok(())
    }

    async fn delete_session(&self, id: StorageId) -> Result<()> {
        sqlx::query("DELETE FROM active_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(())
    }

    async fn clear_sessions(&self) -> Result<()> {
        sqlx::query("DELETE FROM active_sessions")
            .execute(&self.pool)
            .await
            .context("Failed to clear sessions")?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        let rows = sqlx::query("SELECT id, port, title, created_at FROM active_sessions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sessions")?;

        rows.into_iter()
            .map(|row| -> Result<StoredSession> {
                let port: i64 = row.try_get("port")?;
                Ok(StoredSession {
                    id: row.try_get("id")?,
                    port: u16::try_from(port).context("Stored port out of range")?,
                    title: row.try_get("title")?,
                    created_at: timestamp(row.try_get("created_at")?),
                })
            })
            .collect()
    }

    async fn get_layout(&self) -> Result<StoredLayout> {
        let row = sqlx::query("SELECT layout_type, terminal_count FROM active_layout WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read active layout")?;

        let Some(row) = row else {
            return Ok(StoredLayout::default());
        };
        let count: i64 = row.try_get("terminal_count")?;
        Ok(StoredLayout {
            layout_type: row.try_get("layout_type")?,
            terminal_count: usize::try_from(count).unwrap_or(0),
        })
    }

    async fn set_layout(&self, layout: LayoutType, terminal_count: usize) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_layout (id, layout_type, terminal_count, updated_at)
            VALUES (1, ?, ?, unixepoch())
            ON CONFLICT(id) DO UPDATE SET
                layout_type = excluded.layout_type,
                terminal_count = excluded.terminal_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(layout.as_str())
        .bind(terminal_count as i64)
        .execute(&self.pool)
        .await
        .context("Failed to update active layout")?;
        Ok(())
    }

    async fn save_workspace(
        &self,
        name: &str,
        description: &str,
        layout_type: Option<&str>,
        terminals: &[WorkspaceTerminal],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let workspace_id = sqlx::query(
            "INSERT INTO workspaces (name, description, layout_type) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(description)
        .bind(layout_type)
        .execute(&mut *tx)
        .await
        .context("Failed to save workspace")?
        .last_insert_rowid();

        for (position, terminal) in terminals.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO workspace_terminals (workspace_id, position, title, shell, working_dir)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(workspace_id)
            .bind(position as i64)
            .bind(&terminal.title)
            .bind(&terminal.shell)
            .bind(terminal.working_dir.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to save workspace terminal {}", position))?;
        }

        tx.commit().await?;
        Ok(workspace_id)
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT w.id, w.name, w.description, w.layout_type, w.created_at, w.updated_at,
                   (SELECT COUNT(*) FROM workspace_terminals t WHERE t.workspace_id = w.id) AS terminal_count
            FROM workspaces w
            ORDER BY w.updated_at DESC, w.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workspaces")?;

        rows.into_iter()
            .map(|row| -> Result<WorkspaceSummary> {
                let count: i64 = row.try_get("terminal_count")?;
                Ok(WorkspaceSummary {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    layout_type: row.try_get("layout_type")?,
                    terminal_count: usize::try_from(count).unwrap_or(0),
                    created_at: timestamp(row.try_get("created_at")?),
                    updated_at: timestamp(row.try_get("updated_at")?),
                })
            })
            .collect()
    }

    async fn load_workspace(&self, id: i64) -> Result<Option<Workspace>> {
        let row = sqlx::query(
            "SELECT id, name, description, layout_type, created_at FROM workspaces WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load workspace")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let terminals = sqlx::query(
            r#"
            SELECT title, shell, working_dir
            FROM workspace_terminals
            WHERE workspace_id = ?
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load workspace terminals")?
        .into_iter()
        .map(|t| -> Result<WorkspaceTerminal> {
            Ok(WorkspaceTerminal {
                title: t.try_get("title")?,
                shell: t.try_get("shell")?,
                working_dir: t.try_get("working_dir")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(Workspace {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            layout_type: row.try_get("layout_type")?,
            terminals,
            created_at: timestamp(row.try_get("created_at")?),
        }))
    }
}
