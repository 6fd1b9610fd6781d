//! The set of live terminals.
//!
//! A terminal moves Spawning → Running → Stopping → Terminated. Spawning and
//! Stopping happen outside the state lock: the lock only guards bookkeeping,
//! never a backend start or stop. Capacity is enforced by reserving a slot under
//! the write lock before any resource is acquired and converting the
//! reservation into a registered terminal under the same lock.
//!
//! Every backend runs under a child of the manager's root cancellation token, so
//! [`TerminalManager::cancel_all`] reaches all of them without waiting. A
//! watcher task per terminal notices backends that finish on their own and
//! removes them from the map (crash reconciliation).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditSink, NoopAudit};
use crate::backend::{BackendHandle, StartRequest, TerminalBackend};
use crate::credential::{Credential, CredentialSource, OsCredentials};
use crate::error::TerminalError;
use crate::layout::LayoutType;
use crate::port_pool::PortPool;
use crate::store::{SessionStore, StorageId};
use crate::validation;

pub const DEFAULT_MAX_TERMINALS: usize = 10;
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Manager-local terminal id. Ids start at 1 and are never reused within a
/// process; [`TerminalId::NONE`] means "no terminal".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(pub u64);

impl TerminalId {
    pub const NONE: TerminalId = TerminalId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one live terminal.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub id: TerminalId,
    /// Set once the session record has been persisted.
    pub storage_id: Option<StorageId>,
    pub port: u16,
    pub title: String,
    pub shell: String,
    pub working_dir: Option<String>,
    pub credential: Credential,
    pub created_at: DateTime<Utc>,
    handle: BackendHandle,
    /// Cancelled once a kill owns cleanup, releasing the crash watcher.
    unwatch: CancellationToken,
}

/// Where a proxy forwards browser traffic for one terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub port: u16,
    /// Value for the `Authorization` header.
    pub authorization: String,
}

impl Terminal {
    pub fn proxy_target(&self) -> ProxyTarget {
        ProxyTarget {
            port: self.port,
            authorization: self.credential.basic_auth_header(),
        }
    }

    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub max_terminals: usize,
    /// Shell for terminals spawned without one (layout changes, restore).
    pub default_shell: String,
    /// Upper bound on waiting for a backend to stop; `None` waits indefinitely.
    pub stop_timeout: Option<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            max_terminals: DEFAULT_MAX_TERMINALS,
            default_shell: DEFAULT_SHELL.to_string(),
            stop_timeout: None,
        }
    }
}

struct ManagerState {
    terminals: HashMap<TerminalId, Terminal>,
    next_id: u64,
    active_tab: TerminalId,
}

/// A capacity slot held by an in-flight spawn. Released on drop unless the
/// spawn registered its terminal.
struct SpawnReservation<'a> {
    pending: &'a AtomicUsize,
    held: bool,
}

impl SpawnReservation<'_> {
    /// Must be called with the state write lock held.
    fn commit(mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.held = false;
    }
}

impl Drop for SpawnReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// How a kill went, for callers that aggregate.
pub(crate) struct KillOutcome {
    pub(crate) clean: bool,
}

pub struct TerminalManager {
    me: Weak<TerminalManager>,
    state: RwLock<ManagerState>,
    pending_spawns: AtomicUsize,
    watchers: Arc<AtomicUsize>,
    ports: Arc<PortPool>,
    credentials: Arc<dyn CredentialSource>,
    backend: Arc<dyn TerminalBackend>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) audit: Arc<dyn AuditSink>,
    root: CancellationToken,
    /// Serializes operations that reshape the whole set (layout, workspace load).
    pub(crate) layout_lock: Mutex<()>,
    options: ManagerOptions,
}

pub struct TerminalManagerBuilder {
    backend: Arc<dyn TerminalBackend>,
    store: Arc<dyn SessionStore>,
    ports: Arc<PortPool>,
    credentials: Arc<dyn CredentialSource>,
    audit: Arc<dyn AuditSink>,
    root: CancellationToken,
    options: ManagerOptions,
}

impl TerminalManagerBuilder {
    pub fn ports(mut self, ports: Arc<PortPool>) -> Self {
        self.ports = ports;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialSource>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Parent scope for every backend's cancellation token.
    pub fn root_token(mut self, root: CancellationToken) -> Self {
        self.root = root;
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_terminals(mut self, max: usize) -> Self {
        self.options.max_terminals = max;
        self
    }

    pub fn build(self) -> Arc<TerminalManager> {
        Arc::new_cyclic(|me| TerminalManager {
            me: me.clone(),
            state: RwLock::new(ManagerState {
                terminals: HashMap::new(),
                next_id: 1,
                active_tab: TerminalId::NONE,
            }),
            pending_spawns: AtomicUsize::new(0),
            watchers: Arc::new(AtomicUsize::new(0)),
            ports: self.ports,
            credentials: self.credentials,
            backend: self.backend,
            store: self.store,
            audit: self.audit,
            root: self.root,
            layout_lock: Mutex::new(()),
            options: self.options,
        })
    }
}

impl TerminalManager {
    pub fn builder(
        backend: Arc<dyn TerminalBackend>,
        store: Arc<dyn SessionStore>,
    ) -> TerminalManagerBuilder {
        TerminalManagerBuilder {
            backend,
            store,
            ports: Arc::new(PortPool::new()),
            credentials: Arc::new(OsCredentials),
            audit: Arc::new(NoopAudit),
            root: CancellationToken::new(),
            options: ManagerOptions::default(),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn max_terminals(&self) -> usize {
        self.options.max_terminals
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    async fn reserve_slot(&self) -> Result<SpawnReservation<'_>, TerminalError> {
        let state = self.state.write().await;
        let pending = self.pending_spawns.load(Ordering::SeqCst);
        if state.terminals.len() + pending >= self.options.max_terminals {
            return Err(TerminalError::MaxTerminalsReached {
                max: self.options.max_terminals,
            });
        }
        self.pending_spawns.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnReservation {
            pending: &self.pending_spawns,
            held: true,
        })
    }

    /// Start a new terminal. An empty `shell` means the default shell.
    pub async fn spawn_terminal(
        &self,
        title: &str,
        shell: &str,
        working_dir: Option<&str>,
    ) -> Result<Terminal, TerminalError> {
        let result = self.spawn_inner(title, shell, working_dir).await;
        match &result {
            Ok(terminal) => self.audit.record(
                AuditEvent::success(AuditAction::TerminalSpawn)
                    .target(terminal.id)
                    .detail("port", terminal.port)
                    .detail("title", terminal.title.clone()),
            ),
            Err(e) => self.audit.record(
                AuditEvent::failure(AuditAction::TerminalSpawn, e).detail("title", title),
            ),
        }
        result
    }

    async fn spawn_inner(
        &self,
        title: &str,
        shell: &str,
        working_dir: Option<&str>,
    ) -> Result<Terminal, TerminalError> {
        let title = validation::validate_title(title)?;
        let shell = if shell.trim().is_empty() {
            self.options.default_shell.clone()
        } else {
            shell.trim().to_string()
        };
        validation::validate_shell(&shell)?;
        let working_dir = working_dir
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);
        if let Some(dir) = &working_dir {
            validation::validate_path("working_dir", dir)?;
        }

        let reservation = self.reserve_slot().await?;

        let port = self.ports.allocate().inspect_err(|e| {
            warn!("Port allocation failed for '{}': {}", title, e);
        })?;

        let credential = match self.credentials.generate() {
            Ok(credential) => credential,
            Err(e) => {
                warn!("Credential generation failed for '{}': {}", title, e);
                self.ports.release(port);
                return Err(e.into());
            }
        };

        let request = StartRequest {
            port,
            credential: credential.clone(),
            title: title.clone(),
            shell: shell.clone(),
            working_dir: working_dir.clone(),
        };
        let handle = match self.backend.start(request, self.root.child_token()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Backend for '{}' on port {} failed to start: {}", title, port, e);
                self.ports.release(port);
                return Err(TerminalError::BackendStartFailed(e));
            }
        };

        let mut terminal = {
            let mut state = self.state.write().await;
            let id = TerminalId(state.next_id);
            state.next_id += 1;

            let terminal = Terminal {
                id,
                storage_id: None,
                port,
                title,
                shell,
                working_dir,
                credential,
                created_at: Utc::now(),
                handle,
                unwatch: CancellationToken::new(),
            };
            state.terminals.insert(id, terminal.clone());
            if state.active_tab.is_none() {
                state.active_tab = id;
            }
            reservation.commit();
            terminal
        };

        self.watch(
            terminal.id,
            terminal.port,
            terminal.handle.finished_token(),
            terminal.unwatch.clone(),
        );
        info!(
            "Spawned terminal {} '{}' on port {}",
            terminal.id, terminal.title, terminal.port
        );

        match self.store.save_session(terminal.port, &terminal.title).await {
            Ok(storage_id) => {
                let registered = {
                    let mut state = self.state.write().await;
                    match state.terminals.get_mut(&terminal.id) {
                        Some(live) => {
                            live.storage_id = Some(storage_id);
                            true
                        }
                        None => false,
                    }
                };
                if registered {
                    terminal.storage_id = Some(storage_id);
                } else if let Err(e) = self.store.delete_session(storage_id).await {
                    // Gone before the record landed; nobody else knows the key.
                    warn!(
                        "Failed to delete record {} of terminal {}: {:#}",
                        storage_id, terminal.id, e
                    );
                }
            }
            Err(e) => warn!(
                "Failed to persist terminal {} (it will not survive a restart): {:#}",
                terminal.id, e
            ),
        }

        Ok(terminal)
    }

    /// Reconcile a backend that finishes without a kill. The task ends early
    /// when `unwatch` fires, so a backend that never finishes does not pin it.
    fn watch(
        &self,
        id: TerminalId,
        port: u16,
        finished: CancellationToken,
        unwatch: CancellationToken,
    ) {
        let manager = self.me.clone();
        let watchers = self.watchers.clone();
        watchers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.cancelled() => {
                    if let Some(manager) = manager.upgrade() {
                        manager.reconcile_finished(id, port).await;
                    }
                }
                _ = unwatch.cancelled() => {}
            }
            watchers.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Crash watchers still running.
    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }

    async fn reconcile_finished(&self, id: TerminalId, port: u16) {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state.terminals.remove(&id);
            if removed.is_some() && state.active_tab == id {
                state.active_tab = next_active(&state.terminals);
            }
            removed
        };
        let Some(terminal) = removed else {
            // Killed explicitly; the kill path owns cleanup.
            return;
        };

        self.ports.release(port);
        // The persisted record stays until the next restore.
        if self.root.is_cancelled() {
            info!("Terminal {} stopped with the service", id);
        } else {
            warn!(
                "Terminal {} (port {}) exited unexpectedly, cleaned up",
                id, port
            );
            self.audit.record(
                AuditEvent::success(AuditAction::TerminalCrash)
                    .target(id)
                    .detail("port", port)
                    .detail("title", terminal.title),
            );
        }
    }

    pub async fn kill_terminal(&self, id: TerminalId) -> Result<(), TerminalError> {
        match self.kill_inner(id).await {
            Ok(outcome) => {
                self.audit.record(
                    AuditEvent::success(AuditAction::TerminalKill)
                        .target(id)
                        .detail("clean", outcome.clean),
                );
                Ok(())
            }
            Err(e) => {
                self.audit
                    .record(AuditEvent::failure(AuditAction::TerminalKill, &e).target(id));
                Err(e)
            }
        }
    }

    pub(crate) async fn kill_inner(&self, id: TerminalId) -> Result<KillOutcome, TerminalError> {
        let terminal = {
            let mut state = self.state.write().await;
            let terminal = state
                .terminals
                .remove(&id)
                .ok_or(TerminalError::TerminalNotFound(id))?;
            if state.active_tab == id {
                state.active_tab = next_active(&state.terminals);
            }
            terminal
        };
        terminal.unwatch.cancel();

        debug!("Stopping terminal {} on port {}", id, terminal.port);
        let clean = match terminal.handle.stop(self.options.stop_timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Terminal {} backend did not stop cleanly: {}", id, e);
                false
            }
        };
        self.ports.release(terminal.port);

        if let Some(storage_id) = terminal.storage_id {
            if let Err(e) = self.store.delete_session(storage_id).await {
                warn!(
                    "Failed to delete record {} of terminal {}: {:#}",
                    storage_id, id, e
                );
            }
        }

        info!("Killed terminal {} (port {})", id, terminal.port);
        Ok(KillOutcome { clean })
    }

    /// Change a terminal's title in place and mirror it to the store.
    pub async fn rename_terminal(
        &self,
        id: TerminalId,
        title: &str,
    ) -> Result<Terminal, TerminalError> {
        let result = self.rename_inner(id, title).await;
        match &result {
            Ok(terminal) => self.audit.record(
                AuditEvent::success(AuditAction::TerminalRename)
                    .target(id)
                    .detail("title", terminal.title.clone()),
            ),
            Err(e) => self
                .audit
                .record(AuditEvent::failure(AuditAction::TerminalRename, e).target(id)),
        }
        result
    }

    async fn rename_inner(&self, id: TerminalId, title: &str) -> Result<Terminal, TerminalError> {
        let title = validation::validate_title(title)?;
        let terminal = {
            let mut state = self.state.write().await;
            let terminal = state
                .terminals
                .get_mut(&id)
                .ok_or(TerminalError::TerminalNotFound(id))?;
            terminal.title = title;
            terminal.clone()
        };

        if let Some(storage_id) = terminal.storage_id {
            if let Err(e) = self
                .store
                .update_session_title(storage_id, &terminal.title)
                .await
            {
                warn!("Failed to persist title of terminal {}: {:#}", id, e);
            }
        }
        Ok(terminal)
    }

    /// Grow or shrink the live set to the layout's terminal count.
    ///
    /// New terminals are titled `Terminal N`; excess terminals are killed
    /// newest first. A failure part way through is returned without undoing
    /// what already happened.
    pub async fn apply_layout(&self, layout: LayoutType) -> Result<(), TerminalError> {
        let _guard = self.layout_lock.lock().await;
        let result = self.apply_layout_locked(layout).await;
        match &result {
            Ok(()) => self.audit.record(
                AuditEvent::success(AuditAction::LayoutChange)
                    .detail("layout_type", layout.as_str())
                    .detail("terminal_count", layout.terminal_count()),
            ),
            Err(e) => self.audit.record(
                AuditEvent::failure(AuditAction::LayoutChange, e)
                    .detail("layout_type", layout.as_str()),
            ),
        }
        result
    }

    async fn apply_layout_locked(&self, layout: LayoutType) -> Result<(), TerminalError> {
        let target = layout.terminal_count();
        let current = self.terminal_count().await;
        info!(
            "Applying layout {} ({} -> {} terminals)",
            layout, current, target
        );

        if target > current {
            let shell = self.options.default_shell.clone();
            for i in current..target {
                self.spawn_terminal(&format!("Terminal {}", i + 1), &shell, None)
                    .await?;
            }
        } else if target < current {
            let excess: Vec<TerminalId> = {
                let state = self.state.read().await;
                let mut ids: Vec<TerminalId> = state.terminals.keys().copied().collect();
                ids.sort_unstable_by(|a, b| b.cmp(a));
                ids.truncate(current - target);
                ids
            };
            for id in excess {
                match self.kill_terminal(id).await {
                    Ok(()) | Err(TerminalError::TerminalNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if let Err(e) = self.store.set_layout(layout, target).await {
            warn!("Failed to persist layout {}: {:#}", layout, e);
        }
        Ok(())
    }

    /// Kill every live terminal. All kills are attempted; the live set is empty
    /// afterwards even when some backends did not stop cleanly.
    pub async fn shutdown(&self) -> Result<(), TerminalError> {
        let ids = self.terminal_ids().await;
        info!("Shutting down {} terminal(s)", ids.len());

        let mut failed = 0;
        for id in ids {
            match self.kill_inner(id).await {
                Ok(outcome) => {
                    self.audit.record(
                        AuditEvent::success(AuditAction::TerminalKill)
                            .target(id)
                            .detail("clean", outcome.clean),
                    );
                    if !outcome.clean {
                        failed += 1;
                    }
                }
                Err(TerminalError::TerminalNotFound(_)) => {}
                Err(e) => {
                    warn!("Error killing terminal {}: {}", id, e);
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(TerminalError::ShutdownIncomplete { failed });
        }
        Ok(())
    }

    /// Cancel every backend at once without waiting. Watchers clean up the map
    /// as backends finish.
    pub fn cancel_all(&self) {
        info!("Cancelling all terminal backends");
        self.root.cancel();
    }

    /// Live terminals ordered by id.
    pub async fn terminals(&self) -> Vec<Terminal> {
        let state = self.state.read().await;
        let mut terminals: Vec<Terminal> = state.terminals.values().cloned().collect();
        terminals.sort_by_key(|t| t.id);
        terminals
    }

    pub async fn terminal(&self, id: TerminalId) -> Option<Terminal> {
        self.state.read().await.terminals.get(&id).cloned()
    }

    pub async fn terminal_by_port(&self, port: u16) -> Option<Terminal> {
        self.state
            .read()
            .await
            .terminals
            .values()
            .find(|t| t.port == port)
            .cloned()
    }

    pub async fn terminal_count(&self) -> usize {
        self.state.read().await.terminals.len()
    }

    pub(crate) async fn terminal_ids(&self) -> Vec<TerminalId> {
        let state = self.state.read().await;
        let mut ids: Vec<TerminalId> = state.terminals.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn active_tab_id(&self) -> TerminalId {
        self.state.read().await.active_tab
    }

    /// Not checked against the live set.
    pub async fn set_active_tab_id(&self, id: TerminalId) {
        self.state.write().await.active_tab = id;
    }

    /// Id the next spawned terminal will get.
    pub async fn next_id(&self) -> TerminalId {
        TerminalId(self.state.read().await.next_id)
    }
}

/// Highest remaining id, or none.
fn next_active(terminals: &HashMap<TerminalId, Terminal>) -> TerminalId {
    terminals.keys().max().copied().unwrap_or(TerminalId::NONE)
}
