//! Fakes shared by the manager, restore and workspace tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audit::MemoryAudit;
use crate::backend::{BackendError, BackendHandle, StartRequest, TerminalBackend};
use crate::credential::{Credential, CredentialError, CredentialSource};
use crate::layout::LayoutType;
use crate::manager::{ManagerOptions, TerminalManager};
use crate::store::{
    MemoryStore, SessionStore, StorageId, StoredLayout, StoredSession, Workspace,
    WorkspaceSummary, WorkspaceTerminal,
};

struct FakeServer {
    request: StartRequest,
    crash: CancellationToken,
    hang: Arc<AtomicBool>,
}

/// Backend that serves nothing. Each "server" is a task that finishes when
/// cancelled (unless told to hang) or when crashed.
#[derive(Default)]
pub(crate) struct FakeBackend {
    started: AtomicUsize,
    fail_next: AtomicBool,
    servers: Mutex<HashMap<u16, FakeServer>>,
}

impl FakeBackend {
    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_for(&self, port: u16) -> Option<StartRequest> {
        self.servers
            .lock()
            .unwrap()
            .get(&port)
            .map(|s| s.request.clone())
    }

    /// Make the backend on `port` exit on its own.
    pub(crate) fn crash(&self, port: u16) {
        if let Some(server) = self.servers.lock().unwrap().get(&port) {
            server.crash.cancel();
        }
    }

    /// Make the backend on `port` ignore cancellation.
    pub(crate) fn hang_on_stop(&self, port: u16) {
        if let Some(server) = self.servers.lock().unwrap().get(&port) {
            server.hang.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TerminalBackend for FakeBackend {
    async fn start(
        &self,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<BackendHandle, BackendError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::Start(format!(
                "bind 127.0.0.1:{}: address already in use",
                request.port
            )));
        }
        self.started.fetch_add(1, Ordering::SeqCst);

        let finished = CancellationToken::new();
        let crash = CancellationToken::new();
        let hang = Arc::new(AtomicBool::new(false));

        let (task_cancel, task_crash, task_hang, task_finished) =
            (cancel.clone(), crash.clone(), hang.clone(), finished.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    if task_hang.load(Ordering::SeqCst) {
                        return;
                    }
                }
                _ = task_crash.cancelled() => {}
            }
            task_finished.cancel();
        });

        self.servers.lock().unwrap().insert(
            request.port,
            FakeServer {
                request,
                crash,
                hang,
            },
        );
        Ok(BackendHandle::new(cancel, finished))
    }
}

pub(crate) struct FailingCredentials;

impl CredentialSource for FailingCredentials {
    fn generate(&self) -> Result<Credential, CredentialError> {
        Err(CredentialError::RandomSource("entropy source closed".to_string()))
    }
}

/// Every call fails.
pub(crate) struct FailingStore;

#[async_trait]
impl SessionStore for FailingStore {
    async fn save_session(&self, _port: u16, _title: &str) -> Result<StorageId> {
        Err(anyhow!("store unavailable"))
    }

    async fn update_session_title(&self, _id: StorageId, _title: &str) -> Result<()> {
        Err(anyhow!("store unavailable"))
    }

    async fn delete_session(&self, _id: StorageId) -> Result<()> {
        Err(anyhow!("store unavailable"))
    }

    async fn clear_sessions(&self) -> Result<()> {
        Err(anyhow!("store unavailable"))
    }

    async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        Err(anyhow!("store unavailable"))
    }

    async fn get_layout(&self) -> Result<StoredLayout> {
        Err(anyhow!("store unavailable"))
    }

    async fn set_layout(&self, _layout: LayoutType, _terminal_count: usize) -> Result<()> {
        Err(anyhow!("store unavailable"))
    }

    async fn save_workspace(
        &self,
        _name: &str,
        _description: &str,
        _layout_type: Option<&str>,
        _terminals: &[WorkspaceTerminal],
    ) -> Result<i64> {
        Err(anyhow!("store unavailable"))
    }

    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSummary>> {
        Err(anyhow!("store unavailable"))
    }

    async fn load_workspace(&self, _id: i64) -> Result<Option<Workspace>> {
        Err(anyhow!("store unavailable"))
    }
}

/// A manager wired to fakes, plus handles on those fakes.
pub(crate) struct TestRig {
    pub(crate) manager: Arc<TerminalManager>,
    pub(crate) backend: Arc<FakeBackend>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) audit: Arc<MemoryAudit>,
}

impl TestRig {
    pub(crate) fn new(max_terminals: usize) -> Self {
        Self::build(
            ManagerOptions {
                max_terminals,
                ..Default::default()
            },
            None,
            None,
            Arc::new(MemoryStore::new()),
        )
    }

    pub(crate) fn with_options(options: ManagerOptions) -> Self {
        Self::build(options, None, None, Arc::new(MemoryStore::new()))
    }

    pub(crate) fn with_credentials(
        max_terminals: usize,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self::build(
            ManagerOptions {
                max_terminals,
                ..Default::default()
            },
            Some(credentials),
            None,
            Arc::new(MemoryStore::new()),
        )
    }

    /// `store` replaces the memory store inside the manager; `self.store` is
    /// then unused.
    pub(crate) fn with_store(max_terminals: usize, store: Arc<dyn SessionStore>) -> Self {
        Self::build(
            ManagerOptions {
                max_terminals,
                ..Default::default()
            },
            None,
            Some(store),
            Arc::new(MemoryStore::new()),
        )
    }

    /// A fresh manager over an existing memory store, as after a restart.
    pub(crate) fn restarted(store: Arc<MemoryStore>) -> Self {
        Self::build(ManagerOptions::default(), None, None, store)
    }

    fn build(
        options: ManagerOptions,
        credentials: Option<Arc<dyn CredentialSource>>,
        store_override: Option<Arc<dyn SessionStore>>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let backend = Arc::new(FakeBackend::default());
        let audit = Arc::new(MemoryAudit::new());
        let manager_store: Arc<dyn SessionStore> = match store_override {
            Some(s) => s,
            None => store.clone(),
        };

        let mut builder = TerminalManager::builder(backend.clone(), manager_store)
            .audit(audit.clone())
            .options(options);
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        Self {
            manager: builder.build(),
            backend,
            store,
            audit,
        }
    }

    /// Poll until `count` crash watchers are left.
    pub(crate) async fn wait_until_watchers(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.manager.watcher_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watchers did not settle");
    }

    /// Poll until the live count settles at `count`.
    pub(crate) async fn wait_until_count(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.manager.terminal_count().await != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("terminal count did not settle");
    }
}
