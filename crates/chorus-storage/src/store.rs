use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::{Result, StorageError};
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::types::*;

/// How often the reconnector retries opening the primary backend while the
/// in-memory fallback is serving.
const RECONNECT_INTERVAL_SECS: u64 = 30;

/// Synchronous storage contract shared by the SQLite backend and the
/// in-memory fallback. Exactly one backend is configured at a time.
pub trait DialogueStore: Send + Sync {
    fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
        metadata: SessionMetadata,
        client_nonce: Option<&str>,
    ) -> Result<Session>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn update_session(&self, id: &str, patch: &SessionPatch) -> Result<Option<Session>>;
    fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>>;

    fn create_turn(
        &self,
        session_id: &str,
        role: chorus_core::Role,
        content: &str,
        metadata: TurnMetadata,
    ) -> Result<Turn>;
    fn get_turn(&self, id: &str) -> Result<Option<Turn>>;
    fn update_turn(&self, id: &str, patch: &TurnPatch) -> Result<Option<Turn>>;
    /// Newest-first turn listing with cursor semantics: `before_id` itself is
    /// excluded; an unknown `before_id` yields an empty list, not an error.
    fn list_turns(
        &self,
        session_id: &str,
        filter: &TurnFilter,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<Turn>>;

    fn record_expression(&self, record: &ExpressionRecord) -> Result<()>;
    fn list_expressions(&self, user_id: &str, limit: usize) -> Result<Vec<ExpressionRecord>>;

    fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
    fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()>;
    /// Increment and return the user's interaction counter. Creates the
    /// profile row on first touch. Monotonically non-decreasing.
    fn bump_interaction_count(&self, user_id: &str) -> Result<u64>;

    fn health(&self) -> StoreHealth;
}

/// Shared storage handle.
///
/// The trait surface is synchronous (the backends are rusqlite or plain
/// maps); this handle is the async face of it. Every async method clones
/// the backend `Arc` and runs the call on the blocking pool, so storage
/// work never occupies a reactor thread and the sync entry points stay
/// deadlock-free when reached from async code.
pub struct Storage {
    backend: RwLock<Arc<dyn DialogueStore>>,
    degraded: AtomicBool,
    db_path: Option<String>,
}

impl Storage {
    /// Open the configured SQLite backend, degrading to the in-memory
    /// fallback if the database cannot be opened. The degradation is
    /// logged and a reconnect loop (see [`Storage::run_reconnector`])
    /// keeps trying the primary.
    pub fn open(db_path: &str) -> Arc<Self> {
        match SqliteStore::open(db_path) {
            Ok(store) => Arc::new(Self {
                backend: RwLock::new(Arc::new(store)),
                degraded: AtomicBool::new(false),
                db_path: Some(db_path.to_string()),
            }),
            Err(e) => {
                error!(error = %e, path = db_path, "primary store unreachable, degrading to in-memory fallback");
                Arc::new(Self {
                    backend: RwLock::new(Arc::new(MemoryStore::degraded())),
                    degraded: AtomicBool::new(true),
                    db_path: Some(db_path.to_string()),
                })
            }
        }
    }

    /// Purely in-memory storage (tests and ephemeral deployments).
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            backend: RwLock::new(Arc::new(MemoryStore::new())),
            degraded: AtomicBool::new(false),
            db_path: None,
        })
    }

    /// Wrap an already-constructed backend (tests).
    pub fn with_backend(backend: Arc<dyn DialogueStore>) -> Arc<Self> {
        Arc::new(Self {
            backend: RwLock::new(backend),
            degraded: AtomicBool::new(false),
            db_path: None,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Direct synchronous access to the current backend.
    pub fn blocking(&self) -> Arc<dyn DialogueStore> {
        self.backend.read().unwrap().clone()
    }

    /// Retry the primary backend while degraded; swap it back in on
    /// success. Runs until the shutdown signal flips.
    pub async fn run_reconnector(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(path) = self.db_path.clone() else {
            return;
        };
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(RECONNECT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.is_degraded() {
                        continue;
                    }
                    match SqliteStore::open(&path) {
                        Ok(store) => {
                            *self.backend.write().unwrap() = Arc::new(store);
                            self.degraded.store(false, Ordering::Relaxed);
                            info!(path = %path, "primary store reconnected, leaving degraded mode");
                        }
                        Err(e) => {
                            warn!(error = %e, "primary store still unreachable");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn DialogueStore>) -> Result<T> + Send + 'static,
    {
        let backend = self.blocking();
        tokio::task::spawn_blocking(move || op(backend))
            .await
            .map_err(|e| StorageError::Internal(format!("storage task join error: {e}")))?
    }

    // ── async variants — identical semantics to the sync trait ────────────

    pub async fn create_session(
        &self,
        user_id: &str,
        title: Option<&str>,
        metadata: SessionMetadata,
        client_nonce: Option<&str>,
    ) -> Result<Session> {
        let (user_id, title, nonce) = (
            user_id.to_string(),
            title.map(str::to_string),
            client_nonce.map(str::to_string),
        );
        self.run_blocking(move |s| {
            s.create_session(&user_id, title.as_deref(), metadata, nonce.as_deref())
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.run_blocking(move |s| s.get_session(&id)).await
    }

    pub async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Option<Session>> {
        let id = id.to_string();
        self.run_blocking(move |s| s.update_session(&id, &patch))
            .await
    }

    pub async fn list_sessions(
        &self,
        filter: SessionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        self.run_blocking(move |s| s.list_sessions(&filter, limit, offset))
            .await
    }

    pub async fn create_turn(
        &self,
        session_id: &str,
        role: chorus_core::Role,
        content: &str,
        metadata: TurnMetadata,
    ) -> Result<Turn> {
        let (session_id, content) = (session_id.to_string(), content.to_string());
        self.run_blocking(move |s| s.create_turn(&session_id, role, &content, metadata))
            .await
    }

    pub async fn get_turn(&self, id: &str) -> Result<Option<Turn>> {
        let id = id.to_string();
        self.run_blocking(move |s| s.get_turn(&id)).await
    }

    pub async fn update_turn(&self, id: &str, patch: TurnPatch) -> Result<Option<Turn>> {
        let id = id.to_string();
        self.run_blocking(move |s| s.update_turn(&id, &patch)).await
    }

    pub async fn list_turns(
        &self,
        session_id: &str,
        filter: TurnFilter,
        limit: usize,
        before_id: Option<&str>,
    ) -> Result<Vec<Turn>> {
        let (session_id, before) = (session_id.to_string(), before_id.map(str::to_string));
        self.run_blocking(move |s| s.list_turns(&session_id, &filter, limit, before.as_deref()))
            .await
    }

    pub async fn record_expression(&self, record: ExpressionRecord) -> Result<()> {
        self.run_blocking(move |s| s.record_expression(&record))
            .await
    }

    pub async fn list_expressions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ExpressionRecord>> {
        let user_id = user_id.to_string();
        self.run_blocking(move |s| s.list_expressions(&user_id, limit))
            .await
    }

    pub async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let user_id = user_id.to_string();
        self.run_blocking(move |s| s.get_user_profile(&user_id))
            .await
    }

    pub async fn upsert_user_profile(&self, profile: UserProfile) -> Result<()> {
        self.run_blocking(move |s| s.upsert_user_profile(&profile))
            .await
    }

    pub async fn bump_interaction_count(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_string();
        self.run_blocking(move |s| s.bump_interaction_count(&user_id))
            .await
    }

    pub async fn health(&self) -> StoreHealth {
        let backend = self.blocking();
        let degraded = self.is_degraded();
        tokio::task::spawn_blocking(move || backend.health())
            .await
            .map(|mut h| {
                if degraded {
                    h.status = HealthStatus::Degraded;
                }
                h
            })
            .unwrap_or(StoreHealth {
                status: HealthStatus::Degraded,
                detail: "health probe task failed".to_string(),
            })
    }
}
