//! Session + Session Manager: a session pairs one dump file with one live
//! debugger child process and its command queue. The manager owns the
//! session table and enforces the capacity cap and idle sweep.

use crate::config::Config;
use crate::error::DbgError;
use crate::record::CommandStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A crashed or desynchronized debugger process is fatal to a session (no
/// automatic respawn -- see the executor's `fault_session`), so there is no
/// transient "recovering" state: a session only ever moves forward through
/// `Active -> {Faulted | Closing -> Closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Faulted,
    Closing,
    Closed,
}

impl SessionStatus {
    const fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Active => 0,
            SessionStatus::Faulted => 1,
            SessionStatus::Closing => 2,
            SessionStatus::Closed => 3,
        }
    }
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Active,
            1 => SessionStatus::Faulted,
            2 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Faulted => "faulted",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Generates session ids of the form `sess-YYYY-MM-DD-HH-mm-ss-fffffff`,
/// with a monotonic per-second tick so ids sort lexicographically in
/// creation order even when several sessions open within the same second.
pub struct SessionIdGenerator {
    last: StdMutex<(i64, u64)>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            last: StdMutex::new((0, 0)),
        }
    }

    pub fn next(&self) -> String {
        let now = Utc::now();
        let epoch_secs = now.timestamp();
        let mut guard = self.last.lock().expect("session id mutex poisoned");
        let tick = if guard.0 == epoch_secs {
            guard.1 += 1;
            guard.1
        } else {
            *guard = (epoch_secs, 0);
            0
        };
        format!("sess-{}-{:07}", now.format("%Y-%m-%d-%H-%M-%S"), tick)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// One open analysis session: a dump, an attached debugger, and the
/// commands queued or executed against it.
pub struct Session {
    pub id: String,
    pub dump_path: String,
    pub symbol_path: Option<String>,
    pub created_at: Instant,
    status: AtomicU8,
    last_activity: StdMutex<Instant>,
    pub store: CommandStore,
}

impl Session {
    pub fn new(id: String, dump_path: String, symbol_path: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            dump_path,
            symbol_path,
            created_at: now,
            status: AtomicU8::new(SessionStatus::Active.as_u8()),
            last_activity: StdMutex::new(now),
            store: CommandStore::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("last_activity poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity poisoned")
            .elapsed()
    }
}

/// Owns the session table. Reads (a lookup on every tool call) vastly
/// outnumber writes (open/close), so the table is an `RwLock` rather than
/// the plain mutex a ten-session cap could get away with -- this system's
/// cap is two orders of magnitude larger.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    id_gen: SessionIdGenerator,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            id_gen: SessionIdGenerator::new(),
            config,
        }
    }

    /// Allocate a session id and insert a new `Active` session, refusing
    /// outright (rather than queuing) once `max_concurrent_sessions` is
    /// reached.
    pub async fn create(
        &self,
        dump_path: String,
        symbol_path: Option<String>,
    ) -> Result<Arc<Session>, DbgError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.config.session.max_concurrent_sessions {
            return Err(DbgError::CapacityExceeded(format!(
                "max_concurrent_sessions ({}) reached",
                self.config.session.max_concurrent_sessions
            )));
        }
        let id = self.id_gen.next();
        let session = Arc::new(Session::new(id.clone(), dump_path, symbol_path));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Require the session to exist and be `Active`, for tool calls that
    /// must not operate on a closing/faulted/closed session. A crashed
    /// debugger process is fatal to the session: it goes straight to
    /// `Faulted` with no transient recovering state to admit commands into.
    pub async fn get_active(&self, id: &str) -> Result<Arc<Session>, DbgError> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| DbgError::NotFound(format!("no such session: {id}")))?;
        match session.status() {
            SessionStatus::Active => Ok(session),
            other => Err(DbgError::PreconditionFailed(format!(
                "session {id} is {}",
                other.as_str()
            ))),
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Close and remove every session idle for at least `session_idle_timeout`.
    /// Returns the removed ids.
    pub async fn sweep_idle(&self) -> Vec<String> {
        let idle_timeout = self.config.session.session_idle_timeout();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for() >= idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(session) = sessions.get(id) {
                session.set_status(SessionStatus::Closed);
            }
            sessions.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Config> {
        let mut cfg = Config::default();
        cfg.session.max_concurrent_sessions = 2;
        cfg.session.session_idle_timeout_secs = 0;
        Arc::new(cfg)
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();
        let found = manager.get(&session.id).await.unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn capacity_cap_refuses_rather_than_queues() {
        let manager = SessionManager::new(test_config());
        manager.create("/tmp/a.dmp".into(), None).await.unwrap();
        manager.create("/tmp/b.dmp".into(), None).await.unwrap();
        let result = manager.create("/tmp/c.dmp".into(), None).await;
        assert!(matches!(result, Err(DbgError::CapacityExceeded(_))));
    }

    #[tokio::test]
    async fn get_active_rejects_closing_sessions() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();
        session.set_status(SessionStatus::Closing);
        let result = manager.get_active(&session.id).await;
        assert!(matches!(result, Err(DbgError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn get_active_missing_session_is_not_found() {
        let manager = SessionManager::new(test_config());
        let result = manager.get_active("sess-does-not-exist").await;
        assert!(matches!(result, Err(DbgError::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_idle_removes_expired_sessions() {
        let manager = SessionManager::new(test_config());
        let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = manager.sweep_idle().await;
        assert_eq!(removed, vec![session.id.clone()]);
        assert!(manager.get(&session.id).await.is_none());
    }

    #[test]
    fn session_ids_are_lexicographically_monotonic() {
        let gen = SessionIdGenerator::new();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(gen.next());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
