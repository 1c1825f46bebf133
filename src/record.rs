//! Command Record Store: tracks every enqueued command from submission
//! through a terminal state, using compare-and-swap transitions so a
//! concurrent cancel and a concurrent completion can never both "win".
//!
//! The store itself is a `RwLock<HashMap>` (readers -- `status`, `result`,
//! `status_bulk` -- vastly outnumber writers) plus a `Mutex<VecDeque>` FIFO
//! of queued ids that the executor drains in submission order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl CommandState {
    const fn as_u8(self) -> u8 {
        match self {
            CommandState::Queued => 0,
            CommandState::Executing => 1,
            CommandState::Completed => 2,
            CommandState::Failed => 3,
            CommandState::Cancelled => 4,
            CommandState::TimedOut => 5,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => CommandState::Queued,
            1 => CommandState::Executing,
            2 => CommandState::Completed,
            3 => CommandState::Failed,
            4 => CommandState::Cancelled,
            _ => CommandState::TimedOut,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Failed
                | CommandState::Cancelled
                | CommandState::TimedOut
        )
    }
}

/// Output captured once a command reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub output: Vec<String>,
    pub exit_detail: Option<String>,
}

/// One command's full lifecycle record. The `state` field is the single
/// source of truth for concurrency control; everything else is guarded by
/// an ordinary mutex since it only changes alongside a state transition.
pub struct CommandRecord {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub timeout: Duration,
    pub queued_at: Instant,
    state: AtomicU8,
    inner: Mutex<CommandOutcome>,
    pub started_at: Mutex<Option<Instant>>,
    pub finished_at: Mutex<Option<Instant>>,
    cancel: Arc<Notify>,
}

impl CommandRecord {
    pub fn new(id: String, session_id: String, command: String, timeout: Duration) -> Self {
        Self {
            id,
            session_id,
            command,
            timeout,
            queued_at: Instant::now(),
            state: AtomicU8::new(CommandState::Queued.as_u8()),
            inner: Mutex::new(CommandOutcome::default()),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            cancel: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> CommandState {
        CommandState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cancel_handle(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    /// Queued -> Executing. Fails (returns `false`) if a concurrent cancel
    /// already won the race.
    pub async fn mark_executing(&self) -> bool {
        let won = self
            .state
            .compare_exchange(
                CommandState::Queued.as_u8(),
                CommandState::Executing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            *self.started_at.lock().await = Some(Instant::now());
        }
        won
    }

    async fn finish(&self, from: CommandState, to: CommandState, outcome: CommandOutcome) -> bool {
        let won = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            *self.inner.lock().await = outcome;
            *self.finished_at.lock().await = Some(Instant::now());
        }
        won
    }

    pub async fn complete(&self, output: Vec<String>) -> bool {
        self.finish(
            CommandState::Executing,
            CommandState::Completed,
            CommandOutcome {
                output,
                exit_detail: None,
            },
        )
        .await
    }

    pub async fn fail(&self, output: Vec<String>, detail: String) -> bool {
        self.finish(
            CommandState::Executing,
            CommandState::Failed,
            CommandOutcome {
                output,
                exit_detail: Some(detail),
            },
        )
        .await
    }

    pub async fn timed_out(&self, output: Vec<String>) -> bool {
        self.finish(
            CommandState::Executing,
            CommandState::TimedOut,
            CommandOutcome {
                output,
                exit_detail: Some("deadline exceeded".into()),
            },
        )
        .await
    }

    /// Fail a record that is still `Queued` or `Executing`, used when the
    /// owning session faults (the debugger process died or an unresponsive
    /// debugger could not be drained) and no more commands will ever run
    /// against it. Loses the race silently, same as `cancel`, if the
    /// record already reached a terminal state.
    pub async fn fail_any(&self, detail: String) -> bool {
        let won_queued = self
            .state
            .compare_exchange(
                CommandState::Queued.as_u8(),
                CommandState::Failed.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        let won = won_queued
            || self
                .state
                .compare_exchange(
                    CommandState::Executing.as_u8(),
                    CommandState::Failed.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if won {
            *self.inner.lock().await = CommandOutcome {
                output: Vec::new(),
                exit_detail: Some(detail),
            };
            *self.finished_at.lock().await = Some(Instant::now());
        }
        won
    }

    /// Cancel from either `Queued` or `Executing`. Whichever of cancel and
    /// complete/fail/timeout reaches the CAS first wins; the loser's
    /// transition silently fails and the caller treats the record's final
    /// state as authoritative.
    pub async fn cancel(&self) -> bool {
        let won_queued = self
            .state
            .compare_exchange(
                CommandState::Queued.as_u8(),
                CommandState::Cancelled.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        let won = won_queued
            || self
                .state
                .compare_exchange(
                    CommandState::Executing.as_u8(),
                    CommandState::Cancelled.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if won {
            *self.finished_at.lock().await = Some(Instant::now());
            self.cancel.notify_waiters();
        }
        won
    }

    pub async fn outcome(&self) -> CommandOutcome {
        self.inner.lock().await.clone()
    }
}

/// All live and recently-terminal command records, plus the FIFO queue of
/// ids waiting to execute.
pub struct CommandStore {
    records: RwLock<HashMap<String, Arc<CommandRecord>>>,
    queue: Mutex<VecDeque<String>>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn enqueue(&self, record: Arc<CommandRecord>) {
        let id = record.id.clone();
        self.records.write().await.insert(id.clone(), record);
        self.queue.lock().await.push_back(id);
    }

    pub async fn dequeue(&self) -> Option<Arc<CommandRecord>> {
        loop {
            let id = self.queue.lock().await.pop_front()?;
            if let Some(record) = self.records.read().await.get(&id).cloned() {
                return Some(record);
            }
        }
    }

    /// Peek the next batchable run of queued ids without removing them,
    /// for the executor's batching decision. Caller still dequeues one at a
    /// time once it decides how many to take.
    pub async fn peek_queue(&self) -> Vec<String> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub async fn pop_front_n(&self, n: usize) -> Vec<Arc<CommandRecord>> {
        let mut queue = self.queue.lock().await;
        let records = self.records.read().await;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match queue.pop_front() {
                Some(id) => {
                    if let Some(r) = records.get(&id) {
                        out.push(r.clone());
                    }
                }
                None => break,
            }
        }
        out
    }

    pub async fn get(&self, id: &str) -> Option<Arc<CommandRecord>> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn get_many(&self, ids: &[String]) -> Vec<Option<Arc<CommandRecord>>> {
        let records = self.records.read().await;
        ids.iter().map(|id| records.get(id).cloned()).collect()
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Snapshot of every tracked record, for tallying per-state counts.
    pub async fn all(&self) -> Vec<Arc<CommandRecord>> {
        self.records.read().await.values().cloned().collect()
    }

    /// Drop terminal records whose `finished_at` is older than `retention`.
    /// Returns the number of records removed.
    pub async fn sweep_retention(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let mut stale = Vec::new();
        for (id, record) in records.iter() {
            if record.state().is_terminal() {
                if let Some(finished) = *record.finished_at.lock().await {
                    if now.duration_since(finished) > retention {
                        stale.push(id.clone());
                    }
                }
            }
        }
        for id in &stale {
            records.remove(id);
        }
        stale.len()
    }

    /// Fail every queued-but-not-yet-dequeued record belonging to
    /// `session_id` with `detail`. Used when the session faults: a dead or
    /// unrecoverable debugger process will never run them.
    pub async fn fail_session_queue(&self, session_id: &str, detail: &str) -> usize {
        let records = self.records.read().await;
        let mut failed = 0;
        let ids: Vec<String> = self.queue.lock().await.iter().cloned().collect();
        for id in ids {
            if let Some(record) = records.get(&id) {
                if record.session_id == session_id && record.fail_any(detail.to_string()).await {
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Remove all queued-but-not-yet-dequeued records belonging to `session_id`,
    /// cancelling each one. Used when a session is closed with work still
    /// pending.
    pub async fn cancel_session_queue(&self, session_id: &str) -> usize {
        let records = self.records.read().await;
        let mut cancelled = 0;
        let ids: Vec<String> = self.queue.lock().await.iter().cloned().collect();
        for id in ids {
            if let Some(record) = records.get(&id) {
                if record.session_id == session_id && record.cancel().await {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }
}

impl Default for CommandStore {
    fn default() -> Self {
        Self::new()
    }
}
