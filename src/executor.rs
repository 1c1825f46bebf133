//! Per-Session Executor: the single writer for one session's debugger
//! process. Drains the session's command queue in FIFO order, opportunistically
//! batching consecutive batch-safe commands into one debugger round trip,
//! emits heartbeats while a command runs long, and faults the session --
//! permanently, with no respawn -- if the debugger process dies or can't be
//! resynchronized after a timeout.

use crate::adapter::DebuggerAdapter;
use crate::config::Config;
use crate::framer::{self, FrameOutcome};
use crate::notify::{Notification, NotificationFabric};
use crate::record::{CommandRecord, CommandState, CommandStore};
use crate::session::{Session, SessionStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BATCH_SIZE: usize = 8;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives one session's debugger process for its entire lifetime.
pub struct SessionExecutor {
    session: Arc<Session>,
    adapter: Mutex<DebuggerAdapter>,
    config: Arc<Config>,
    notify: Arc<NotificationFabric>,
}

impl SessionExecutor {
    pub fn new(
        session: Arc<Session>,
        adapter: DebuggerAdapter,
        config: Arc<Config>,
        notify: Arc<NotificationFabric>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            adapter: Mutex::new(adapter),
            config,
            notify,
        })
    }

    /// Run until the session is closed. Intended to be spawned as a
    /// dedicated background task per session.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.session.status() == SessionStatus::Closed {
                return;
            }
            match self.next_batch().await {
                Some(batch) => self.execute_batch(batch).await,
                None => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
            }
        }
    }

    /// Pull the next run of queued commands this executor will dispatch as
    /// one debugger round trip: a single unsafe command, or a prefix of
    /// consecutive batch-safe commands up to `MAX_BATCH_SIZE`.
    async fn next_batch(&self) -> Option<Vec<Arc<CommandRecord>>> {
        let store: &CommandStore = &self.session.store;
        let queued_ids = store.peek_queue().await;
        if queued_ids.is_empty() {
            return None;
        }

        if !self.config.batching.enabled {
            return Some(store.pop_front_n(1).await);
        }

        let records = store.get_many(&queued_ids).await;
        let mut take = 0;
        for record in records.iter().take(MAX_BATCH_SIZE) {
            match record {
                Some(r) if self.config.batching.is_safe(&r.command) => take += 1,
                _ => break,
            }
        }
        let take = take.max(1);
        let batch = store.pop_front_n(take).await;
        if batch.is_empty() { None } else { Some(batch) }
    }

    async fn execute_batch(&self, batch: Vec<Arc<CommandRecord>>) {
        let mut live = Vec::with_capacity(batch.len());
        for record in &batch {
            if record.mark_executing().await {
                self.publish_status(record, "executing").await;
                live.push(record.clone());
            }
        }
        if live.is_empty() {
            return;
        }

        let block_id = Uuid::new_v4().to_string();
        let ids: Vec<String> = live.iter().map(|r| r.id.clone()).collect();

        {
            let adapter = self.adapter.lock().await;
            if let Err(e) = self.dispatch(&adapter, &block_id, &live).await {
                self.finish_all_as_failed(&live, e).await;
                self.fault_session("session faulted").await;
                return;
            }
        }

        let deadline = Instant::now() + self.longest_timeout(&live);
        let outcome = self.read_with_heartbeats(&block_id, &ids, deadline).await;
        self.apply_outcome(&block_id, &live, &ids, outcome).await;
    }

    async fn dispatch(
        &self,
        adapter: &DebuggerAdapter,
        block_id: &str,
        live: &[Arc<CommandRecord>],
    ) -> Result<(), String> {
        adapter
            .write_line(&framer::echo_line(&framer::begin_sentinel(block_id)))
            .await
            .map_err(|e| e.to_string())?;
        for (idx, record) in live.iter().enumerate() {
            if idx > 0 {
                adapter
                    .write_line(&framer::echo_line(&framer::item_sentinel(&record.id)))
                    .await
                    .map_err(|e| e.to_string())?;
            }
            adapter
                .write_line(&record.command)
                .await
                .map_err(|e| e.to_string())?;
        }
        adapter
            .write_line(&framer::echo_line(&framer::end_sentinel(block_id)))
            .await
            .map_err(|e| e.to_string())
    }

    /// The deadline for one dispatched round trip: the longest per-command
    /// timeout among the live records. A batch of more than one command is
    /// by construction drawn entirely from the batch-safe allow-list (quick,
    /// read-only commands), so its combined read is additionally capped at
    /// `output_reading_timeout` rather than letting one generously-timed
    /// record's deadline hold up the others' read.
    fn longest_timeout(&self, live: &[Arc<CommandRecord>]) -> Duration {
        let longest = live
            .iter()
            .map(|r| r.timeout)
            .max()
            .unwrap_or_else(|| self.config.command.default_timeout());
        if live.len() > 1 {
            longest.min(self.config.command.output_reading_timeout())
        } else {
            longest
        }
    }

    /// Read the framed block, periodically emitting heartbeats to
    /// subscribers for each live command while the read is still pending.
    async fn read_with_heartbeats(
        &self,
        block_id: &str,
        ids: &[String],
        deadline: Instant,
    ) -> FrameOutcome {
        let start = Instant::now();
        let adapter = self.adapter.lock().await;
        let heartbeat_ids = ids.to_vec();
        let session_id = self.session.id.clone();
        let notify = self.notify.clone();

        // `on_heartbeat` can't be async, so each tick hands off to a
        // detached task rather than block the read loop on publishing.
        framer::read_block_with_heartbeat(&adapter, block_id, deadline, HEARTBEAT_INTERVAL, || {
            let ids = heartbeat_ids.clone();
            let session_id = session_id.clone();
            let notify = notify.clone();
            let elapsed_ms = start.elapsed().as_millis() as u64;
            tokio::spawn(async move {
                for id in ids {
                    notify
                        .publish(Notification::CommandHeartbeat {
                            session_id: session_id.clone(),
                            command_id: id,
                            elapsed_ms,
                        })
                        .await;
                }
            });
        })
        .await
    }

    async fn apply_outcome(
        &self,
        block_id: &str,
        live: &[Arc<CommandRecord>],
        ids: &[String],
        outcome: FrameOutcome,
    ) {
        match outcome {
            FrameOutcome::Complete { body } => {
                let parts = framer::split_inner(&body, ids);
                for (record, output) in live.iter().zip(parts.into_iter()) {
                    record.complete(output).await;
                    self.publish_status(record, "completed").await;
                }
            }
            FrameOutcome::Timeout { body } => {
                self.handle_timeout(block_id, live, ids, body).await;
            }
            FrameOutcome::ProcessDead { body } => {
                let parts = framer::split_inner(&body, ids);
                for (record, output) in live.iter().zip(parts.into_iter()) {
                    record.fail(output, "debugger process exited".into()).await;
                    self.publish_status(record, "failed").await;
                }
                self.fault_session("session faulted").await;
            }
        }
    }

    /// A command ran past its deadline. Send a break, then attempt a bounded
    /// drain for the end sentinel within `debugger.prompt_delay` before
    /// giving up on resynchronizing with the debugger's output stream. If
    /// the drain finds the sentinel, the debugger is still alive and in
    /// sync -- the affected commands are `TimedOut` but the session stays
    /// `Active`. If it doesn't (a second timeout, or the process exits
    /// mid-drain), the output stream can no longer be trusted to line up
    /// with future commands, so the session is faulted.
    async fn handle_timeout(
        &self,
        block_id: &str,
        live: &[Arc<CommandRecord>],
        ids: &[String],
        body: Vec<String>,
    ) {
        self.adapter.lock().await.interrupt().await;

        let grace_deadline = Instant::now() + self.config.debugger.prompt_delay();
        let drained = {
            let adapter = self.adapter.lock().await;
            framer::drain_block(&adapter, block_id, grace_deadline, body).await
        };

        match drained {
            FrameOutcome::Complete { body } => {
                let parts = framer::split_inner(&body, ids);
                for (record, output) in live.iter().zip(parts.into_iter()) {
                    record.timed_out(output).await;
                    self.publish_status(record, "timed_out").await;
                }
            }
            FrameOutcome::Timeout { body } | FrameOutcome::ProcessDead { body } => {
                let parts = framer::split_inner(&body, ids);
                for (record, output) in live.iter().zip(parts.into_iter()) {
                    record.fail(output, "session faulted".into()).await;
                    self.publish_status(record, "failed").await;
                }
                self.fault_session("debugger unresponsive after timeout drain").await;
            }
        }
    }

    /// Wait for any record still `Executing` to reach a terminal state, up
    /// to `timeout`, then terminate the debugger process (`q` then kill)
    /// and return its exit code. Called from `session.close`, which owns
    /// the only other access to this session's executor.
    pub async fn shutdown(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        while self
            .session
            .store
            .all()
            .await
            .iter()
            .any(|r| r.state() == CommandState::Executing)
        {
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.adapter.lock().await.terminate(remaining).await
    }

    async fn finish_all_as_failed(&self, live: &[Arc<CommandRecord>], detail: String) {
        for record in live {
            record.fail(Vec::new(), detail.clone()).await;
            self.publish_status(record, "failed").await;
        }
    }

    async fn publish_status(&self, record: &CommandRecord, state: &str) {
        self.notify
            .publish(Notification::CommandStatus {
                session_id: self.session.id.clone(),
                command_id: record.id.clone(),
                state: state.to_string(),
            })
            .await;
    }

    /// A live debugger process is gone or can no longer be trusted to be in
    /// sync with the command stream. Terminal and final: per spec, a dead
    /// debugger is fatal to the session -- there is no automatic respawn,
    /// only the operator opening a new session. Fails every record still
    /// sitting in the queue (they will never get a chance to run) and marks
    /// the session `Faulted` so `get_active` rejects any further enqueue.
    async fn fault_session(&self, reason: &str) {
        self.session
            .store
            .fail_session_queue(&self.session.id, reason)
            .await;
        self.session.set_status(SessionStatus::Faulted);
        self.notify
            .publish(Notification::SessionRecovery {
                session_id: self.session.id.clone(),
                attempt: 0,
                max_attempts: 0,
                succeeded: false,
            })
            .await;
    }
}
