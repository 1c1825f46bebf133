//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `DbgmuxServer`, exposing session lifecycle and command queueing
//! tools over a pool of debugger-backed [`SessionExecutor`]s.

use crate::config::Config;
use crate::error::DbgError;
use crate::executor::SessionExecutor;
use crate::notify::NotificationFabric;
use crate::output;
use crate::record::{CommandRecord, CommandState};
use crate::session::{Session, SessionManager, SessionStatus};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SessionOpenParams {
    /// Path to the crash dump file on disk, readable by the debugger.
    pub dump_path: String,
    /// Optional symbol search path passed to the debugger's `-y` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_path: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SessionCloseParams {
    pub session_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandEnqueueParams {
    pub session_id: String,
    /// The debugger command text, e.g. `k`, `!analyze -v`, `dt MyStruct`.
    pub command: String,
    /// Per-command timeout in milliseconds. Clamped to the configured max
    /// and defaulted when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandEnqueueBatchParams {
    pub session_id: String,
    pub commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandStatusParams {
    pub session_id: String,
    pub command_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandStatusBulkParams {
    pub session_id: String,
    pub command_ids: Vec<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandResultParams {
    pub session_id: String,
    pub command_id: String,
    /// Cap on how many lines of output are returned inline (split between
    /// head and tail); the rest is summarized by `total_lines`/`truncated`.
    /// Defaults to `DEFAULT_MAX_OUTPUT_LINES`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_lines: Option<usize>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CommandCancelParams {
    pub session_id: String,
    pub command_id: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct QueueStatsParams {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Result structs (serialized to JSON and returned as tool content)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct SessionView {
    session_id: String,
    status: &'static str,
    age_secs: u64,
    idle_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
struct SessionListView {
    sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Serialize)]
struct SessionCloseView {
    session_id: String,
    closed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct CommandQueuedView {
    command_id: String,
    state: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct CommandStatusView {
    command_id: String,
    state: &'static str,
    queued_ms_ago: u64,
    started_ms_ago: Option<u64>,
    finished_ms_ago: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct CommandStatusBulkView {
    items: Vec<CommandStatusView>,
}

#[derive(Debug, Clone, Serialize)]
struct CommandResultView {
    command_id: String,
    state: &'static str,
    output_head: Vec<String>,
    output_tail: Vec<String>,
    output_error_lines: Vec<String>,
    total_lines: usize,
    truncated: bool,
    exit_detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct QueueStatsView {
    session_id: String,
    queued: usize,
    executing: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
    timed_out: usize,
}

#[derive(Debug, Clone, Serialize)]
struct HealthView {
    active_sessions: usize,
    max_sessions: usize,
}

/// Default cap on inline output lines for `command.result` when the caller
/// doesn't specify `max_output_lines`.
const DEFAULT_MAX_OUTPUT_LINES: usize = 500;

fn state_name(state: CommandState) -> &'static str {
    match state {
        CommandState::Queued => "queued",
        CommandState::Executing => "executing",
        CommandState::Completed => "completed",
        CommandState::Failed => "failed",
        CommandState::Cancelled => "cancelled",
        CommandState::TimedOut => "timed_out",
    }
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The dbgmux MCP server.
///
/// Holds a [`SessionManager`] for the session table and one
/// [`SessionExecutor`] background task per open session, plus the shared
/// [`NotificationFabric`] those executors publish into.
#[derive(Clone)]
pub struct DbgmuxServer {
    sessions: Arc<SessionManager>,
    notify: Arc<NotificationFabric>,
    config: Arc<Config>,
    executors: Arc<RwLock<HashMap<String, Arc<SessionExecutor>>>>,
    tool_router: ToolRouter<DbgmuxServer>,
}

impl DbgmuxServer {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let sessions = Arc::new(SessionManager::new(config.clone()));
        let server = Self {
            sessions: sessions.clone(),
            notify: Arc::new(NotificationFabric::new()),
            config: config.clone(),
            executors: Arc::new(RwLock::new(HashMap::new())),
            tool_router: Self::tool_router(),
        };
        tokio::spawn(run_maintenance(sessions, config));
        server
    }

    async fn session_or_error(&self, id: &str) -> Result<Arc<Session>, McpError> {
        self.sessions
            .get_active(id)
            .await
            .map_err(|e| e.into_mcp_error(Some(id), None))
    }

    async fn command_or_error(
        &self,
        session: &Arc<Session>,
        command_id: &str,
    ) -> Result<Arc<CommandRecord>, McpError> {
        session.store.get(command_id).await.ok_or_else(|| {
            DbgError::NotFound(format!("no such command: {command_id}"))
                .into_mcp_error(Some(&session.id), Some(command_id))
        })
    }

    async fn enqueue_one(
        &self,
        session: &Arc<Session>,
        command: String,
        timeout_ms: Option<u64>,
    ) -> Arc<CommandRecord> {
        let id = Uuid::new_v4().to_string();
        let is_simple = self.config.batching.is_safe(&command);
        let timeout = self.config.command.clamp_timeout(timeout_ms, is_simple);
        let record = Arc::new(CommandRecord::new(
            id,
            session.id.clone(),
            command,
            timeout,
        ));
        session.store.enqueue(record.clone()).await;
        session.touch();
        record
    }

    async fn status_view(record: &CommandRecord) -> CommandStatusView {
        let started_ms_ago = record
            .started_at
            .lock()
            .await
            .map(|t| t.elapsed().as_millis() as u64);
        let finished_ms_ago = record
            .finished_at
            .lock()
            .await
            .map(|t| t.elapsed().as_millis() as u64);
        CommandStatusView {
            command_id: record.id.clone(),
            state: state_name(record.state()),
            queued_ms_ago: record.queued_at.elapsed().as_millis() as u64,
            started_ms_ago,
            finished_ms_ago,
        }
    }

    fn session_view(session: &Session) -> SessionView {
        SessionView {
            session_id: session.id.clone(),
            status: session.status().as_str(),
            age_secs: session.created_at.elapsed().as_secs(),
            idle_secs: session.idle_for().as_secs(),
        }
    }
}

/// Periodic background sweep: closes sessions idle past their timeout and
/// drops command records past their retention window, per the cleanup
/// interval configured for the process.
async fn run_maintenance(sessions: Arc<SessionManager>, config: Arc<Config>) {
    let mut interval = tokio::time::interval(config.session.cleanup_interval());
    loop {
        interval.tick().await;
        let expired = sessions.sweep_idle().await;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "idle sweep closed sessions");
        }
        for session in sessions.list().await {
            let dropped = session.store.sweep_retention(config.command.retention()).await;
            if dropped > 0 {
                tracing::debug!(session_id = %session.id, dropped, "retention sweep dropped records");
            }
        }
    }
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router]
impl DbgmuxServer {
    #[tool(
        description = "Open a new debugger session attached to a crash dump. Spawns a dedicated debugger child process and returns a session_id used by every other tool in this server. Fails with CapacityExceeded once max_concurrent_sessions open sessions already exist."
    )]
    async fn session_open(
        &self,
        Parameters(params): Parameters<SessionOpenParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(dump_path = %params.dump_path, "session.open");
        crate::dumpcheck::precheck_dump(&params.dump_path, &self.config.debugger)
            .await
            .map_err(|e| e.into_mcp_error(None, None))?;

        let session = self
            .sessions
            .create(params.dump_path.clone(), params.symbol_path.clone())
            .await
            .map_err(|e| e.into_mcp_error(None, None))?;

        let mut prelude = Vec::new();
        let adapter = crate::adapter::DebuggerAdapter::spawn(
            &params.dump_path,
            params.symbol_path.as_deref(),
            &self.config.debugger,
            &mut prelude,
        )
        .await
        .map_err(|e| e.into_mcp_error(Some(&session.id), None));

        let adapter = match adapter {
            Ok(a) => a,
            Err(e) => {
                self.sessions.remove(&session.id).await;
                return Err(e);
            }
        };

        let executor = SessionExecutor::new(
            session.clone(),
            adapter,
            self.config.clone(),
            self.notify.clone(),
        );
        self.executors
            .write()
            .await
            .insert(session.id.clone(), executor.clone());
        tokio::spawn(executor.run());

        json_content(&Self::session_view(&session))
    }

    #[tool(
        description = "Close a debugger session: cancels any commands still queued, terminates the debugger process, and removes the session. Further calls referencing this session_id return NotFound."
    )]
    async fn session_close(
        &self,
        Parameters(params): Parameters<SessionCloseParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(session_id = %params.session_id, "session.close");

        // Idempotent per spec: closing an already-closed (or never-open)
        // session id is a successful no-op, not NotFound.
        let Some(session) = self.sessions.get(&params.session_id).await else {
            return json_content(&SessionCloseView {
                session_id: params.session_id,
                closed: false,
            });
        };

        session.set_status(SessionStatus::Closing);
        session.store.cancel_session_queue(&session.id).await;

        let executor = self.executors.write().await.remove(&session.id);
        if let Some(executor) = executor {
            let exit_code = executor
                .shutdown(self.config.session.disposal_timeout())
                .await;
            tracing::info!(session_id = %session.id, ?exit_code, "debugger process terminated");
        }
        self.sessions.remove(&session.id).await;
        session.set_status(SessionStatus::Closed);

        json_content(&SessionCloseView {
            session_id: params.session_id,
            closed: true,
        })
    }

    #[tool(description = "List every open session with its current status.")]
    async fn session_list(&self) -> Result<CallToolResult, McpError> {
        let sessions = self.sessions.list().await;
        let views: Vec<SessionView> = sessions.iter().map(|s| Self::session_view(s)).collect();
        json_content(&SessionListView { sessions: views })
    }

    #[tool(
        description = "Queue a single debugger command against an open session. Returns immediately with a command_id in the `queued` state; poll command.status or command.result to retrieve the outcome."
    )]
    async fn command_enqueue(
        &self,
        Parameters(params): Parameters<CommandEnqueueParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let record = self
            .enqueue_one(&session, params.command, params.timeout_ms)
            .await;
        json_content(&CommandQueuedView {
            command_id: record.id.clone(),
            state: state_name(record.state()),
        })
    }

    #[tool(
        description = "Queue several debugger commands against an open session in one call, preserving order. Each gets its own command_id; the executor may opportunistically run a consecutive run of batch-safe commands in a single debugger round trip, but callers observe the same per-command status/result contract either way."
    )]
    async fn command_enqueue_batch(
        &self,
        Parameters(params): Parameters<CommandEnqueueBatchParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let mut views = Vec::with_capacity(params.commands.len());
        for command in params.commands {
            let record = self
                .enqueue_one(&session, command, params.timeout_ms)
                .await;
            views.push(CommandQueuedView {
                command_id: record.id.clone(),
                state: state_name(record.state()),
            });
        }
        json_content(&views)
    }

    #[tool(
        description = "Check a single command's lifecycle state (queued/executing/completed/failed/cancelled/timed_out) without blocking."
    )]
    async fn command_status(
        &self,
        Parameters(params): Parameters<CommandStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let record = self.command_or_error(&session, &params.command_id).await?;
        json_content(&Self::status_view(&record).await)
    }

    #[tool(
        description = "Check the lifecycle state of several commands in one call. Unknown command_ids are simply omitted from the result rather than failing the whole call."
    )]
    async fn command_status_bulk(
        &self,
        Parameters(params): Parameters<CommandStatusBulkParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let records = session.store.get_many(&params.command_ids).await;
        let mut items = Vec::with_capacity(records.len());
        for record in records.into_iter().flatten() {
            items.push(Self::status_view(&record).await);
        }
        json_content(&CommandStatusBulkView { items })
    }

    #[tool(
        description = "Retrieve a command's captured debugger output. Returns PreconditionFailed if the command has not yet reached a terminal state -- poll command.status first."
    )]
    async fn command_result(
        &self,
        Parameters(params): Parameters<CommandResultParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let record = self.command_or_error(&session, &params.command_id).await?;
        let state = record.state();
        if !state.is_terminal() {
            return Err(DbgError::PreconditionFailed(format!(
                "command {} is still {}",
                params.command_id,
                state_name(state)
            ))
            .into_mcp_error(Some(&params.session_id), Some(&params.command_id)));
        }
        let outcome = record.outcome().await;
        let max_lines = params.max_output_lines.unwrap_or(DEFAULT_MAX_OUTPUT_LINES);
        let windowed = output::window(&outcome.output, max_lines);
        json_content(&CommandResultView {
            command_id: record.id.clone(),
            state: state_name(state),
            output_head: windowed.head,
            output_tail: windowed.tail,
            output_error_lines: windowed.error_lines,
            total_lines: windowed.total_lines,
            truncated: windowed.truncated,
            exit_detail: outcome.exit_detail,
        })
    }

    #[tool(
        description = "Cancel a queued or executing command. A command that has already reached a terminal state cannot be cancelled; this returns its final state rather than erroring."
    )]
    async fn command_cancel(
        &self,
        Parameters(params): Parameters<CommandCancelParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let record = self.command_or_error(&session, &params.command_id).await?;
        record.cancel().await;
        json_content(&Self::status_view(&record).await)
    }

    #[tool(description = "Report a session's command counts broken down by lifecycle state.")]
    async fn queue_stats(
        &self,
        Parameters(params): Parameters<QueueStatsParams>,
    ) -> Result<CallToolResult, McpError> {
        let session = self.session_or_error(&params.session_id).await?;
        let mut stats = QueueStatsView {
            session_id: params.session_id,
            queued: 0,
            executing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            timed_out: 0,
        };
        for record in session.store.all().await {
            match record.state() {
                CommandState::Queued => stats.queued += 1,
                CommandState::Executing => stats.executing += 1,
                CommandState::Completed => stats.completed += 1,
                CommandState::Failed => stats.failed += 1,
                CommandState::Cancelled => stats.cancelled += 1,
                CommandState::TimedOut => stats.timed_out += 1,
            }
        }
        json_content(&stats)
    }

    #[tool(description = "Report overall server health: how many sessions are open out of the configured capacity.")]
    async fn health_get(&self) -> Result<CallToolResult, McpError> {
        json_content(&HealthView {
            active_sessions: self.sessions.len().await,
            max_sessions: self.config.session.max_concurrent_sessions,
        })
    }
}

#[tool_handler]
impl ServerHandler for DbgmuxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "dbgmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "dbgmux multiplexes analysis sessions over a pool of native debugger child \
                 processes (CDB/WinDbg), one process per open session.\n\n\
                 Call session.open with a dump_path to start a session, then command.enqueue \
                 (or command.enqueue_batch for several at once) to queue debugger commands \
                 against it. Commands run asynchronously -- poll command.status or \
                 command.status_bulk, and fetch command.result once a command reaches a \
                 terminal state (completed/failed/cancelled/timed_out). Call session.close \
                 when done with a session to free its debugger process."
                    .to_string(),
            ),
        }
    }
}
