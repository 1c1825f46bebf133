//! Stable error taxonomy surfaced to MCP clients.
//!
//! Each variant maps to one of the JSON-RPC error codes contractually defined
//! for this service. Codes are assigned outside the JSON-RPC reserved range
//! (`-32768..=-32000`) so they never collide with transport-level errors.

use rmcp::ErrorData as McpError;
use rmcp::model::ErrorCode;
use serde_json::json;
use thiserror::Error;

/// Domain error taxonomy. See spec §7 for the contract each variant honors.
#[derive(Debug, Error, Clone)]
pub enum DbgError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("process failed: {0}")]
    ProcessFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbgError {
    /// The stable JSON-RPC error code for this taxon. Outside the reserved
    /// `-32768..=-32000` range used by the protocol layer itself.
    pub const fn rpc_code(&self) -> i64 {
        match self {
            DbgError::InvalidArgument(_) => -31001,
            DbgError::NotFound(_) => -31002,
            DbgError::PreconditionFailed(_) => -31003,
            DbgError::CapacityExceeded(_) => -31004,
            DbgError::Timeout(_) => -31005,
            DbgError::Cancelled(_) => -31006,
            DbgError::ProcessFailed(_) => -31007,
            DbgError::Internal(_) => -31008,
        }
    }

    /// One-line stable name, included in `data.hint` for programmatic clients.
    pub const fn name(&self) -> &'static str {
        match self {
            DbgError::InvalidArgument(_) => "InvalidArgument",
            DbgError::NotFound(_) => "NotFound",
            DbgError::PreconditionFailed(_) => "PreconditionFailed",
            DbgError::CapacityExceeded(_) => "CapacityExceeded",
            DbgError::Timeout(_) => "Timeout",
            DbgError::Cancelled(_) => "Cancelled",
            DbgError::ProcessFailed(_) => "ProcessFailed",
            DbgError::Internal(_) => "Internal",
        }
    }

    /// Build the JSON-RPC error returned to the client, carrying
    /// `{sessionId?, commandId?, hint}` in `data` per spec §7.
    pub fn into_mcp_error(self, session_id: Option<&str>, command_id: Option<&str>) -> McpError {
        let mut data = json!({ "hint": self.name() });
        if let Some(sid) = session_id {
            data["sessionId"] = json!(sid);
        }
        if let Some(cid) = command_id {
            data["commandId"] = json!(cid);
        }
        let message = self.to_string();
        McpError::new(ErrorCode(self.rpc_code() as i32), message, Some(data))
    }
}
