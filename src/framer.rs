//! Output Framer: turns a stream of debugger output lines into a discrete
//! block per executed command, without relying on prompt detection.
//!
//! Protocol: before a command the executor writes an `.echo` line producing
//! a start sentinel `<<<WADBG_BEGIN id>>>`; after it, an end sentinel
//! `<<<WADBG_END id>>>`. Everything in between (exclusive of the sentinel
//! lines) is the block body. A batch of commands additionally frames each
//! sub-command with an inner item sentinel so the executor can split the one
//! debugger round-trip back into per-command results.

use crate::adapter::{DebuggerAdapter, ReadOutcome};
use std::time::{Duration, Instant};

pub fn begin_sentinel(id: &str) -> String {
    format!("<<<WADBG_BEGIN {id}>>>")
}

pub fn end_sentinel(id: &str) -> String {
    format!("<<<WADBG_END {id}>>>")
}

pub fn item_sentinel(id: &str) -> String {
    format!("<<<WADBG_ITEM {id}>>>")
}

/// Debugger-meta command that makes the adapter print a bare line of text.
pub fn echo_line(text: &str) -> String {
    format!(".echo {text}")
}

/// Outcome of reading one framed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// End sentinel observed; `body` is the complete block.
    Complete { body: Vec<String> },
    /// Deadline elapsed before the end sentinel arrived; `body` is whatever
    /// was captured so far.
    Timeout { body: Vec<String> },
    /// The adapter reported EOF before the end sentinel arrived.
    ProcessDead { body: Vec<String> },
}

/// Read lines from `adapter` until the end sentinel for `id` is seen, the
/// `deadline` elapses, or the adapter reports EOF. Lines before the start
/// sentinel are discarded (the adapter's own startup prelude is captured
/// separately, at spawn time).
pub async fn read_block(adapter: &DebuggerAdapter, id: &str, deadline: Instant) -> FrameOutcome {
    let begin = begin_sentinel(id);
    let end = end_sentinel(id);
    let mut body = Vec::new();
    let mut started = false;

    loop {
        match adapter.read_line(deadline).await {
            ReadOutcome::Line(line) => {
                if !started {
                    if line.trim() == begin {
                        started = true;
                    }
                    continue;
                }
                if line.trim() == end {
                    return FrameOutcome::Complete { body };
                }
                body.push(line);
            }
            ReadOutcome::Timeout => return FrameOutcome::Timeout { body },
            ReadOutcome::Eof => return FrameOutcome::ProcessDead { body },
        }
    }
}

/// Like [`read_block`], but calls `on_heartbeat` every `heartbeat_interval`
/// while still waiting for the end sentinel, without losing the partial
/// body or re-waiting for the start sentinel on each checkpoint the way a
/// naive retry loop calling `read_block` repeatedly would.
pub async fn read_block_with_heartbeat(
    adapter: &DebuggerAdapter,
    id: &str,
    deadline: Instant,
    heartbeat_interval: Duration,
    mut on_heartbeat: impl FnMut(),
) -> FrameOutcome {
    let begin = begin_sentinel(id);
    let end = end_sentinel(id);
    let mut body = Vec::new();
    let mut started = false;
    let mut next_beat = Instant::now() + heartbeat_interval;

    loop {
        let checkpoint = next_beat.min(deadline);
        match adapter.read_line(checkpoint).await {
            ReadOutcome::Line(line) => {
                if !started {
                    if line.trim() == begin {
                        started = true;
                    }
                    continue;
                }
                if line.trim() == end {
                    return FrameOutcome::Complete { body };
                }
                body.push(line);
            }
            ReadOutcome::Timeout => {
                if checkpoint >= deadline {
                    return FrameOutcome::Timeout { body };
                }
                on_heartbeat();
                next_beat = Instant::now() + heartbeat_interval;
            }
            ReadOutcome::Eof => return FrameOutcome::ProcessDead { body },
        }
    }
}

/// Continue reading a block whose begin sentinel was already consumed by an
/// earlier [`read_block`]/[`read_block_with_heartbeat`] call that timed out,
/// looking only for the end sentinel (or EOF) before `deadline`. Used for
/// the bounded grace-window drain that follows an `interrupt()` after a
/// command timeout: re-calling `read_block` would wait forever for a begin
/// sentinel that was already seen and will never be echoed again.
pub async fn drain_block(
    adapter: &DebuggerAdapter,
    id: &str,
    deadline: Instant,
    mut body: Vec<String>,
) -> FrameOutcome {
    let end = end_sentinel(id);
    loop {
        match adapter.read_line(deadline).await {
            ReadOutcome::Line(line) => {
                if line.trim() == end {
                    return FrameOutcome::Complete { body };
                }
                body.push(line);
            }
            ReadOutcome::Timeout => return FrameOutcome::Timeout { body },
            ReadOutcome::Eof => return FrameOutcome::ProcessDead { body },
        }
    }
}

/// Split a batched block's body into one sub-body per command, using the
/// inner item sentinels the executor interleaved between sub-commands.
/// `ids` must list the per-command sentinel ids in dispatch order: the
/// executor writes `item_sentinel(ids[k])` right before dispatching command
/// `k` for every `k >= 1` (command 0 has no leading marker -- the outer
/// begin sentinel plays that role). The last command's body runs to the end
/// of `body`.
pub fn split_inner(body: &[String], ids: &[String]) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = Vec::with_capacity(ids.len());
    let mut current = Vec::new();
    // Looking for the marker that opens ids[next_id], starting at command 1.
    let mut next_id = 1usize;

    for line in body {
        if next_id < ids.len() {
            let marker = item_sentinel(&ids[next_id]);
            if line.trim() == marker {
                out.push(std::mem::take(&mut current));
                next_id += 1;
                continue;
            }
        }
        current.push(line.clone());
    }
    out.push(current);
    out
}
