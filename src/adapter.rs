//! Debugger Process Adapter: owns one child debugger process and exposes a
//! line-oriented duplex interface. All I/O carries an explicit deadline so
//! the executor never blocks indefinitely on a hung debugger.
//!
//! Unlike the bash sessions this module's ancestor drove over a PTY, a
//! command-line debugger (CDB/WinDbg) is non-interactive -- stdin/stdout/
//! stderr are plain pipes. stdout and stderr are merged at this boundary by
//! two background line-reader tasks feeding one ordered channel.

use crate::config::DebuggerConfig;
use crate::error::DbgError;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout_at;

/// Outcome of a single `read_line` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    Timeout,
    Eof,
}

/// One child debugger process, merging stdout+stderr into a single ordered
/// line stream and exposing a deadline-bounded read/write interface.
pub struct DebuggerAdapter {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    lines: Mutex<mpsc::Receiver<String>>,
    alive: AtomicBool,
}

impl DebuggerAdapter {
    /// Spawn the debugger attached to `dump_path`, waiting `startup_delay`
    /// for the banner to drain into `prelude`. Fails with
    /// [`DbgError::ProcessFailed`] if the executable cannot be started.
    pub async fn spawn(
        dump_path: &str,
        symbol_path: Option<&str>,
        config: &DebuggerConfig,
        prelude: &mut Vec<String>,
    ) -> Result<Self, DbgError> {
        let mut cmd = Command::new(&config.executable_path);
        cmd.arg("-z").arg(dump_path);
        if let Some(sym) = symbol_path {
            cmd.arg("-y").arg(sym);
        }
        for arg in &config.extra_args {
            cmd.arg(arg);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DbgError::ProcessFailed(format!("failed to spawn debugger: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let (tx, rx) = mpsc::channel(4096);

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_out.send(line).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let adapter = Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            lines: Mutex::new(rx),
            alive: AtomicBool::new(true),
        };

        let deadline = Instant::now() + config.startup_delay();
        loop {
            match adapter.read_line(deadline).await {
                ReadOutcome::Line(line) => prelude.push(line),
                ReadOutcome::Timeout | ReadOutcome::Eof => break,
            }
        }

        Ok(adapter)
    }

    /// Append a line to the child's stdin.
    pub async fn write_line(&self, text: &str) -> Result<(), DbgError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(DbgError::ProcessFailed("debugger process is dead".into()));
        }
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(text.as_bytes())
            .await
            .and_then(|()| stdin.write_all(b"\n"))
            .map_err(|e| {
                self.alive.store(false, Ordering::Release);
                DbgError::ProcessFailed(format!("stdin write failed: {e}"))
            })?;
        stdin
            .flush()
            .await
            .map_err(|e| DbgError::ProcessFailed(format!("stdin flush failed: {e}")))
    }

    /// Return the next merged stdout/stderr line, or `Timeout`/`Eof`.
    pub async fn read_line(&self, deadline: Instant) -> ReadOutcome {
        let mut rx = self.lines.lock().await;
        match timeout_at(deadline.into(), rx.recv()).await {
            Ok(Some(line)) => ReadOutcome::Line(line),
            Ok(None) => {
                self.alive.store(false, Ordering::Release);
                ReadOutcome::Eof
            }
            Err(_) => ReadOutcome::Timeout,
        }
    }

    /// Best-effort debugger-break signal. CDB/WinDbg accept a Ctrl-Break out
    /// of band from the input stream; over a plain pipe the closest
    /// equivalent is re-issuing the break command inline, since there is no
    /// portable way to deliver a true async break signal to a child whose
    /// stdin is a pipe rather than a console. Never fails the caller.
    pub async fn interrupt(&self) {
        let _ = self.write_line(".breakin").await;
    }

    /// Attempt graceful quit (`q`), then forcible kill. Returns the exit
    /// code when known.
    pub async fn terminate(&self, timeout: Duration) -> Option<i32> {
        let _ = self.write_line("q").await;
        let mut child = self.child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                self.alive.store(false, Ordering::Release);
                status.code()
            }
            _ => {
                let _ = child.start_kill();
                let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
                    .await
                    .ok()
                    .and_then(|r| r.ok());
                self.alive.store(false, Ordering::Release);
                status.and_then(|s| s.code())
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
