//! End-to-end session tests: SessionManager + SessionExecutor + a fake
//! debugger child process, without going through the MCP tool layer.
//!
//! These exercise the full pipeline -- enqueue, batching, heartbeats, and
//! session faulting on a debugger crash -- at the level just below
//! `DbgmuxServer`.

use dbgmux::adapter::DebuggerAdapter;
use dbgmux::config::Config;
use dbgmux::executor::SessionExecutor;
use dbgmux::notify::NotificationFabric;
use dbgmux::record::{CommandRecord, CommandState};
use dbgmux::session::{SessionManager, SessionStatus};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn fixture_script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "#!/bin/sh\n{body}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(file.path()).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(file.path(), perms).unwrap();
    }
    file
}

/// A fake debugger: interprets `.echo <text>` like cdb does, acks anything
/// else. Good enough to drive the sentinel-framed protocol in framer.rs.
fn ack_script() -> tempfile::NamedTempFile {
    fixture_script(
        "while IFS= read -r line; do\n  \
           case \"$line\" in\n    \
             .echo\\ *) echo \"${line#.echo }\" ;;\n    \
             *) echo \"ack: $line\" ;;\n  \
           esac\ndone",
    )
}

async fn poll_terminal(record: &Arc<CommandRecord>) -> CommandState {
    for _ in 0..200 {
        let state = record.state();
        if state.is_terminal() {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("command {} never reached a terminal state", record.id);
}

#[tokio::test]
async fn executor_drives_single_command_to_completion() {
    let script = ack_script();
    let mut config = Config::default();
    config.debugger.executable_path = script.path().to_string_lossy().into_owned();
    config.debugger.startup_delay_ms = 50;
    let config = Arc::new(config);

    let manager = SessionManager::new(config.clone());
    let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();

    let mut prelude = Vec::new();
    let adapter = DebuggerAdapter::spawn("/tmp/a.dmp", None, &config.debugger, &mut prelude)
        .await
        .unwrap();

    let notify = Arc::new(NotificationFabric::new());
    let executor = SessionExecutor::new(session.clone(), adapter, config.clone(), notify);
    tokio::spawn(executor.clone().run());

    let record = Arc::new(CommandRecord::new(
        "cmd-1".into(),
        session.id.clone(),
        "version".into(),
        Duration::from_secs(5),
    ));
    session.store.enqueue(record.clone()).await;

    let state = poll_terminal(&record).await;
    assert_eq!(state, CommandState::Completed);
    let outcome = record.outcome().await;
    assert!(outcome.output.iter().any(|l| l.contains("ack: version")));

    session.set_status(SessionStatus::Closed);
}

#[tokio::test]
async fn executor_batches_consecutive_safe_commands() {
    let script = ack_script();
    let mut config = Config::default();
    config.debugger.executable_path = script.path().to_string_lossy().into_owned();
    config.debugger.startup_delay_ms = 50;
    let config = Arc::new(config);

    let manager = SessionManager::new(config.clone());
    let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();

    let mut prelude = Vec::new();
    let adapter = DebuggerAdapter::spawn("/tmp/a.dmp", None, &config.debugger, &mut prelude)
        .await
        .unwrap();

    let notify = Arc::new(NotificationFabric::new());
    let executor = SessionExecutor::new(session.clone(), adapter, config.clone(), notify);
    tokio::spawn(executor.clone().run());

    // "version" and "k" are both on the default safe list, so these should
    // run as one batched round trip against the debugger.
    let records: Vec<Arc<CommandRecord>> = ["version", "k", "lm"]
        .iter()
        .enumerate()
        .map(|(i, cmd)| {
            Arc::new(CommandRecord::new(
                format!("cmd-{i}"),
                session.id.clone(),
                cmd.to_string(),
                Duration::from_secs(5),
            ))
        })
        .collect();
    for record in &records {
        session.store.enqueue(record.clone()).await;
    }

    for record in &records {
        assert_eq!(poll_terminal(record).await, CommandState::Completed);
    }
    for (record, cmd) in records.iter().zip(["version", "k", "lm"]) {
        let outcome = record.outcome().await;
        assert!(
            outcome.output.iter().any(|l| l.contains(&format!("ack: {cmd}"))),
            "expected output for {cmd}, got {:?}",
            outcome.output
        );
    }

    session.set_status(SessionStatus::Closed);
}

#[tokio::test]
async fn executor_faults_session_after_debugger_process_dies_without_respawn() {
    let config = Arc::new(Config::default());

    let manager = SessionManager::new(config.clone());
    let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();

    // This debugger process exits immediately after its prompt, so the very
    // first dispatched command hits EOF instead of an end sentinel.
    let dying_script = fixture_script("exit 0");
    let mut dying_config = config.debugger.clone();
    dying_config.executable_path = dying_script.path().to_string_lossy().into_owned();
    dying_config.startup_delay_ms = 50;
    let mut prelude = Vec::new();
    let adapter = DebuggerAdapter::spawn("/tmp/a.dmp", None, &dying_config, &mut prelude)
        .await
        .unwrap();

    let notify = Arc::new(NotificationFabric::new());
    let executor = SessionExecutor::new(session.clone(), adapter, config.clone(), notify);
    tokio::spawn(executor.clone().run());

    let record = Arc::new(CommandRecord::new(
        "cmd-1".into(),
        session.id.clone(),
        "version".into(),
        Duration::from_secs(5),
    ));
    session.store.enqueue(record.clone()).await;

    // Not on the batch-safe allow-list, so the executor won't fold it into
    // the same dispatched round trip as `cmd-1` -- it must still be Queued
    // when the debugger process dies.
    let queued_after = Arc::new(CommandRecord::new(
        "cmd-2".into(),
        session.id.clone(),
        "!analyze -v".into(),
        Duration::from_secs(5),
    ));
    session.store.enqueue(queued_after.clone()).await;

    for _ in 0..200 {
        if record.state().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record.state(), CommandState::Failed);

    for _ in 0..200 {
        if session.status() == SessionStatus::Faulted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // ProcessDead is fatal: no respawn, the session goes straight to
    // Faulted, and any still-queued command fails along with it rather
    // than waiting for a debugger process that will never come back.
    assert_eq!(session.status(), SessionStatus::Faulted);
    assert_eq!(queued_after.state(), CommandState::Failed);

    session.set_status(SessionStatus::Closed);
}

#[tokio::test]
async fn session_close_cancels_queued_work_ahead_of_the_executor() {
    let script = ack_script();
    let mut config = Config::default();
    config.debugger.executable_path = script.path().to_string_lossy().into_owned();
    config.debugger.startup_delay_ms = 50;
    let config = Arc::new(config);

    let manager = SessionManager::new(config.clone());
    let session = manager.create("/tmp/a.dmp".into(), None).await.unwrap();

    let record = Arc::new(CommandRecord::new(
        "cmd-1".into(),
        session.id.clone(),
        "version".into(),
        Duration::from_secs(5),
    ));
    session.store.enqueue(record.clone()).await;

    let cancelled = session.store.cancel_session_queue(&session.id).await;
    assert_eq!(cancelled, 1);
    assert_eq!(record.state(), CommandState::Cancelled);
}

#[tokio::test]
async fn multiple_sessions_run_independently() {
    let script_a = ack_script();
    let script_b = ack_script();
    let mut config = Config::default();
    config.debugger.startup_delay_ms = 50;
    let config = Arc::new(config);

    let manager = SessionManager::new(config.clone());
    let session_a = manager.create("/tmp/a.dmp".into(), None).await.unwrap();
    let session_b = manager.create("/tmp/b.dmp".into(), None).await.unwrap();
    assert_ne!(session_a.id, session_b.id);

    let mut debugger_a = config.debugger.clone();
    debugger_a.executable_path = script_a.path().to_string_lossy().into_owned();
    let mut debugger_b = config.debugger.clone();
    debugger_b.executable_path = script_b.path().to_string_lossy().into_owned();

    let mut prelude = Vec::new();
    let adapter_a = DebuggerAdapter::spawn("/tmp/a.dmp", None, &debugger_a, &mut prelude)
        .await
        .unwrap();
    let mut prelude = Vec::new();
    let adapter_b = DebuggerAdapter::spawn("/tmp/b.dmp", None, &debugger_b, &mut prelude)
        .await
        .unwrap();

    let notify = Arc::new(NotificationFabric::new());
    let executor_a = SessionExecutor::new(session_a.clone(), adapter_a, config.clone(), notify.clone());
    let executor_b = SessionExecutor::new(session_b.clone(), adapter_b, config.clone(), notify);
    tokio::spawn(executor_a.clone().run());
    tokio::spawn(executor_b.clone().run());

    let record_a = Arc::new(CommandRecord::new(
        "a-1".into(),
        session_a.id.clone(),
        "version".into(),
        Duration::from_secs(5),
    ));
    let record_b = Arc::new(CommandRecord::new(
        "b-1".into(),
        session_b.id.clone(),
        "k".into(),
        Duration::from_secs(5),
    ));
    session_a.store.enqueue(record_a.clone()).await;
    session_b.store.enqueue(record_b.clone()).await;

    assert_eq!(poll_terminal(&record_a).await, CommandState::Completed);
    assert_eq!(poll_terminal(&record_b).await, CommandState::Completed);

    assert_eq!(manager.list().await.len(), 2);
    session_a.set_status(SessionStatus::Closed);
    session_b.set_status(SessionStatus::Closed);
}
