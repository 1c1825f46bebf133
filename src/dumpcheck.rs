//! Dump pre-validation, run once before a session's debugger process is
//! spawned. The cheap existence/size check is a pure predicate, same shape
//! as the command-safety checks elsewhere in this codebase; the optional
//! `dumpchk`-style integrity check is a bounded-timeout subprocess call that
//! fails open, since an unresponsive validator should never block a session
//! a working debugger could otherwise open.

use crate::config::DebuggerConfig;
use crate::error::DbgError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Cheap, synchronous check that the dump file exists and is non-empty.
pub fn validate_dump_path(dump_path: &str) -> Result<(), String> {
    let path = Path::new(dump_path);
    let metadata = std::fs::metadata(path)
        .map_err(|e| format!("cannot read dump file {dump_path}: {e}"))?;
    if metadata.len() == 0 {
        return Err(format!("dump file is empty: {dump_path}"));
    }
    Ok(())
}

/// Run the synchronous check, then -- if `dumpchk_executable` is configured
/// -- spawn it against the dump and wait up to `dumpchk_timeout` for it to
/// exit. A non-zero exit rejects the dump; a missing binary, spawn failure,
/// or timeout all skip validation rather than blocking session creation.
pub async fn precheck_dump(dump_path: &str, config: &DebuggerConfig) -> Result<(), DbgError> {
    validate_dump_path(dump_path).map_err(DbgError::InvalidArgument)?;

    let Some(dumpchk_path) = &config.dumpchk_executable else {
        return Ok(());
    };

    let mut cmd = Command::new(dumpchk_path);
    cmd.arg(dump_path);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let Ok(mut child) = cmd.spawn() else {
        return Ok(());
    };

    match tokio::time::timeout(config.dumpchk_timeout(), child.wait()).await {
        Ok(Ok(status)) if !status.success() => Err(DbgError::InvalidArgument(format!(
            "dumpchk rejected dump file: {dump_path}"
        ))),
        Ok(_) => Ok(()),
        Err(_) => {
            let _ = child.start_kill();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dump_file_is_rejected() {
        let result = validate_dump_path("/no/such/dump.dmp");
        assert!(result.is_err());
    }

    #[test]
    fn empty_dump_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = validate_dump_path(file.path().to_str().unwrap());
        assert!(result.unwrap_err().contains("empty"));
    }

    #[test]
    fn non_empty_dump_file_passes() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"fake dump bytes").unwrap();
        assert!(validate_dump_path(file.path().to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn precheck_skips_validation_when_no_dumpchk_configured() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"fake dump bytes").unwrap();
        let config = DebuggerConfig::default();
        let result = precheck_dump(file.path().to_str().unwrap(), &config).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn precheck_rejects_missing_dump_before_spawning_dumpchk() {
        let config = DebuggerConfig {
            dumpchk_executable: Some("/bin/true".into()),
            ..DebuggerConfig::default()
        };
        let result = precheck_dump("/no/such/dump.dmp", &config).await;
        assert!(matches!(result, Err(DbgError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn precheck_rejects_when_dumpchk_exits_nonzero() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"fake dump bytes").unwrap();
        let config = DebuggerConfig {
            dumpchk_executable: Some("/bin/false".into()),
            ..DebuggerConfig::default()
        };
        let result = precheck_dump(file.path().to_str().unwrap(), &config).await;
        assert!(matches!(result, Err(DbgError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn precheck_skips_validation_when_dumpchk_times_out() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"fake dump bytes").unwrap();

        let mut slow_checker = tempfile::NamedTempFile::new().unwrap();
        write!(slow_checker, "#!/bin/sh\nsleep 5\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(slow_checker.path()).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(slow_checker.path(), perms).unwrap();
        }

        let config = DebuggerConfig {
            dumpchk_executable: Some(slow_checker.path().to_string_lossy().into_owned()),
            dumpchk_timeout_secs: 0,
            ..DebuggerConfig::default()
        };
        let result = precheck_dump(file.path().to_str().unwrap(), &config).await;
        assert!(result.is_ok());
    }
}
