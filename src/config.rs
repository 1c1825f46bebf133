//! Process-wide configuration. Built once at startup and passed by `Arc`
//! reference into the Session Manager and Notification Fabric; no component
//! reaches for a singleton or service locator.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub session_idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub disposal_timeout_secs: u64,
    pub delete_dump_on_close: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 1000,
            session_idle_timeout_secs: 30 * 60,
            cleanup_interval_secs: 5 * 60,
            disposal_timeout_secs: 30,
            delete_dump_on_close: false,
        }
    }
}

impl SessionConfig {
    pub fn session_idle_timeout(&self) -> Duration {
        secs(self.session_idle_timeout_secs)
    }
    pub fn cleanup_interval(&self) -> Duration {
        secs(self.cleanup_interval_secs)
    }
    pub fn disposal_timeout(&self) -> Duration {
        secs(self.disposal_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub simple_command_timeout_secs: u64,
    pub retention_secs: u64,
    pub output_reading_timeout_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 10 * 60,
            max_timeout_secs: 60 * 60,
            simple_command_timeout_secs: 2 * 60,
            retention_secs: 60 * 60,
            output_reading_timeout_secs: 5 * 60,
        }
    }
}

impl CommandConfig {
    pub fn default_timeout(&self) -> Duration {
        secs(self.default_timeout_secs)
    }
    pub fn max_timeout(&self) -> Duration {
        secs(self.max_timeout_secs)
    }
    pub fn simple_command_timeout(&self) -> Duration {
        secs(self.simple_command_timeout_secs)
    }
    pub fn retention(&self) -> Duration {
        secs(self.retention_secs)
    }
    pub fn output_reading_timeout(&self) -> Duration {
        secs(self.output_reading_timeout_secs)
    }

    /// Clamp a client-requested timeout to `(0, max_timeout]`. When the
    /// client doesn't specify one, a command on the batch-safe allow-list
    /// defaults to `simple_command_timeout`; anything else defaults to
    /// `default_timeout`.
    pub fn clamp_timeout(&self, requested_ms: Option<u64>, is_simple: bool) -> Duration {
        match requested_ms {
            Some(ms) => Duration::from_millis(ms.max(1)).min(self.max_timeout()),
            None if is_simple => self.simple_command_timeout(),
            None => self.default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub delay_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 5,
            health_check_interval_secs: 30,
        }
    }
}

impl RecoveryConfig {
    pub fn delay(&self) -> Duration {
        secs(self.delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub safe_commands: Vec<String>,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safe_commands: vec![
                "version".into(),
                "lm".into(),
                "!peb".into(),
                "k".into(),
                "~".into(),
                "~*k".into(),
                "!threads".into(),
                "!locks".into(),
                "!runaway".into(),
            ],
        }
    }
}

impl BatchingConfig {
    /// A command is batch-safe if it's on the configured allow-list and
    /// contains neither `!analyze` nor shell/redirection metacharacters.
    pub fn is_safe(&self, command: &str) -> bool {
        let trimmed = command.trim();
        if trimmed.contains("!analyze") {
            return false;
        }
        if trimmed.chars().any(|c| "|&;<>`$\n".contains(c)) {
            return false;
        }
        self.safe_commands.iter().any(|safe| safe == trimmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub executable_path: String,
    pub extra_args: Vec<String>,
    pub startup_delay_ms: u64,
    pub prompt_delay_ms: u64,
    pub dumpchk_timeout_secs: u64,
    /// Path to a `dumpchk`-style integrity checker run before a session's
    /// debugger process is spawned. `None` skips pre-validation entirely
    /// (the default -- not every deployment carries this tool).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dumpchk_executable: Option<String>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            executable_path: "cdb.exe".into(),
            extra_args: Vec::new(),
            startup_delay_ms: 500,
            prompt_delay_ms: 2_000,
            dumpchk_timeout_secs: 10,
            dumpchk_executable: None,
        }
    }
}

impl DebuggerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
    pub fn prompt_delay(&self) -> Duration {
        Duration::from_millis(self.prompt_delay_ms)
    }
    pub fn dumpchk_timeout(&self) -> Duration {
        secs(self.dumpchk_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".into(),
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub service_shutdown_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            service_shutdown_timeout_secs: 5,
        }
    }
}

impl ShutdownConfig {
    pub fn service_shutdown_timeout(&self) -> Duration {
        secs(self.service_shutdown_timeout_secs)
    }
}

/// Root configuration value. One instance lives for the life of the process,
/// constructed in `main` and threaded through by `Arc`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub command: CommandConfig,
    pub recovery: RecoveryConfig,
    pub batching: BatchingConfig,
    pub debugger: DebuggerConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load from an optional TOML file, falling back to defaults for any
    /// field the file omits (and falling back entirely if `path` is `None`
    /// or missing). Config-file *loading mechanics* are out of this crate's
    /// scope per spec §1; this is the minimal typed-value entry point the
    /// rest of the system depends on.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&text)?)
            }
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.session.max_concurrent_sessions, 1000);
        assert_eq!(cfg.session.session_idle_timeout_secs, 1800);
        assert_eq!(cfg.command.default_timeout_secs, 600);
        assert_eq!(cfg.command.max_timeout_secs, 3600);
        assert_eq!(cfg.command.retention_secs, 3600);
        assert_eq!(cfg.recovery.max_attempts, 3);
        assert_eq!(cfg.recovery.delay_secs, 5);
    }

    #[test]
    fn batching_rejects_analyze_and_shell_metacharacters() {
        let cfg = BatchingConfig::default();
        assert!(cfg.is_safe("version"));
        assert!(!cfg.is_safe("!analyze -v"));
        assert!(!cfg.is_safe("version; rm -rf /"));
        assert!(!cfg.is_safe("not_on_list"));
    }

    #[test]
    fn load_missing_path_falls_back_to_defaults() {
        let cfg = Config::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(cfg.session.max_concurrent_sessions, 1000);
    }

    #[test]
    fn load_parses_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nmax_concurrent_sessions = 5\n").unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.session.max_concurrent_sessions, 5);
        assert_eq!(cfg.command.default_timeout_secs, 600);
    }
}
