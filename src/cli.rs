//! Command-line entry point: picks a transport and config file before any
//! session or debugger-process machinery spins up.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Serve MCP over stdio (the default -- one client per process).
    Stdio,
    /// Serve MCP over a streamable HTTP endpoint.
    Http,
    /// Serve MCP over HTTP and stay resident as a long-running service.
    Service,
}

#[derive(Debug, Parser)]
#[command(name = "dbgmux", version, about = "MCP server multiplexing debugger sessions over crash dumps")]
pub struct Cli {
    #[arg(value_enum, long, default_value = "stdio")]
    pub mode: Mode,

    /// Path to a TOML config file. Falls back to built-in defaults if omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address for --mode http/service.
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub listen: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
