//! Entry point for the dbgmux MCP server.
//!
//! Loads config, initializes file-based logging (stdout is reserved for MCP
//! JSON-RPC traffic), then serves over the transport selected on the
//! command line.

use anyhow::Result;
use dbgmux::cli::{Cli, Mode};
use dbgmux::config::Config;
use dbgmux::server::DbgmuxServer;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Arc::new(Config::load(cli.config.as_deref())?);
    let _log_guard = dbgmux::logging::init(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cli.mode,
        "starting dbgmux MCP server"
    );

    match cli.mode {
        Mode::Stdio => run_stdio(config).await,
        Mode::Http | Mode::Service => run_http(config, &cli.listen).await,
    }
}

async fn run_stdio(config: Arc<Config>) -> Result<()> {
    let server = DbgmuxServer::new(config);
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    tracing::info!("dbgmux server shut down");
    Ok(())
}

async fn run_http(config: Arc<Config>, listen: &str) -> Result<()> {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let shutdown_timeout = config.shutdown.service_shutdown_timeout();
    let service = StreamableHttpService::new(
        move || Ok(DbgmuxServer::new(config.clone())),
        Arc::new(LocalSessionManager::default()),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "dbgmux listening over streamable HTTP");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!(
                timeout_secs = shutdown_timeout.as_secs(),
                "shutdown signal received, draining"
            );
        })
        .await?;

    tracing::info!("dbgmux server shut down");
    Ok(())
}
