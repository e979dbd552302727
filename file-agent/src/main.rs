//! File Agent - Main entry point
//!
//! Serves the project file API and the change event stream.

use anyhow::Result;
use clap::Parser;
use file_agent::{
    api,
    config::Config,
    daemon::{shutdown::ShutdownCoordinator, sweeper},
    service::{CommandProcessControl, FileMutationService},
    utils, ws,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if let Some(port) = args.port {
        config.agent.port = port;
    }

    utils::logger::init(&config.log)?;
    api::health::init_start_time();

    tracing::info!(
        "Starting file-agent v{} (agent_id: {}, {} project(s))",
        env!("CARGO_PKG_VERSION"),
        config.agent.id,
        config.projects.len()
    );

    let config = Arc::new(config);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.agent.port));
    let shutdown = ShutdownCoordinator::new();

    let ws_state = ws::WsState::new();
    let process = Arc::new(CommandProcessControl::new(config.clone()));
    let service = FileMutationService::new(config.clone(), Arc::new(ws_state.clone()), process);

    let sweeper_handle = sweeper::start_session_sweeper(
        service.clone(),
        Duration::from_secs(config.files.sweep_interval_secs.max(1)),
        shutdown.token(),
    );

    let app = api::create_router(api::AppState::new(service.clone(), ws_state));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let token = shutdown.token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    });

    shutdown.wait_for_signal().await;

    if service.open_backups() > 0 {
        tracing::warn!(
            "{} backup(s) still open, waiting for in-flight mutations",
            service.open_backups()
        );
    }

    shutdown
        .drain(Duration::from_secs(10), async {
            let _ = sweeper_handle.await;
            match server_handle.await {
                Ok(Ok(())) => tracing::info!("Server shutdown complete"),
                Ok(Err(e)) => tracing::error!("Server error during shutdown: {}", e),
                Err(e) => tracing::error!("Server task panicked: {}", e),
            }
        })
        .await;

    Ok(())
}
