//! Server entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgevoice_server::bootstrap::{canonical_graph, execute_graph, BootstrapState};
use edgevoice_server::{create_router, AppState};

/// Socket drain budget after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Flush budget for pools, auth and observability after drain.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct CliArgs {
    config_dir: String,
}

fn parse_args() -> CliArgs {
    let mut config_dir = "config".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    config_dir = path;
                }
            }
            "-h" | "--help" => {
                eprintln!("usage: edgevoice [--config <dir>]");
                std::process::exit(0);
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    config_dir = path.to_string();
                } else {
                    eprintln!("unknown argument: {other}");
                    std::process::exit(2);
                }
            }
        }
    }
    CliArgs { config_dir }
}

#[tokio::main]
async fn main() {
    let args = parse_args();
    if let Err(e) = run(args).await {
        // Logging may not be up yet when bootstrap fails early.
        eprintln!("fatal: {e}");
        tracing::error!(error = %e, "server exiting");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var("EDGEVOICE_ENV").ok();
    let mut bootstrap = BootstrapState::new(&args.config_dir, env);
    if let Ok(db_path) = std::env::var("EDGEVOICE_DB") {
        bootstrap.db_path = db_path;
    }

    let order = execute_graph(canonical_graph(), &mut bootstrap).await?;
    tracing::info!(steps = order.len(), "bootstrap complete");

    let settings = bootstrap.settings.take().expect("settings after bootstrap");
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;

    let sessions = AppState::session_manager_from(&settings);
    let session_cleanup = sessions.start_cleanup_task();

    let auth = bootstrap.auth.take().expect("auth after bootstrap");
    let providers = bootstrap.providers.take().expect("providers after bootstrap");

    let state = AppState {
        settings: Arc::new(parking_lot::RwLock::new(settings)),
        bus: bootstrap.bus.take().expect("bus after bootstrap"),
        auth: auth.clone(),
        device_registry: bootstrap
            .device_registry
            .take()
            .expect("registry after bootstrap"),
        providers: providers.clone(),
        sessions,
        tools: bootstrap.tools.take().expect("tools after bootstrap"),
    };

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    // Graceful shutdown: drain sockets for at most DRAIN_TIMEOUT after the
    // signal, then flush the rest of the stack under FLUSH_TIMEOUT.
    let notify = Arc::new(tokio::sync::Notify::new());
    {
        let notify = notify.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            notify.notify_waiters();
        });
    }

    let graceful = {
        let notify = notify.clone();
        async move { notify.notified().await }
    };
    let drain_watchdog = {
        let notify = notify.clone();
        async move {
            notify.notified().await;
            tokio::time::sleep(DRAIN_TIMEOUT).await;
        }
    };

    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(graceful) => result?,
        _ = drain_watchdog => {
            tracing::warn!("socket drain budget exhausted, forcing shutdown");
        }
    }

    let _ = session_cleanup.send(true);
    let flush = async {
        providers.close_all().await;
        if let Err(e) = auth.close().await {
            tracing::warn!(error = %e, "auth close failed");
        }
    };
    if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
        tracing::warn!("flush budget exhausted");
    }

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
