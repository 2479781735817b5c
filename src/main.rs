//! ritual-bench CLI entry point.
//!
//! Initializes logging, wires interrupt signals to the shutdown flag and
//! delegates to the CLI module for command handling.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments first to get log_level
    let cli = ritual_bench::cli::parse_cli();

    // Priority: RUST_LOG env var > --verbose / --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_filter());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let (tx, rx) = watch::channel(false);
    spawn_signal_listeners(Arc::new(tx));

    ritual_bench::cli::run_with_cli(cli, rx).await
}

/// Flips the shutdown flag on Ctrl-C, and on SIGTERM where available.
fn spawn_signal_listeners(shutdown: Arc<watch::Sender<bool>>) {
    let on_sigint = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), cleaning up...");
            on_sigint.send_replace(true);
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let on_sigterm = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    warn!("SIGTERM received, cleaning up...");
                    on_sigterm.send_replace(true);
                }
                Err(e) => warn!("Failed to register SIGTERM handler: {}", e),
            }
        });
    }
}
