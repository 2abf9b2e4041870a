//! scry backend daemon.
//!
//! The scryd binary is the singleton long-lived process that:
//! - Holds the instance lock (one backend per host)
//! - Serves the control channel for wrapper processes
//! - Owns the gateway connection to the tabletop module
//! - Tracks map-generation jobs and sweeps expired ones
//!
//! It is normally spawned on demand by `scry`; manual start is just `scryd`.
//! A second copy finding the lock held exits with status 0 before binding
//! anything: wrappers rely on that to distinguish contention from failure.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::select;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;

use scry::bridge::server::{ControlContext, ControlServer, handle_connection};
use scry::config::BridgeConfig;
use scry::error::exit_codes;
use scry::gateway::connector::Connector;
use scry::gateway::events::{JobEventRouter, SceneCompletionSink};
use scry::jobs::JobQueue;
use scry::lock::InstanceLock;
use scry::tools::jobs::job_tool_registry;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match BridgeConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(exit_codes::STARTUP as u8);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.runtime_dir) {
        eprintln!("Error: cannot create {}: {e}", config.runtime_dir.display());
        return ExitCode::from(exit_codes::STARTUP as u8);
    }

    let _guard = match init_logging(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: logging setup failed: {e}");
            return ExitCode::from(exit_codes::STARTUP as u8);
        }
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scryd starting");

    // Singleton enforcement happens before any port is bound, so a contended
    // daemon can exit 0 without ever accepting a connection.
    let mut lock = match InstanceLock::acquire(config.lock_path()) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::info!("Another scryd instance owns the lock, exiting");
            return ExitCode::from(exit_codes::SUCCESS as u8);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to acquire instance lock");
            return ExitCode::from(exit_codes::STARTUP as u8);
        }
    };

    let code = match run(&config).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "scryd failed");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };

    lock.release();
    ExitCode::from(code as u8)
}

async fn run(config: &BridgeConfig) -> scry::Result<()> {
    // Wiring: the connector feeds job events into the queue, and completed
    // jobs flow back out through the connector as scene creation.
    let connector = Arc::new(Connector::new(config.query_timeout));
    let queue = Arc::new(
        JobQueue::new(config.jobs.clone())
            .with_sink(Arc::new(SceneCompletionSink::new(connector.clone()))),
    );
    connector.set_event_handler(Arc::new(JobEventRouter::new(queue.clone())));
    connector.start(&config.gateway_addr()).await?;

    let registry = job_tool_registry(queue.clone())?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ControlContext {
        registry,
        queue: queue.clone(),
        connector: connector.clone(),
        shutdown: shutdown_tx,
    });

    let server = ControlServer::bind(&config.control_addr()).await?;

    #[cfg(unix)]
    let mut sigterm = signal(SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sigint = signal(SignalKind::interrupt())?;

    let mut sweep = tokio::time::interval(config.jobs.sweep_interval);
    // Skip the immediate first tick.
    sweep.tick().await;

    #[cfg(unix)]
    loop {
        select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Shutdown requested over control channel");
                    break;
                }
            }
            _ = sweep.tick() => {
                let evicted = queue.sweep_expired().await;
                if evicted > 0 {
                    tracing::info!(evicted, "Job sweep evicted expired jobs");
                }
            }
            result = server.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Control client connected");
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx).await {
                                tracing::debug!(error = %e, "Control connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Control accept error");
                    }
                }
            }
        }
    }

    #[cfg(windows)]
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Shutdown requested over control channel");
                    break;
                }
            }
            _ = sweep.tick() => {
                let evicted = queue.sweep_expired().await;
                if evicted > 0 {
                    tracing::info!(evicted, "Job sweep evicted expired jobs");
                }
            }
            result = server.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Control client connected");
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, ctx).await {
                                tracing::debug!(error = %e, "Control connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Control accept error");
                    }
                }
            }
        }
    }

    connector.stop().await;
    tracing::info!("scryd shutdown complete");
    Ok(())
}

/// File logging with daily rotation in the runtime directory. The returned
/// guard must stay alive so buffered lines are flushed on exit.
fn init_logging(config: &BridgeConfig) -> anyhow::Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(&config.runtime_dir, "scryd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    Ok(guard)
}
