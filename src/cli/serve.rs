//! The stdio bridge: `scry serve`.
//!
//! Reads `{id, method, params}` lines from stdin, relays them to the backend
//! over the control channel (spawning the backend if nobody is listening),
//! and writes `{id, result}` / `{id, error}` lines to stdout. The external
//! caller's ids are preserved; the control channel exchange uses the
//! client's own correlation ids underneath.
//!
//! Diagnostics go to a fixed file in the OS temp directory; every logging
//! failure is swallowed: the bridge must keep relaying no matter what.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use crate::bridge::auto_start::ensure_backend;
use crate::bridge::client::BridgeClient;
use crate::bridge::protocol::{Request, Response, decode_line, salvage_id, write_frame};
use crate::config::BridgeConfig;
use crate::error::{Result, ScryError};

pub async fn serve(config: BridgeConfig) -> Result<()> {
    let _guard = init_diagnostic_logging(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scry serve starting");

    let mut client = ensure_backend(&config).await?;
    tracing::info!(addr = %config.control_addr(), "Connected to backend");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = stdin.next_line().await? {
        let request = match decode_line::<Request>(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed inbound frame");
                if let Some(id) = salvage_id(&line) {
                    let response = Response::err(id, format!("Malformed request: {e}"));
                    write_frame(&mut stdout, &response).await?;
                }
                continue;
            }
        };

        let response = relay(&config, &mut client, &request).await;
        write_frame(&mut stdout, &response).await?;
    }

    tracing::info!("stdin closed, scry serve exiting");
    Ok(())
}

/// Relay one request, reconnecting (and respawning if needed) once when the
/// backend connection has gone away under us.
async fn relay(config: &BridgeConfig, client: &mut BridgeClient, request: &Request) -> Response {
    let first = client.send(&request.method, request.params.clone()).await;

    let result = match first {
        Err(e) if is_transport_error(&e) => {
            tracing::warn!(error = %e, "Backend connection lost, reconnecting");
            match ensure_backend(config).await {
                Ok(fresh) => {
                    *client = fresh;
                    client.send(&request.method, request.params.clone()).await
                }
                Err(reconnect) => Err(reconnect),
            }
        }
        other => other,
    };

    match result {
        Ok(value) => Response::ok(&request.id, value),
        Err(e) => Response::err(&request.id, e.to_string()),
    }
}

fn is_transport_error(error: &ScryError) -> bool {
    matches!(
        error,
        ScryError::BackendConnection(_) | ScryError::BackendProtocol(_)
    )
}

/// Best-effort tracing setup writing to the temp-directory diagnostic file.
/// Returns `None` (and stays silent) when anything about it fails.
fn init_diagnostic_logging(config: &BridgeConfig) -> Option<WorkerGuard> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.wrapper_log_path())
        .ok()?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .ok()?;
    Some(guard)
}
