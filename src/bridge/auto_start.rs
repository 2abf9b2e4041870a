//! Backend auto-start for wrapper processes.
//!
//! [`ensure_backend`] guarantees a live control channel connection: try a
//! direct connect first, and when nobody answers, spawn `scryd` as a
//! detached child and retry with capped exponential backoff.
//!
//! A spawned backend that exits with status 0 before ever accepting a
//! connection lost the instance lock to an incumbent: the lock module
//! guarantees a contended daemon exits 0 before binding. That outcome is
//! [`ScryError::AlreadyRunning`], which maps to exit code 0: the wrapper
//! must not report it as a failure.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::time::sleep;

use crate::bridge::client::BridgeClient;
use crate::config::BridgeConfig;
use crate::error::{Result, ScryError};

/// Ensure a backend is reachable, spawning one if necessary, and return a
/// connected client.
pub async fn ensure_backend(config: &BridgeConfig) -> Result<BridgeClient> {
    // The common case: a backend is already serving the control port.
    if let Ok(client) = BridgeClient::connect(config).await {
        return Ok(client);
    }

    tracing::info!(addr = %config.control_addr(), "Backend unreachable, spawning scryd");
    let mut child = spawn_backend(config)?;
    let mut lock_contended = false;

    for attempt in 0..config.connect_attempts {
        sleep(backoff_delay(config, attempt)).await;

        // A child that exited tells us how to proceed: status 0 means an
        // incumbent owns the lock (keep connecting to it); anything else is
        // a startup failure worth surfacing.
        if !lock_contended
            && let Ok(Some(status)) = child.try_wait()
        {
            if status.success() {
                tracing::info!("Spawned backend exited 0: another instance owns the lock");
                lock_contended = true;
            } else {
                return Err(ScryError::BackendConnection(format!(
                    "Backend exited during startup with {status}; check the daemon log in {}",
                    config.runtime_dir.display()
                )));
            }
        }

        if let Ok(client) = BridgeClient::connect(config).await {
            return Ok(client);
        }
    }

    if lock_contended {
        // An incumbent exists but never became reachable within the budget.
        // Still not an error by contract: the wrapper exits 0.
        return Err(ScryError::AlreadyRunning);
    }

    Err(ScryError::BackendConnection(format!(
        "Backend did not become reachable at {} after {} attempts",
        config.control_addr(),
        config.connect_attempts
    )))
}

/// Check whether a backend currently answers the control port.
pub async fn is_backend_running(config: &BridgeConfig) -> bool {
    BridgeClient::connect(config).await.is_ok()
}

/// Delay before connection attempt `attempt`: base doubled per attempt,
/// capped at the configured ceiling.
fn backoff_delay(config: &BridgeConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .connect_base_delay
        .saturating_mul(factor)
        .min(config.connect_max_delay)
}

/// Locate the `scryd` binary: next to the current executable, with a parent-
/// directory fallback for test binaries living in `target/debug/deps`.
fn find_backend_binary() -> Result<PathBuf> {
    let current_exe = std::env::current_exe()?;
    let file_name = if cfg!(windows) { "scryd.exe" } else { "scryd" };

    let sibling = current_exe.with_file_name(file_name);
    if sibling.exists() {
        return Ok(sibling);
    }

    if let Some(parent) = current_exe.parent().and_then(|dir| dir.parent()) {
        let candidate = parent.join(file_name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ScryError::BackendConnection(format!(
        "Backend binary '{file_name}' not found next to {}",
        current_exe.display()
    )))
}

/// Spawn the backend detached, stdio to null: it does its own file logging.
/// The effective configuration travels explicitly through `SCRY_*` variables
/// so the child resolves the same addresses the wrapper will retry against.
#[cfg(unix)]
fn spawn_backend(config: &BridgeConfig) -> Result<Child> {
    use std::os::unix::process::CommandExt;

    let backend_path = find_backend_binary()?;
    std::fs::create_dir_all(&config.runtime_dir)?;

    let child = Command::new(&backend_path)
        .env("SCRY_HOME", &config.runtime_dir)
        .env("SCRY_CONTROL_PORT", config.control_port.to_string())
        .env("SCRY_GATEWAY_PORT", config.gateway_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    Ok(child)
}

#[cfg(windows)]
fn spawn_backend(config: &BridgeConfig) -> Result<Child> {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x00000008;
    const CREATE_NO_WINDOW: u32 = 0x08000000;

    let backend_path = find_backend_binary()?;
    std::fs::create_dir_all(&config.runtime_dir)?;

    let child = Command::new(&backend_path)
        .env("SCRY_HOME", &config.runtime_dir)
        .env("SCRY_CONTROL_PORT", config.control_port.to_string())
        .env("SCRY_GATEWAY_PORT", config.gateway_port.to_string())
        .creation_flags(DETACHED_PROCESS | CREATE_NO_WINDOW)
        .spawn()?;
    Ok(child)
}
