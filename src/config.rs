//! Bridge configuration and well-known paths.
//!
//! Everything that varies between installations lives in [`BridgeConfig`],
//! which is constructed once per process and passed down explicitly. The
//! resolution order is: built-in defaults, then `~/.scry/config.toml`, then
//! `SCRY_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ScryError};

/// Loopback host both listeners bind to. The bridge is local-only.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Default TCP port for the control channel (wrapper ↔ backend).
pub const DEFAULT_CONTROL_PORT: u16 = 31414;

/// Default TCP port for the gateway listener (tabletop module ↔ backend).
pub const DEFAULT_GATEWAY_PORT: u16 = 31415;

/// Runtime configuration shared by the wrapper and the backend.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding the lock marker, config file, and daemon logs.
    pub runtime_dir: PathBuf,
    /// Control channel port on the loopback interface.
    pub control_port: u16,
    /// Gateway listener port on the loopback interface.
    pub gateway_port: u16,
    /// Timeout for a single correlated gateway query.
    pub query_timeout: Duration,
    /// Connection attempts the wrapper makes after spawning the backend.
    pub connect_attempts: u32,
    /// First retry delay; doubles per attempt up to `connect_max_delay`.
    pub connect_base_delay: Duration,
    pub connect_max_delay: Duration,
    /// Job queue tuning.
    pub jobs: JobConfig,
}

/// Job queue tuning knobs.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Failures allowed before a job becomes terminally failed.
    pub max_attempts: u32,
    /// Age at which an unfinished or finished job is evicted.
    pub ttl: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// On-disk shape of `config.toml`. Every field is optional; missing fields
/// fall through to the defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    control_port: Option<u16>,
    gateway_port: Option<u16>,
    query_timeout_ms: Option<u64>,
    job_max_attempts: Option<u32>,
    job_ttl_secs: Option<u64>,
    job_sweep_interval_secs: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            control_port: DEFAULT_CONTROL_PORT,
            gateway_port: DEFAULT_GATEWAY_PORT,
            query_timeout: Duration::from_secs(10),
            connect_attempts: 10,
            connect_base_delay: Duration::from_millis(100),
            connect_max_delay: Duration::from_secs(2),
            jobs: JobConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load the effective configuration: defaults, config file, environment.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(home) = std::env::var("SCRY_HOME") {
            config.runtime_dir = PathBuf::from(home);
        }

        config.apply_file()?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self) -> Result<()> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&path)?;
        let file: ConfigFile = toml::from_str(&content)?;

        if let Some(port) = file.control_port {
            self.control_port = port;
        }
        if let Some(port) = file.gateway_port {
            self.gateway_port = port;
        }
        if let Some(ms) = file.query_timeout_ms {
            self.query_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = file.job_max_attempts {
            self.jobs.max_attempts = n;
        }
        if let Some(secs) = file.job_ttl_secs {
            self.jobs.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = file.job_sweep_interval_secs {
            self.jobs.sweep_interval = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_u16("SCRY_CONTROL_PORT")? {
            self.control_port = port;
        }
        if let Some(port) = env_u16("SCRY_GATEWAY_PORT")? {
            self.gateway_port = port;
        }
        Ok(())
    }

    /// `host:port` address of the control channel.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", LOOPBACK_HOST, self.control_port)
    }

    /// `host:port` address of the gateway listener.
    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", LOOPBACK_HOST, self.gateway_port)
    }

    /// Path to the instance lock marker (`<runtime_dir>/scryd.lock`).
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join("scryd.lock")
    }

    /// Path to the optional config file (`<runtime_dir>/config.toml`).
    pub fn config_path(&self) -> PathBuf {
        self.runtime_dir.join("config.toml")
    }

    /// Fixed temp-directory file the wrapper appends diagnostics to.
    pub fn wrapper_log_path(&self) -> PathBuf {
        std::env::temp_dir().join("scry-bridge.log")
    }
}

/// Default runtime directory (`~/.scry`), falling back to the temp dir when
/// no home directory can be determined (containers, stripped environments).
fn default_runtime_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".scry"))
        .unwrap_or_else(|| std::env::temp_dir().join("scry"))
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| ScryError::Config(format!("{name} must be a port number, got {value:?}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_distinct() {
        let config = BridgeConfig::default();
        assert_ne!(config.control_port, config.gateway_port);
    }

    #[test]
    fn lock_path_lives_in_runtime_dir() {
        let mut config = BridgeConfig::default();
        config.runtime_dir = PathBuf::from("/tmp/scry-test");
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/scry-test/scryd.lock"));
    }

    #[test]
    fn config_file_overrides_ports() {
        let file: ConfigFile = toml::from_str("control_port = 4000\ngateway_port = 4001\n").unwrap();
        assert_eq!(file.control_port, Some(4000));
        assert_eq!(file.gateway_port, Some(4001));
    }

    #[test]
    fn config_file_tolerates_unknown_and_missing_fields() {
        let file: ConfigFile = toml::from_str("").unwrap();
        assert!(file.control_port.is_none());

        let file: ConfigFile = toml::from_str("job_ttl_secs = 120\nfuture_knob = true\n").unwrap();
        assert_eq!(file.job_ttl_secs, Some(120));
    }
}
