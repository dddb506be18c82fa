//! Configuration management
//!
//! Handles loading and validating server configuration from TOML files, plus
//! the environment variable overrides for liveness/readiness delays and the
//! log base directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub forward: ForwardConfig,
    #[serde(default)]
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

/// Control-plane server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the control HTTP server binds to.
    pub control_bind_addr: SocketAddr,
    /// Path to the alias -> target mapping file.
    pub mapping_path: PathBuf,
    /// Script invoked by `/rotateLogs`.
    #[serde(default)]
    pub rotate_script_path: Option<PathBuf>,
    /// Reported verbatim by `/versionz`.
    #[serde(default = "default_version")]
    pub version: String,
}

/// Default forwarding behavior for connection pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    /// `"lazy"`, `"splice"`, or `"zerosend"`; unrecognized values fall back
    /// to splice, same as `Mode::parse`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Liveness/readiness gate configuration, overridable by environment.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    #[serde(default)]
    pub manual_ready: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"json"` or `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_mode() -> String {
    "splice".to_string()
}
fn default_buf_size() -> usize {
    16 * 1024
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

/// Default liveness delay (5s), overridable by `WAIT_LIVENESS_TIME`.
const DEFAULT_LIVENESS_SECS: u64 = 5;
/// Default readiness delay (15s), overridable by `WAIT_READINESS_TIME`.
const DEFAULT_READINESS_SECS: u64 = 15;

impl Config {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&contents).with_context(|| "failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.forward.buf_size == 0 {
            anyhow::bail!("forward.buf_size must be > 0");
        }
        if self.forward.timeout_ms == 0 {
            anyhow::bail!("forward.timeout_ms must be > 0");
        }
        Ok(())
    }

    /// `WAIT_LIVENESS_TIME` env var, falling back to the 5s default.
    pub fn liveness_delay(&self) -> Duration {
        env_seconds("WAIT_LIVENESS_TIME").unwrap_or(Duration::from_secs(DEFAULT_LIVENESS_SECS))
    }

    /// `WAIT_READINESS_TIME` env var, falling back to the 15s default.
    pub fn readiness_delay(&self) -> Duration {
        env_seconds("WAIT_READINESS_TIME").unwrap_or(Duration::from_secs(DEFAULT_READINESS_SECS))
    }

    /// `$PROXY/logs`, the directory log files are appended under. `None`
    /// when `PROXY` isn't set, in which case the caller logs to stdout only.
    pub fn log_dir(&self) -> Option<PathBuf> {
        std::env::var_os("PROXY").map(|base| PathBuf::from(base).join("logs"))
    }
}

fn env_seconds(name: &str) -> Option<Duration> {
    std::env::var(name).ok()?.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_buf_size() {
        let cfg = Config {
            server: ServerConfig {
                control_bind_addr: "127.0.0.1:9090".parse().unwrap(),
                mapping_path: PathBuf::from("mapping.toml"),
                rotate_script_path: None,
                version: "test".to_string(),
            },
            forward: ForwardConfig { mode: "splice".to_string(), buf_size: 0, timeout_ms: 1000 },
            control: ControlConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: "json".to_string() },
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn liveness_delay_falls_back_to_five_seconds_when_unset() {
        std::env::remove_var("WAIT_LIVENESS_TIME");
        let cfg = Config {
            server: ServerConfig {
                control_bind_addr: "127.0.0.1:9090".parse().unwrap(),
                mapping_path: PathBuf::from("mapping.toml"),
                rotate_script_path: None,
                version: "test".to_string(),
            },
            forward: ForwardConfig { mode: "splice".to_string(), buf_size: 1024, timeout_ms: 1000 },
            control: ControlConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: "json".to_string() },
        };
        assert_eq!(cfg.liveness_delay(), Duration::from_secs(5));
    }
}
