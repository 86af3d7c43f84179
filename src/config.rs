//! TOML configuration for the bandwatch daemon.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::throughput::provider::{CLOUDFLARE, IPERF3, LIBRESPEED};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BANDWATCH_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/bandwatch/bandwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `BANDWATCH_CONFIG` environment variable.
    /// 2. `/etc/bandwatch/bandwatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BANDWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path wins; otherwise fall back to [`AppConfig::load_or_default`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Check values that deserialize fine but cannot be used.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidBind {
                bind: self.server.bind.clone(),
                reason: e.to_string(),
            })?;

        if self.providers.enabled.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        for name in &self.providers.enabled {
            if ![LIBRESPEED, CLOUDFLARE, IPERF3].contains(&name.as_str()) {
                return Err(ConfigError::UnknownProvider(name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server.bind '{bind}' is not a socket address: {reason}")]
    InvalidBind { bind: String, reason: String },

    #[error("providers.enabled must list at least one provider")]
    NoProviders,

    #[error("unknown provider '{0}' in providers.enabled")]
    UnknownProvider(String),
}

// ---------------------------------------------------------------------------
// Server / storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Parent directories are created on open.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/bandwatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between schedule evaluations.
    pub tick_interval_secs: u64,
    /// Ceiling for a single provider run; the provider key is freed after it.
    pub run_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            run_timeout_secs: 120,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider names registered at startup.
    pub enabled: Vec<String>,
    pub librespeed: LibrespeedConfig,
    pub iperf3: Iperf3Config,
    pub cloudflare: CloudflareConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                LIBRESPEED.to_string(),
                CLOUDFLARE.to_string(),
                IPERF3.to_string(),
            ],
            librespeed: LibrespeedConfig::default(),
            iperf3: Iperf3Config::default(),
            cloudflare: CloudflareConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrespeedConfig {
    /// Path (or bare command name resolved via `$PATH`) to librespeed-cli.
    pub path: String,
    /// Pin a specific librespeed server id instead of auto-selection.
    pub server_id: Option<u32>,
}

impl Default for LibrespeedConfig {
    fn default() -> Self {
        Self {
            path: "librespeed-cli".to_string(),
            server_id: None,
        }
    }
}

/// Configuration for the iperf3 and ping subprocesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Iperf3Config {
    pub path: String,
    /// Seconds per direction.
    pub duration_secs: u32,
    /// Parallel streams per direction.
    pub streams: u32,
    pub ping_path: String,
    /// Echo requests sent for the latency sample. `0` skips the ping step.
    pub ping_count: u32,
}

impl Default for Iperf3Config {
    fn default() -> Self {
        Self {
            path: "iperf3".to_string(),
            duration_secs: 10,
            streams: 1,
            ping_path: "ping".to_string(),
            ping_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudflareConfig {
    pub base_url: String,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub latency_samples: u32,
}

impl Default for CloudflareConfig {
    fn default() -> Self {
        Self {
            base_url: "https://speed.cloudflare.com".to_string(),
            download_bytes: 25_000_000,
            upload_bytes: 10_000_000,
            latency_samples: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.database_path, PathBuf::from("data/bandwatch.db"));
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.run_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.providers.enabled, vec!["librespeed", "cloudflare", "iperf3"]);
        assert_eq!(cfg.providers.iperf3.path, "iperf3");
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [scheduler]
            tick_interval_secs = 15

            [providers]
            enabled = ["iperf3"]

            [providers.iperf3]
            ping_count = 0
            "#,
        )
        .unwrap();

        assert_eq!(cfg.scheduler.tick_interval_secs, 15);
        assert_eq!(cfg.scheduler.run_timeout_secs, 120);
        assert_eq!(cfg.providers.enabled, vec!["iperf3"]);
        assert_eq!(cfg.providers.iperf3.ping_count, 0);
        assert_eq!(cfg.providers.iperf3.duration_secs, 10);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let cfg = SchedulerConfig {
            tick_interval_secs: 0,
            run_timeout_secs: 0,
        };
        assert_eq!(cfg.tick_interval(), Duration::from_secs(1));
        assert_eq!(cfg.run_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandwatch.toml");
        std::fs::write(&path, "[server]\nbind = \"127.0.0.1:9000\"\n").unwrap();
        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
    }

    #[test]
    fn test_validate() {
        assert!(AppConfig::default().validate().is_ok());

        let mut cfg = AppConfig::default();
        cfg.server.bind = "localhost".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBind { .. })));

        let mut cfg = AppConfig::default();
        cfg.providers.enabled.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoProviders)));

        let mut cfg = AppConfig::default();
        cfg.providers.enabled.push("ookla".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownProvider(n)) if n == "ookla"));
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = ").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
