use std::net::SocketAddr;
use std::time::Duration;

use canvas_authz::AuthzConfig;
use canvas_cache::{CacheConfig, MonitorConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cache tiers and the distributed-tier breaker
    #[serde(default)]
    pub cache: CacheConfig,
    /// Evaluator rules and verdict TTLs
    #[serde(default)]
    pub authz: AuthzConfig,
    /// Performance monitor thresholds
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.maintenance_interval_ms == 0 {
            return Err("server.maintenance_interval_ms must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        self.cache
            .validate()
            .map_err(|e| format!("cache config error: {e}"))?;
        self.authz
            .validate()
            .map_err(|e| format!("authz config error: {e}"))?;
        self.monitor
            .validate()
            .map_err(|e| format!("monitor config error: {e}"))?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.server.maintenance_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often expired local entries are purged.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_maintenance_interval_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File, Map};
    use std::path::PathBuf;

    /// File used when neither `--config` nor `CANVAS_CONFIG` names one.
    pub const DEFAULT_CONFIG_PATH: &str = "canvas.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        load_config_with_env(path, None)
    }

    /// Like [`load_config`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_config_with_env(
        path: Option<&str>,
        env: Option<Map<String, String>>,
    ) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., CANVAS__CACHE__L1_MAX_ENTRIES=500
        builder = builder.add_source(
            Environment::with_prefix("CANVAS")
                .try_parsing(true)
                .separator("__")
                .source(env),
        );
        let merged: AppConfig = builder.build()?.try_deserialize()?;
        merged.validate().map_err(ConfigError::Invalid)?;
        Ok(merged)
    }
}
