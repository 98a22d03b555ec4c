use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Context as _, bail};
use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 8000;
pub const DEFAULT_BACKEND_HOST: &str = "localhost";
pub const DEFAULT_BACKEND_PORT: u16 = 6379;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads the optional config file; a missing path yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Applies CLI/env overrides on top of the file values, then re-validates.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> anyhow::Result<()> {
        if let Some(addr) = overrides.addr.as_deref() {
            self.server.addr = addr.to_owned();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(host) = overrides.backend_host.as_deref() {
            self.backend.host = host.to_owned();
        }
        if let Some(port) = overrides.backend_port {
            self.backend.port = port;
        }
        if let Some(password) = overrides.backend_password.as_deref() {
            self.backend.password = (!password.is_empty()).then(|| password.to_owned());
        }
        if let Some(db) = overrides.backend_db {
            self.backend.db = db;
        }
        if let Some(level) = overrides.log_level.as_deref() {
            self.logging.level = Some(level.to_owned());
        }
        self.validate()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.addr.trim().is_empty() {
            bail!("`server.addr` cannot be empty");
        }
        if self.backend.host.trim().is_empty() {
            bail!("`backend.host` cannot be empty");
        }
        if !(self.rate_limit.requests_per_second.is_finite()
            && self.rate_limit.requests_per_second > 0.0)
        {
            bail!("`rate_limit.requests_per_second` must be a positive number");
        }
        for (field, value) in [
            ("server.body_read_timeout_ms", self.server.body_read_timeout_ms),
            ("server.header_read_timeout_ms", self.server.header_read_timeout_ms),
            ("backend.operation_timeout_ms", self.backend.operation_timeout_ms),
            ("rate_limit.burst", u64::from(self.rate_limit.burst)),
            ("rate_limit.idle_ttl_secs", self.rate_limit.idle_ttl_secs),
            ("rate_limit.sweep_interval_secs", self.rate_limit.sweep_interval_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("health.timeout_ms", self.health.timeout_ms),
        ] {
            if value == 0 {
                bail!("`{field}` must be greater than zero");
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub backend_password: Option<String>,
    pub backend_db: Option<i64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub addr: String,
    pub port: u16,
    pub body_read_timeout_ms: u64,
    pub header_read_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    pub fn listen_target(&self) -> String {
        if self.addr.contains(':') && !self.addr.starts_with('[') {
            format!("[{}]:{}", self.addr, self.port)
        } else {
            format!("{}:{}", self.addr, self.port)
        }
    }

    pub fn body_read_timeout(&self) -> Duration {
        Duration::from_millis(self.body_read_timeout_ms)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_millis(self.header_read_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_LISTEN_ADDR.to_owned(),
            port: DEFAULT_LISTEN_PORT,
            body_read_timeout_ms: 10_000,
            header_read_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub operation_timeout_ms: u64,
}

impl BackendConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("db", &self.db)
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .finish()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_BACKEND_HOST.to_owned(),
            port: DEFAULT_BACKEND_PORT,
            password: None,
            db: 0,
            operation_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 5.0,
            burst: 10,
            idle_ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
