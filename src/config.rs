use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path};

use crate::cache::TOTAL_VISITS_KEY;
use crate::coordinator::{CachePolicy, PolicyKind};
use crate::helper::{env_get_var, parse_var};

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "redis_url_default")]
    pub redis_url: String,
    #[serde(default = "port_default")]
    pub port: u16,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default)]
    pub cache_policy: PolicyKind,
    #[serde(default = "cache_ttl_secs_default")]
    pub cache_ttl_secs: u64,
    #[serde(default = "io_timeout_ms_default")]
    pub io_timeout_ms: u64,
    #[serde(default = "cache_key_default")]
    pub cache_key: String,
}

impl Config {
    fn get_config_dir() -> Option<path::PathBuf> {
        let config_dir = if let Some(xdg_path) = env_get_var("XDG_CONFIG_HOME") {
            path::PathBuf::from(xdg_path)
        } else {
            path::Path::new(&env_get_var("HOME")?).join(".config")
        };

        Some(config_dir.join("visit_counter"))
    }

    /// Read the TOML file named by `$VISIT_COUNTER_CFG_PATH`, or the one in the
    /// config directory if it exists. Otherwise build from the environment.
    pub fn load() -> anyhow::Result<Self> {
        if let Some(cfg_path) = env_get_var("VISIT_COUNTER_CFG_PATH") {
            return Self::from_path(cfg_path);
        }

        if let Some(file_path) = Self::get_config_dir().map(|dir| dir.join("config.toml")) {
            if file_path.exists() {
                return Self::from_path(file_path);
            }
        }

        Self::from_env()
    }

    pub fn from_path(file_path: impl AsRef<path::Path>) -> anyhow::Result<Self> {
        let file_path = file_path.as_ref();
        if !file_path.exists() {
            anyhow::bail!("Config file not found in {file_path:?}");
        }
        let content = fs::read_to_string(file_path).with_context(|| "fail to read config file")?;

        toml::from_str(&content).with_context(|| "fail to parse config from toml")
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_get_var)
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = get("DATABASE_URL")
            .with_context(|| "$DATABASE_URL not set, there is no fallback for the visit log")?;

        Ok(Self {
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(redis_url_default),
            port: match get("PORT") {
                Some(raw) => parse_var("PORT", &raw)?,
                None => port_default(),
            },
            log_level: get("LOG_LEVEL").unwrap_or_else(log_level_default),
            cache_policy: match get("CACHE_POLICY") {
                Some(raw) => parse_var("CACHE_POLICY", &raw)?,
                None => PolicyKind::default(),
            },
            cache_ttl_secs: match get("CACHE_TTL_SECS") {
                Some(raw) => parse_var("CACHE_TTL_SECS", &raw)?,
                None => cache_ttl_secs_default(),
            },
            io_timeout_ms: match get("IO_TIMEOUT_MS") {
                Some(raw) => parse_var("IO_TIMEOUT_MS", &raw)?,
                None => io_timeout_ms_default(),
            },
            cache_key: get("CACHE_KEY").unwrap_or_else(cache_key_default),
        })
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy.with_ttl(Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn tracing_level(&self) -> anyhow::Result<tracing::Level> {
        parse_var("LOG_LEVEL", &self.log_level)
    }
}

fn redis_url_default() -> String {
    "redis://localhost:6379".to_string()
}

fn port_default() -> u16 {
    8000
}

fn log_level_default() -> String {
    "INFO".to_string()
}

fn cache_ttl_secs_default() -> u64 {
    600
}

fn io_timeout_ms_default() -> u64 {
    2000
}

fn cache_key_default() -> String {
    TOTAL_VISITS_KEY.to_string()
}
