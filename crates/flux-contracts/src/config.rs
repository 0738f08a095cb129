use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogLevel;
use crate::redact::redact_secret;

pub const DEFAULT_API_BASE: &str = "https://api.bfl.ai/v1";
pub const LOCAL_CONFIG_FILE: &str = ".flux-rs.toml";
pub const API_KEY_ENV_VARS: [&str; 2] = ["BFL_API_KEY", "FLUX_API_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no API key found; pass --api-key, set BFL_API_KEY, or add api_key to .flux-rs.toml")]
    MissingApiKey,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Contents of a `flux-rs` TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub environment: Option<String>,
    pub log_level: Option<String>,
    pub timeout_s: Option<f64>,
    pub poll_interval_s: Option<f64>,
    pub max_retries: Option<u32>,
    pub request_timeout_s: Option<f64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = toml::from_str::<FileConfig>(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(parsed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_name(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Self::Production
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeySource {
    Explicit,
    Environment(&'static str),
    LocalConfig,
    GlobalConfig,
}

impl fmt::Display for ApiKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("--api-key"),
            Self::Environment(name) => f.write_str(name),
            Self::LocalConfig => f.write_str("local config"),
            Self::GlobalConfig => f.write_str("global config"),
        }
    }
}

/// A credential plus where it came from. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    value: String,
    source: ApiKeySource,
}

impl ApiKey {
    pub fn new(value: impl Into<String>, source: ApiKeySource) -> Self {
        Self {
            value: value.into().trim().to_string(),
            source,
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn source(&self) -> ApiKeySource {
        self.source
    }

    pub fn redacted(&self) -> String {
        redact_secret(&self.value)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &self.redacted())
            .field("source", &self.source)
            .finish()
    }
}

/// Local and global config files, local taking precedence.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    pub local: Option<FileConfig>,
    pub global: Option<FileConfig>,
}

impl LayeredConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        let global = global_config_path();
        Self::load_from(Path::new(LOCAL_CONFIG_FILE), global.as_deref())
    }

    pub fn load_from(local: &Path, global: Option<&Path>) -> Result<Self, ConfigError> {
        let local = FileConfig::load(local)?;
        let global = match global {
            Some(path) => FileConfig::load(path)?,
            None => None,
        };
        Ok(Self { local, global })
    }

    /// Explicit value, then `BFL_API_KEY`/`FLUX_API_KEY`, then the local
    /// file, then the global file.
    pub fn resolve_api_key(
        &self,
        explicit: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ApiKey, ConfigError> {
        if let Some(value) = non_empty(explicit) {
            return Ok(ApiKey::new(value, ApiKeySource::Explicit));
        }
        for name in API_KEY_ENV_VARS {
            let value = env(name);
            if let Some(value) = non_empty(value.as_deref()) {
                return Ok(ApiKey::new(value, ApiKeySource::Environment(name)));
            }
        }
        if let Some(value) = self.local.as_ref().and_then(|cfg| non_empty(cfg.api_key.as_deref())) {
            return Ok(ApiKey::new(value, ApiKeySource::LocalConfig));
        }
        if let Some(value) = self
            .global
            .as_ref()
            .and_then(|cfg| non_empty(cfg.api_key.as_deref()))
        {
            return Ok(ApiKey::new(value, ApiKeySource::GlobalConfig));
        }
        Err(ConfigError::MissingApiKey)
    }

    pub fn api_base(&self, env: impl Fn(&str) -> Option<String>) -> String {
        env("FLUX_API_BASE")
            .or_else(|| self.pick(|cfg| cfg.api_base.clone()))
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    pub fn environment(&self, env: impl Fn(&str) -> Option<String>) -> Environment {
        env("FLUX_ENV")
            .or_else(|| self.pick(|cfg| cfg.environment.clone()))
            .map(|value| Environment::from_name(&value))
            .unwrap_or(Environment::Development)
    }

    pub fn log_level(&self) -> Result<Option<LogLevel>, ConfigError> {
        let Some(raw) = self.pick(|cfg| cfg.log_level.clone()) else {
            return Ok(None);
        };
        raw.parse::<LogLevel>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: "log_level",
                value: raw,
            })
    }

    pub fn timeout_s(&self) -> Option<f64> {
        self.pick(|cfg| cfg.timeout_s)
    }

    pub fn poll_interval_s(&self) -> Option<f64> {
        self.pick(|cfg| cfg.poll_interval_s)
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.pick(|cfg| cfg.max_retries)
    }

    pub fn request_timeout_s(&self) -> Option<f64> {
        self.pick(|cfg| cfg.request_timeout_s)
    }

    fn pick<T>(&self, field: impl Fn(&FileConfig) -> Option<T>) -> Option<T> {
        self.local
            .as_ref()
            .and_then(&field)
            .or_else(|| self.global.as_ref().and_then(&field))
    }
}

pub fn global_config_path() -> Option<PathBuf> {
    let home = non_empty_env("HOME").or_else(|| non_empty_env("USERPROFILE"))?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("flux-rs")
            .join("config.toml"),
    )
}

pub fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
