//! Configuration loading for agentbus.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable selecting the transport backend.
pub const ENV_BACKEND: &str = "AGENTBUS_BACKEND";
/// Environment variable overriding the Redis URL.
pub const ENV_REDIS_URL: &str = "AGENTBUS_REDIS_URL";
/// Environment variable overriding the default TTL in seconds.
pub const ENV_DEFAULT_TTL: &str = "AGENTBUS_DEFAULT_TTL";

/// Get the agentbus home directory (~/.agentbus).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentbus"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentbus/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;
    load_settings_from(&path)
}

/// Load settings from an explicit path, then apply environment overrides.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&content)?;
    settings.apply_env_overrides()?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings from `path` (or the default location), falling back to
/// defaults with environment overrides.
///
/// Problems are returned rather than logged so they can be reported once
/// logging is up.
pub fn load_settings_with_fallback(path: Option<&Path>) -> (Settings, Vec<String>) {
    let loaded = match path {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    let error = match loaded {
        Ok(settings) => return (settings, Vec::new()),
        Err(e) => e,
    };

    let mut notes = vec![format!("Failed to load settings: {}, using defaults", error)];
    let mut settings = Settings::default();
    let overridden = settings
        .apply_env_overrides()
        .and_then(|_| validate_settings(&settings));
    if let Err(e) = overridden {
        notes.push(format!("Ignoring environment overrides: {}", e));
        settings = Settings::default();
    }
    (settings, notes)
}

/// Load settings or return defaults (with environment overrides) if not found.
pub fn load_settings_or_default() -> Settings {
    let (settings, notes) = load_settings_with_fallback(None);
    for note in notes {
        tracing::warn!("{}", note);
    }
    settings
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.broker.default_ttl_seconds == 0 {
        return Err(Error::Config(
            "broker.default_ttl_seconds must be greater than zero".to_string(),
        ));
    }

    if settings.broker.backend == Backend::Redis {
        let url = settings.broker.redis_url.as_str();
        let known_scheme = ["redis://", "rediss://", "unix://"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !known_scheme {
            return Err(Error::Config(format!(
                "broker.redis_url '{}' must start with redis://, rediss:// or unix://",
                url
            )));
        }
    }
    Ok(())
}

/// Transport backend.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process hub; only peers inside the same process see each other.
    #[default]
    Memory,
    /// Redis pub/sub (requires the `redis` feature).
    Redis,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "redis" => Ok(Backend::Redis),
            other => Err(Error::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// Broker configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_ttl_seconds() -> u64 {
    3600
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_url: default_redis_url(),
            default_ttl_seconds: default_ttl_seconds(),
        }
    }
}

/// Logging configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
    #[serde(default = "default_log_to_file")]
    pub file: bool,
}

fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: None,
            file: default_log_to_file(),
        }
    }
}

/// agentbus settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Apply `AGENTBUS_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.broker.backend = backend.parse()?;
        }
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.broker.redis_url = url;
        }
        if let Some(ttl) = lookup(ENV_DEFAULT_TTL) {
            self.broker.default_ttl_seconds = ttl.trim().parse().map_err(|_| {
                Error::Config(format!("{} must be a positive integer, got '{}'", ENV_DEFAULT_TTL, ttl))
            })?;
        }
        Ok(())
    }
}
