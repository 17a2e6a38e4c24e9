//! `lsprobe.toml` loading.
//!
//! Discovery order: an explicit path, then `./lsprobe.toml`, then
//! `<config dir>/lsprobe/config.toml`. A missing file is not an error; the
//! defaults apply. `LSPROBE_*` environment variables override file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lsprobe_lsp::{ClientConfig, ServerConfig};
use serde::Deserialize;

pub const FILE_NAME: &str = "lsprobe.toml";

pub const ENV_REQUEST_TIMEOUT_MS: &str = "LSPROBE_REQUEST_TIMEOUT_MS";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "LSPROBE_SHUTDOWN_TIMEOUT_MS";
pub const ENV_INITIALIZE_TIMEOUT_MS: &str = "LSPROBE_INITIALIZE_TIMEOUT_MS";
pub const ENV_STRICT_NOTIFICATIONS: &str = "LSPROBE_STRICT_NOTIFICATIONS";
pub const ENV_SERVER_COMMAND: &str = "LSPROBE_SERVER_COMMAND";

const DEFAULT_WAIT_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::InvalidEnv { .. } => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LsprobeConfig {
    #[serde(default)]
    pub client: ClientSection,
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub harness: HarnessSection,
}

/// `[client]`. Durations are milliseconds; a request timeout of 0 disables
/// the default deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub request_timeout_ms: u64,
    pub initialize_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub quarantine_ms: u64,
    pub strict_notifications: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            initialize_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            quarantine_ms: 60_000,
            strict_notifications: false,
        }
    }
}

impl ClientSection {
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let optional = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        ClientConfig {
            request_timeout: optional(self.request_timeout_ms),
            initialize_timeout: optional(self.initialize_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            quarantine: Duration::from_millis(self.quarantine_ms),
            strict_notifications: self.strict_notifications,
            ..ClientConfig::default()
        }
    }
}

/// `[harness]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSection {
    pub fixtures_dir: Option<PathBuf>,
    pub default_wait_ms: u64,
}

impl Default for HarnessSection {
    fn default() -> Self {
        Self {
            fixtures_dir: None,
            default_wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

impl HarnessSection {
    #[must_use]
    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.default_wait_ms)
    }
}

impl LsprobeConfig {
    /// Load from `explicit` or the first discovered file, then apply
    /// environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match discover() {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config = toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Apply `LSPROBE_*` overrides read through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(ms) = env_millis(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            self.client.request_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(&lookup, ENV_SHUTDOWN_TIMEOUT_MS)? {
            self.client.shutdown_timeout_ms = ms;
        }
        if let Some(ms) = env_millis(&lookup, ENV_INITIALIZE_TIMEOUT_MS)? {
            self.client.initialize_timeout_ms = ms;
        }
        if let Some(value) = lookup(ENV_STRICT_NOTIFICATIONS) {
            self.client.strict_notifications = parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidEnv {
                    var: ENV_STRICT_NOTIFICATIONS,
                    value: value.clone(),
                    reason: "expected true/false/1/0".into(),
                }
            })?;
        }
        if let Some(command) = lookup(ENV_SERVER_COMMAND) {
            let mut words = command.split_whitespace().map(str::to_string);
            let Some(program) = words.next() else {
                return Err(ConfigError::InvalidEnv {
                    var: ENV_SERVER_COMMAND,
                    value: command,
                    reason: "empty command".into(),
                });
            };
            self.server = Some(ServerConfig {
                command: Some(program),
                args: words.collect(),
                tcp: None,
                unix: None,
                ..self.server.take().unwrap_or_default()
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        self.client.client_config()
    }
}

fn env_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: std::num::ParseIntError| ConfigError::InvalidEnv {
            var,
            value,
            reason: e.to_string(),
        })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// First config file that exists in discovery order.
#[must_use]
pub fn discover() -> Option<PathBuf> {
    let local = PathBuf::from(FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    user_config_path().filter(|path| path.is_file())
}

#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lsprobe").join("config.toml"))
}
