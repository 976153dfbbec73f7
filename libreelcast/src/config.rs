//! Configuration management for Reelcast

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::schedule::ScheduleConfig;
use crate::types::Platform;

pub const CONFIG_ENV: &str = "REELCAST_CONFIG";
pub const DB_PATH_ENV: &str = "REELCAST_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub platforms: PlatformsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Keyed by platform name
    #[serde(default)]
    pub publishers: BTreeMap<String, PublisherConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            description: String::new(),
        }
    }
}

/// Raw `[schedule]` table; validated into a [`ScheduleConfig`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleSection {
    /// Weekday names, e.g. `["mon", "wed", "fri"]`
    pub weekdays: Vec<String>,
    /// Local times of day as `HH:MM`
    pub times: Vec<String>,
    /// IANA zone name, e.g. `Europe/Berlin`
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub one_per_day: bool,
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            weekdays: ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            times: vec!["09:00".to_string(), "18:00".to_string()],
            timezone: default_timezone(),
            one_per_day: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformsConfig {
    pub enabled: Vec<Platform>,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            enabled: Platform::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(with = "duration_str", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
    #[serde(with = "duration_str", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    /// `[min, max]` random pause before each upload; `["0s", "0s"]` disables it
    #[serde(with = "duration_list", default = "default_jitter")]
    pub jitter: Vec<Duration>,
}

impl DispatchConfig {
    /// The validated jitter bounds
    pub fn jitter_range(&self) -> Result<(Duration, Duration)> {
        match self.jitter[..] {
            [min, max] if min <= max => Ok((min, max)),
            [_, _] => Err(invalid("dispatch.jitter", "min must not exceed max")),
            _ => Err(invalid("dispatch.jitter", "expected [min, max]")),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            publish_timeout: default_publish_timeout(),
            health_check_interval: default_health_check_interval(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "duration_list", default = "default_backoff")]
    pub backoff: Vec<Duration>,
    #[serde(with = "duration_str", default = "default_auth_gap_backoff")]
    pub auth_gap_backoff: Duration,
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: u32,
    #[serde(with = "duration_str", default = "default_pause_window")]
    pub pause_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            auth_gap_backoff: default_auth_gap_backoff(),
            pause_threshold: default_pause_threshold(),
            pause_window: default_pause_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(with = "duration_str", default = "default_stale_after")]
    pub stale_after: Duration,
    #[serde(with = "duration_str", default = "default_verify_interval")]
    pub verify_interval: Duration,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            verify_interval: default_verify_interval(),
        }
    }
}

/// External uploader invoked for one platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments for the credential check; no verifier is registered when unset
    #[serde(default)]
    pub verify_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(with = "duration_str", default = "default_notify_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            timeout: default_notify_timeout(),
            telegram: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

fn default_title() -> String {
    "Short".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_publish_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_jitter() -> Vec<Duration> {
    vec![Duration::from_secs(10), Duration::from_secs(30)]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(5 * 60),
        Duration::from_secs(30 * 60),
        Duration::from_secs(2 * 3600),
    ]
}

fn default_auth_gap_backoff() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_pause_threshold() -> u32 {
    5
}

fn default_pause_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(25 * 24 * 3600)
}

fn default_verify_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/reelcast/reelcast.db".to_string(),
            },
            defaults: DefaultsConfig::default(),
            schedule: ScheduleSection::default(),
            platforms: PlatformsConfig::default(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            credentials: CredentialsConfig::default(),
            publishers: BTreeMap::new(),
            notify: NotifyConfig::default(),
        }
    }

    /// Database path with `REELCAST_DB_PATH` taking precedence and `~` expanded.
    pub fn db_path(&self) -> String {
        let raw = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| self.database.path.clone());
        shellexpand::tilde(&raw).to_string()
    }

    pub fn publisher(&self, platform: Platform) -> Option<&PublisherConfig> {
        self.publishers.get(platform.as_str())
    }

    /// Parsed weekly timetable.
    pub fn schedule(&self) -> Result<ScheduleConfig> {
        ScheduleConfig::from_section(&self.schedule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.platforms.enabled.is_empty() {
            return Err(invalid("platforms.enabled", "at least one platform is required"));
        }
        if self.dispatch.poll_interval.is_zero() {
            return Err(invalid("dispatch.poll_interval", "must be greater than zero"));
        }
        if self.dispatch.publish_timeout.is_zero() {
            return Err(invalid("dispatch.publish_timeout", "must be greater than zero"));
        }
        self.dispatch.jitter_range()?;
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.pause_threshold == 0 {
            return Err(invalid("retry.pause_threshold", "must be at least 1"));
        }
        if self.retry.backoff.is_empty() {
            return Err(invalid("retry.backoff", "at least one step is required"));
        }
        if self.retry.backoff.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("retry.backoff", "steps must be strictly increasing"));
        }
        for (name, publisher) in &self.publishers {
            let platform: Platform = name.parse().map_err(|_| {
                invalid(&format!("publishers.{}", name), "unknown platform")
            })?;
            if publisher.command.trim().is_empty() {
                return Err(ConfigError::MissingField(format!("publishers.{}.command", platform)).into());
            }
        }
        self.schedule()?;
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> crate::error::ReelcastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

/// `$REELCAST_CONFIG`, else `<config_dir>/reelcast/config.toml`
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("reelcast").join("config.toml"))
}

/// `"90s"`, `"30m"`, `"2h 30m"` style durations.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod duration_list {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(values: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&humantime::format_duration(*value).to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| humantime::parse_duration(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
