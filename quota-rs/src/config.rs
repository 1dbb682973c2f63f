use crate::error::{QuotaError, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default daily allowance in units
pub const DEFAULT_DAILY_LIMIT: u64 = 500_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
}

/// Burst limits per endpoint class
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_general_chat")]
    pub general_chat: WindowConfig,
    #[serde(default = "default_weather_chat")]
    pub weather_chat: WindowConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct WindowConfig {
    pub max_requests: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl WindowConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local time-of-day of the daily sweep, "HH:MM:SS"
    #[serde(default = "default_reset_time")]
    pub reset_time: String,
    /// Insert a fresh row on rollover instead of repurposing the stale one
    #[serde(default)]
    pub preserve_history: bool,
}

impl SchedulerConfig {
    pub fn reset_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.reset_time, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(&self.reset_time, "%H:%M"))
            .map_err(|e| {
                QuotaError::Config(format!("invalid reset_time {:?}: {}", self.reset_time, e))
            })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_max_connections() -> u32 {
    5
}

fn default_daily_limit() -> u64 {
    DEFAULT_DAILY_LIMIT
}

fn default_window_secs() -> u64 {
    3600
}

fn default_general_chat() -> WindowConfig {
    WindowConfig {
        max_requests: 50,
        window_secs: 3600,
    }
}

fn default_weather_chat() -> WindowConfig {
    WindowConfig {
        max_requests: 10,
        window_secs: 3600,
    }
}

fn default_true() -> bool {
    true
}

fn default_reset_time() -> String {
    "00:00:00".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://quota.db".to_string(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general_chat: default_general_chat(),
            weather_chat: default_weather_chat(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reset_time: default_reset_time(),
            preserve_history: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional TOML file with `QUOTA__SECTION__KEY` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("QUOTA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.quota.daily_limit == 0 {
            return Err(QuotaError::Config("quota.daily_limit must be positive".into()));
        }
        if self.quota.daily_limit > i64::MAX as u64 {
            return Err(QuotaError::Config("quota.daily_limit is too large".into()));
        }
        for (name, window) in [
            ("general_chat", &self.rate_limit.general_chat),
            ("weather_chat", &self.rate_limit.weather_chat),
        ] {
            if window.max_requests == 0 {
                return Err(QuotaError::Config(format!(
                    "rate_limit.{}.max_requests must be positive",
                    name
                )));
            }
            if window.window_secs == 0 {
                return Err(QuotaError::Config(format!(
                    "rate_limit.{}.window_secs must be positive",
                    name
                )));
            }
        }
        if self.storage.max_connections == 0 {
            return Err(QuotaError::Config("storage.max_connections must be positive".into()));
        }
        self.scheduler.reset_time()?;
        Ok(())
    }
}
