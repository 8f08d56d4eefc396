//! Runtime configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then environment variables (highest precedence). A `.env` file is loaded
//! into the environment first when present.
//!
//! | Variable | Default | Purpose |
//! |----------|---------|---------|
//! | `LINEAR_WEBHOOK_SECRET` | empty | HMAC secret; empty disables verification |
//! | `LINEAR_API_KEY` | empty | Team name lookups; empty disables lookups |
//! | `NOTION_API_KEY` | required | Workspace API token |
//! | `NOTION_SOURCE_DATABASE_ID` | required | Daily documents database |
//! | `NOTION_ROLLUP_DATABASE_ID` | source db | Aggregate documents database |
//! | `ROLLUP_WINDOW_DAYS` | `7` | Trailing aggregation window |
//! | `ROLLUP_DAYS` | `fri,sat,sun,mon` | Weekdays the job may run |
//! | `ROLLUP_INTERVAL_SECS` | `7200` | Scheduler tick interval |
//! | `ROLLUP_MAX_ATTEMPTS` | `5` | Retry budget per run |
//! | `ROLLUP_BASE_DELAY_MS` | `1000` | First retry delay |
//! | `ROLLUP_MAX_DELAY_MS` | `30000` | Retry delay cap |
//! | `PORT` | `8000` | HTTP listen port |

use crate::{Error, Result};
use chrono::Weekday;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default config file path, overridable via `SYNCPULSE_CONFIG`.
const DEFAULT_CONFIG_PATH: &str = "syncpulse.toml";

/// Settings for the windowed aggregation job.
#[derive(Debug, Clone)]
pub struct RollupSettings {
    /// Trailing window length in days.
    pub window_days: i64,
    /// Weekdays on which the job is allowed to run.
    pub run_days: Vec<Weekday>,
    /// Scheduler tick interval.
    pub interval: Duration,
    /// Maximum attempts per run, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the computed retry delay.
    pub max_delay: Duration,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            window_days: 7,
            run_days: vec![Weekday::Fri, Weekday::Sat, Weekday::Sun, Weekday::Mon],
            interval: Duration::from_secs(7200),
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RollupSettings {
    /// Whether the job may run on the given weekday.
    #[must_use]
    pub fn runs_on(&self, weekday: Weekday) -> bool {
        self.run_days.contains(&weekday)
    }

    /// Exponential backoff delay for a 1-based attempt number, capped at
    /// [`Self::max_delay`].
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let delay = self.base_delay.saturating_mul(1 << shift);
        delay.min(self.max_delay)
    }
}

/// Top-level service configuration.
#[derive(Debug)]
pub struct SyncConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Webhook HMAC secret. Empty means verification is disabled.
    pub webhook_secret: SecretString,
    /// API key for team name lookups. Empty means lookups are disabled.
    pub linear_api_key: SecretString,
    /// Workspace API token.
    pub notion_api_key: SecretString,
    /// Database holding the daily documents.
    pub source_database_id: String,
    /// Database receiving aggregate documents.
    pub rollup_database_id: String,
    /// Aggregation job settings.
    pub rollup: RollupSettings,
}

/// On-disk configuration file shape. Every field is optional; the file
/// itself is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    port: Option<u16>,
    webhook_secret: Option<String>,
    linear_api_key: Option<String>,
    notion_api_key: Option<String>,
    source_database_id: Option<String>,
    rollup_database_id: Option<String>,
    #[serde(default)]
    rollup: RollupFileSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RollupFileSection {
    window_days: Option<i64>,
    run_days: Option<Vec<String>>,
    interval_secs: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

impl ConfigFile {
    /// Parses a configuration file from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the TOML is malformed or has
    /// unknown fields.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidInput(format!("config file: {e}")))
    }
}

impl SyncConfig {
    /// Loads configuration from `.env`, the optional config file, and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when a required value is missing or a
    /// value does not parse.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("SYNCPULSE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let file = if Path::new(&path).is_file() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::InvalidInput(format!("config file {path}: {e}")))?;
            tracing::debug!(path = %path, "loaded config file");
            ConfigFile::parse(&text)?
        } else {
            ConfigFile::default()
        };

        Self::from_sources(file)
    }

    /// Merges a parsed file with the current environment.
    fn from_sources(file: ConfigFile) -> Result<Self> {
        let source_database_id = env_string("NOTION_SOURCE_DATABASE_ID")
            .or(file.source_database_id)
            .ok_or_else(|| {
                Error::InvalidInput("NOTION_SOURCE_DATABASE_ID is required".to_string())
            })?;
        let notion_api_key = env_string("NOTION_API_KEY")
            .or(file.notion_api_key)
            .ok_or_else(|| Error::InvalidInput("NOTION_API_KEY is required".to_string()))?;

        // A missing rollup database means aggregates land alongside the
        // daily documents.
        let rollup_database_id = env_string("NOTION_ROLLUP_DATABASE_ID")
            .or(file.rollup_database_id)
            .unwrap_or_else(|| source_database_id.clone());

        let defaults = RollupSettings::default();
        let run_days = match env_string("ROLLUP_DAYS")
            .map(|value| value.split(',').map(str::trim).map(String::from).collect())
            .or(file.rollup.run_days)
        {
            Some(names) => parse_run_days(&names)?,
            None => defaults.run_days,
        };

        let rollup = RollupSettings {
            window_days: env_parse("ROLLUP_WINDOW_DAYS")?
                .or(file.rollup.window_days)
                .unwrap_or(defaults.window_days),
            run_days,
            interval: env_parse("ROLLUP_INTERVAL_SECS")?
                .or(file.rollup.interval_secs)
                .map_or(defaults.interval, Duration::from_secs),
            max_attempts: env_parse("ROLLUP_MAX_ATTEMPTS")?
                .or(file.rollup.max_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_parse("ROLLUP_BASE_DELAY_MS")?
                .or(file.rollup.base_delay_ms)
                .map_or(defaults.base_delay, Duration::from_millis),
            max_delay: env_parse("ROLLUP_MAX_DELAY_MS")?
                .or(file.rollup.max_delay_ms)
                .map_or(defaults.max_delay, Duration::from_millis),
        };

        Ok(Self {
            port: env_parse("PORT")?.or(file.port).unwrap_or(8000),
            webhook_secret: SecretString::from(
                env_string("LINEAR_WEBHOOK_SECRET")
                    .or(file.webhook_secret)
                    .unwrap_or_default(),
            ),
            linear_api_key: SecretString::from(
                env_string("LINEAR_API_KEY")
                    .or(file.linear_api_key)
                    .unwrap_or_default(),
            ),
            notion_api_key: SecretString::from(notion_api_key),
            source_database_id,
            rollup_database_id,
            rollup,
        })
    }
}

/// Parses weekday names like `fri` or `friday`, case-insensitive.
fn parse_run_days(names: &[String]) -> Result<Vec<Weekday>> {
    names
        .iter()
        .map(|name| {
            name.parse::<Weekday>()
                .map_err(|_| Error::InvalidInput(format!("unknown weekday '{name}'")))
        })
        .collect()
}

/// Reads a non-empty environment variable.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Reads and parses an environment variable, erroring on malformed values.
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{key}: cannot parse '{value}'"))),
        None => Ok(None),
    }
}
