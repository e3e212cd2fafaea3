//! Process configuration read from `CHORECHART_*` environment variables.
//!
//! # Invariants
//! - Parsing is a pure function of a key lookup; `from_env` is the only
//!   place that touches the process environment.
//! - Empty values count as unset.
//! - The auth token never appears in `Debug` output or logs.

use crate::logging::default_log_level;
use crate::model::defaults::DEFAULT_FALLBACK_TASK_SET_ID;
use crate::service::reset_scheduler::DEFAULT_POLL_INTERVAL;
use crate::store::FirebaseConfig;
use chrono_tz::Tz;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "CHORECHART_";

pub const STORE_KEY: &str = "STORE";
pub const DATABASE_URL_KEY: &str = "DATABASE_URL";
pub const AUTH_TOKEN_KEY: &str = "AUTH_TOKEN";
pub const DOCUMENT_PATH_KEY: &str = "DOCUMENT_PATH";
pub const SQLITE_PATH_KEY: &str = "SQLITE_PATH";
pub const PREFS_PATH_KEY: &str = "PREFS_PATH";
pub const RESET_TIMEZONE_KEY: &str = "RESET_TIMEZONE";
pub const RESET_POLL_SECS_KEY: &str = "RESET_POLL_SECS";
pub const SQLITE_FEED_SECS_KEY: &str = "SQLITE_FEED_SECS";
pub const FALLBACK_TASK_SET_KEY: &str = "FALLBACK_TASK_SET";
pub const LOG_LEVEL_KEY: &str = "LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "LOG_DIR";

const DEFAULT_DOCUMENT_PATH: &str = "state";
const DEFAULT_SQLITE_PATH: &str = "chorechart.sqlite3";
const DEFAULT_PREFS_PATH: &str = "chorechart_prefs.sqlite3";
const DEFAULT_SQLITE_FEED_PERIOD: Duration = Duration::from_secs(2);

/// Configuration error raised at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A key required by the selected backend is unset.
    Missing(&'static str),
    /// A key holds a value that cannot be used.
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing required setting {ENV_PREFIX}{key}"),
            Self::Invalid { key, value, reason } => {
                write!(f, "invalid {ENV_PREFIX}{key} `{value}`: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Which store adapter the process talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Firebase(FirebaseConfig),
    Sqlite { path: PathBuf, feed_period: Duration },
    Memory,
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Firebase(_) => "firebase",
            Self::Sqlite { .. } => "sqlite",
            Self::Memory => "memory",
        }
    }
}

/// Fully resolved process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub document_path: String,
    pub prefs_path: PathBuf,
    pub reset_timezone: Tz,
    pub reset_poll_interval: Duration,
    pub fallback_task_set_id: String,
    pub log_level: String,
    /// Rolling log file directory; `None` logs to stderr.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which receives full variable
    /// names such as `CHORECHART_STORE`.
    ///
    /// # Errors
    /// - `ConfigError::Missing` when `firebase` is selected without a URL.
    /// - `ConfigError::Invalid` for unknown backends, unknown time zones,
    ///   and non-positive or non-numeric periods.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &'static str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let document_path =
            read(DOCUMENT_PATH_KEY).unwrap_or_else(|| DEFAULT_DOCUMENT_PATH.to_string());
        let database_url = read(DATABASE_URL_KEY);

        let backend_name = read(STORE_KEY)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_else(|| {
                if database_url.is_some() {
                    "firebase".to_string()
                } else {
                    "sqlite".to_string()
                }
            });

        let store = match backend_name.as_str() {
            "firebase" => {
                let database_url = database_url.ok_or(ConfigError::Missing(DATABASE_URL_KEY))?;
                if !database_url.starts_with("https://") && !database_url.starts_with("http://") {
                    return Err(ConfigError::Invalid {
                        key: DATABASE_URL_KEY,
                        value: database_url,
                        reason: "expected an http(s) URL",
                    });
                }
                StoreBackend::Firebase(FirebaseConfig {
                    database_url,
                    document_path: document_path.clone(),
                    auth_token: read(AUTH_TOKEN_KEY),
                })
            }
            "sqlite" => StoreBackend::Sqlite {
                path: read(SQLITE_PATH_KEY)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH)),
                feed_period: parse_period(SQLITE_FEED_SECS_KEY, read(SQLITE_FEED_SECS_KEY))?
                    .unwrap_or(DEFAULT_SQLITE_FEED_PERIOD),
            },
            "memory" => StoreBackend::Memory,
            _ => {
                return Err(ConfigError::Invalid {
                    key: STORE_KEY,
                    value: backend_name,
                    reason: "expected firebase, sqlite or memory",
                })
            }
        };

        let reset_timezone = match read(RESET_TIMEZONE_KEY) {
            Some(raw) => raw.parse::<Tz>().map_err(|_| ConfigError::Invalid {
                key: RESET_TIMEZONE_KEY,
                value: raw,
                reason: "unknown IANA time zone",
            })?,
            None => Tz::UTC,
        };

        Ok(Self {
            store,
            document_path,
            prefs_path: read(PREFS_PATH_KEY)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFS_PATH)),
            reset_timezone,
            reset_poll_interval: parse_period(RESET_POLL_SECS_KEY, read(RESET_POLL_SECS_KEY))?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            fallback_task_set_id: read(FALLBACK_TASK_SET_KEY)
                .unwrap_or_else(|| DEFAULT_FALLBACK_TASK_SET_ID.to_string()),
            log_level: read(LOG_LEVEL_KEY).unwrap_or_else(|| default_log_level().to_string()),
            log_dir: read(LOG_DIR_KEY).map(PathBuf::from),
        })
    }
}

fn parse_period(key: &'static str, raw: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected a whole number of seconds greater than zero",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ConfigError, StoreBackend};
    use chrono_tz::Tz;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn parse(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let env = pairs
            .iter()
            .map(|(key, value)| (format!("CHORECHART_{key}"), value.to_string()))
            .collect::<HashMap<_, _>>();
        AppConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_select_sqlite() {
        let config = parse(&[]).expect("empty env should parse");
        assert_eq!(
            config.store,
            StoreBackend::Sqlite {
                path: PathBuf::from("chorechart.sqlite3"),
                feed_period: Duration::from_secs(2),
            }
        );
        assert_eq!(config.document_path, "state");
        assert_eq!(config.reset_timezone, Tz::UTC);
        assert_eq!(config.reset_poll_interval, Duration::from_secs(300));
        assert_eq!(config.fallback_task_set_id, "alex_tasks");
        assert_eq!(config.log_dir, None);
    }

    #[test]
    fn database_url_implies_firebase() {
        let config = parse(&[
            ("DATABASE_URL", "https://kids.example.firebasedatabase.app"),
            ("AUTH_TOKEN", "secret"),
            ("DOCUMENT_PATH", "family/state"),
        ])
        .expect("firebase env should parse");
        let StoreBackend::Firebase(firebase) = &config.store else {
            panic!("expected firebase backend, got {:?}", config.store);
        };
        assert_eq!(firebase.document_path, "family/state");
        assert_eq!(firebase.auth_token.as_deref(), Some("secret"));
        assert!(!format!("{:?}", config.store).contains("secret"));
    }

    #[test]
    fn firebase_without_url_is_missing() {
        assert_eq!(
            parse(&[("STORE", "firebase")]).expect_err("url is required"),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            parse(&[("STORE", "redis")]),
            Err(ConfigError::Invalid { key: "STORE", .. })
        ));
        assert!(matches!(
            parse(&[("RESET_TIMEZONE", "Mars/Olympus")]),
            Err(ConfigError::Invalid { key: "RESET_TIMEZONE", .. })
        ));
        assert!(matches!(
            parse(&[("RESET_POLL_SECS", "0")]),
            Err(ConfigError::Invalid { key: "RESET_POLL_SECS", .. })
        ));
    }

    #[test]
    fn reads_timezone_and_memory_backend() {
        let config = parse(&[("STORE", " Memory "), ("RESET_TIMEZONE", "Europe/Stockholm")])
            .expect("env should parse");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.reset_timezone, Tz::Europe__Stockholm);
    }
}
