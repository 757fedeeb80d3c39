use std::env;
use std::fmt;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for an embedding process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub matching: MatchingConfig,
    pub telemetry: TelemetryConfig,
}

/// Dials for the matching and settlement workflows.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Days a new class request stays open before the expiry sweep may
    /// claim it.
    pub request_expiry_days: i64,
    /// Attempts per atomic unit when the store reports transient faults.
    pub transaction_attempts: u32,
    /// Weeks of concrete occurrences the default planner materializes.
    pub schedule_horizon_weeks: u32,
    /// The sweep historically matches `Active` requests, a status `create`
    /// never produces. This flag opts into also sweeping `Pending`.
    pub expire_pending_requests: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            request_expiry_days: 7,
            transaction_attempts: 3,
            schedule_horizon_weeks: 4,
            expire_pending_requests: false,
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let defaults = MatchingConfig::default();
        let matching = MatchingConfig {
            request_expiry_days: parse_int("MATCHING_REQUEST_EXPIRY_DAYS", defaults.request_expiry_days)?,
            transaction_attempts: parse_int("MATCHING_TRANSACTION_ATTEMPTS", defaults.transaction_attempts)?,
            schedule_horizon_weeks: parse_int(
                "MATCHING_SCHEDULE_HORIZON_WEEKS",
                defaults.schedule_horizon_weeks,
            )?,
            expire_pending_requests: parse_bool(
                "MATCHING_EXPIRE_PENDING_REQUESTS",
                defaults.expire_pending_requests,
            )?,
        };

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            matching,
            telemetry: TelemetryConfig { log_level },
        })
    }
}

fn parse_int<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBoolean { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidInteger { key: &'static str, value: String },
    InvalidBoolean { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidInteger { key, value } => {
                write!(f, "{key} must be an integer, got '{value}'")
            }
            ConfigError::InvalidBoolean { key, value } => {
                write!(f, "{key} must be a boolean, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        env::remove_var("APP_ENV");
        env::remove_var("APP_LOG_LEVEL");
        env::remove_var("MATCHING_REQUEST_EXPIRY_DAYS");
        env::remove_var("MATCHING_TRANSACTION_ATTEMPTS");
        env::remove_var("MATCHING_SCHEDULE_HORIZON_WEEKS");
        env::remove_var("MATCHING_EXPIRE_PENDING_REQUESTS");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.matching.request_expiry_days, 7);
        assert_eq!(config.matching.transaction_attempts, 3);
        assert!(!config.matching.expire_pending_requests);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn expiry_correction_flag_is_opt_in() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("MATCHING_EXPIRE_PENDING_REQUESTS", "true");
        let config = AppConfig::load().expect("config loads");
        assert!(config.matching.expire_pending_requests);
        reset_env();
    }

    #[test]
    fn malformed_integer_is_rejected() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("MATCHING_REQUEST_EXPIRY_DAYS", "soon");
        let outcome = AppConfig::load();
        assert!(matches!(
            outcome,
            Err(ConfigError::InvalidInteger { key: "MATCHING_REQUEST_EXPIRY_DAYS", .. })
        ));
        reset_env();
    }
}
