use std::env;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// How many events a subscriber may fall behind before it is dropped.
    pub feed_buffer_size: usize,
    pub client_buffer_size: usize,
    pub store_retry_attempts: u32,
    pub store_retry_base_ms: u64,
    pub store_retry_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            feed_buffer_size: 1024,
            client_buffer_size: 256,
            store_retry_attempts: 3,
            store_retry_base_ms: 25,
            store_retry_max_ms: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => parse_log_format(&raw)?,
            Err(_) => defaults.log_format,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            feed_buffer_size: parse_or_default("FEED_BUFFER_SIZE", defaults.feed_buffer_size)?,
            client_buffer_size: parse_or_default(
                "CLIENT_BUFFER_SIZE",
                defaults.client_buffer_size,
            )?,
            store_retry_attempts: parse_or_default(
                "STORE_RETRY_ATTEMPTS",
                defaults.store_retry_attempts,
            )?,
            store_retry_base_ms: parse_or_default(
                "STORE_RETRY_BASE_MS",
                defaults.store_retry_base_ms,
            )?,
            store_retry_max_ms: parse_or_default("STORE_RETRY_MAX_MS", defaults.store_retry_max_ms)?,
        })
    }
}

fn parse_log_format(raw: &str) -> Result<LogFormat, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "compact" => Ok(LogFormat::Compact),
        "json" => Ok(LogFormat::Json),
        other => Err(AppError::Internal(format!(
            "invalid LOG_FORMAT: {other}, expected compact/json"
        ))),
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::{LogFormat, parse_log_format};

    #[test]
    fn log_format_is_case_insensitive() {
        assert_eq!(parse_log_format("JSON").unwrap(), LogFormat::Json);
        assert_eq!(parse_log_format("compact").unwrap(), LogFormat::Compact);
        assert!(parse_log_format("pretty").is_err());
    }
}
