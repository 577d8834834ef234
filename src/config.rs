//! Server configuration, read from the environment (and `.env`) at startup.

use std::num::NonZeroU32;

const DEFAULT_HISTORY_MAX_LIMIT: NonZeroU32 = NonZeroU32::new(100).unwrap();

#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx SQLite URL, e.g. `sqlite://duochat.db`.
    pub database_url: String,
    pub bind_address: String,
    pub max_connections: u32,
    /// Largest page the history endpoint will return; bigger requests are clamped.
    pub history_max_limit: NonZeroU32,
    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("DATABASE_URL", "sqlite://duochat.db"),
            bind_address: env_or("DUOCHAT_BIND", "0.0.0.0:8080"),
            max_connections: parse_env("DUOCHAT_MAX_CONNECTIONS", 16),
            history_max_limit: parse_env("DUOCHAT_HISTORY_MAX_LIMIT", DEFAULT_HISTORY_MAX_LIMIT),
            log_level: env_or("DUOCHAT_LOG", "info"),
            log_json: dotenv::var("DUOCHAT_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    dotenv::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(dotenv::var(key).ok().as_deref(), default)
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        assert_eq!(env_or("DUOCHAT_TEST_SURELY_UNSET", "fallback"), "fallback");
        assert_eq!(parse_env("DUOCHAT_TEST_SURELY_UNSET", 7u32), 7);
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        assert_eq!(parse_or(Some("lots"), 16u32), 16);
        assert_eq!(parse_or(Some("25"), 16u32), 25);
        assert_eq!(parse_or(None, 16u32), 16);
    }

    #[test]
    fn history_limit_must_be_positive() {
        assert_eq!(parse_or(Some("-1"), DEFAULT_HISTORY_MAX_LIMIT), DEFAULT_HISTORY_MAX_LIMIT);
        assert_eq!(parse_or(Some("0"), DEFAULT_HISTORY_MAX_LIMIT), DEFAULT_HISTORY_MAX_LIMIT);
        assert_eq!(parse_or(Some("50"), DEFAULT_HISTORY_MAX_LIMIT).get(), 50);
    }
}
