//! Environment-driven configuration with validation and defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub quotes: QuoteConfig,
    pub game: GameConfig,
    pub limits: LimitConfig,
    /// DSN for an external document-store backend; the compiled-in backend
    /// is in-memory and ignores it.
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS origin of the web client; "*" allows any origin
    pub frontend_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            frontend_url: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    pub api_url: String,
    pub cache_ttl_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.coingecko.com/api/v3".to_string(),
            cache_ttl_ms: 10_000,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub house_edge: f64,
    pub tick_ms: u64,
    /// Betting window before a round starts
    pub wait_ms: u64,
    /// Pause after a crash before the next round
    pub post_crash_ms: u64,
    pub min_bet_usd: f64,
    pub max_bet_usd: f64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            house_edge: 0.04,
            tick_ms: 100,
            wait_ms: 5_000,
            post_crash_ms: 5_000,
            min_bet_usd: 0.01,
            max_bet_usd: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Inbound operations allowed per connection per minute
    pub rate_limit_per_min: u32,
    /// Ledger and repository write deadline
    pub store_timeout_ms: u64,
    /// Settlement persistence attempts before the round is abandoned
    pub settle_retries: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_min: 100,
            store_timeout_ms: 2_000,
            settle_retries: 5,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            quotes: QuoteConfig::default(),
            game: GameConfig::default(),
            limits: LimitConfig::default(),
            database_url: None,
        }
    }
}

impl AppConfig {
    /// Load from the environment, falling back to defaults per variable
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = env::var("HOST") {
            config.server.host = host;
        }
        config.server.port = env_parse("PORT", config.server.port);
        if let Ok(url) = env::var("FRONTEND_URL") {
            config.server.frontend_url = url;
        }
        if let Ok(url) = env::var("COINGECKO_API_URL") {
            config.quotes.api_url = url;
        }
        config.quotes.cache_ttl_ms =
            env_parse("PRICE_CACHE_DURATION_MS", config.quotes.cache_ttl_ms);
        config.game.house_edge = env_parse("HOUSE_EDGE", config.game.house_edge);
        config.game.tick_ms = env_parse("MULTIPLIER_TICK_MS", config.game.tick_ms);
        config.game.wait_ms = env_parse("WAIT_MS", config.game.wait_ms);
        config.game.post_crash_ms = env_parse("POST_CRASH_MS", config.game.post_crash_ms);
        config.game.max_bet_usd = env_parse("MAX_BET_USD", config.game.max_bet_usd);
        config.limits.rate_limit_per_min =
            env_parse("RATE_LIMIT_PER_MIN", config.limits.rate_limit_per_min);
        config.database_url = env::var("MONGODB_URI").ok();

        config
    }

    /// Reject logically inconsistent settings before the engine starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.game.tick_ms == 0 {
            return Err(ConfigError::InvalidValue("MULTIPLIER_TICK_MS must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.game.house_edge) {
            return Err(ConfigError::InvalidValue("HOUSE_EDGE must be in [0, 1)".into()));
        }
        if self.game.min_bet_usd <= 0.0 || self.game.max_bet_usd < self.game.min_bet_usd {
            return Err(ConfigError::InvalidValue(
                "bet bounds must satisfy 0 < min <= max".into(),
            ));
        }
        if self.limits.rate_limit_per_min == 0 {
            return Err(ConfigError::InvalidValue("RATE_LIMIT_PER_MIN must be > 0".into()));
        }
        if self.limits.settle_retries == 0 {
            return Err(ConfigError::InvalidValue("settle_retries must be > 0".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.game.tick_ms)
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_millis(self.game.wait_ms)
    }

    pub fn post_crash_delay(&self) -> Duration {
        Duration::from_millis(self.game.post_crash_ms)
    }

    pub fn quote_ttl(&self) -> Duration {
        Duration::from_millis(self.quotes.cache_ttl_ms)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_millis(self.quotes.request_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.store_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.game.tick_ms, 100);
        assert_eq!(config.game.wait_ms, 5_000);
        assert_eq!(config.game.max_bet_usd, 10_000.0);
        assert_eq!(config.limits.rate_limit_per_min, 100);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.game.tick_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.game.house_edge = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.game.max_bet_usd = 0.001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.wait_delay(), Duration::from_millis(5_000));
        assert_eq!(config.quote_timeout(), Duration::from_millis(5_000));
        assert_eq!(config.store_timeout(), Duration::from_millis(2_000));
    }
}
