//! Configuration module for the market-data service

use crate::utils::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration file version
    pub version: String,

    /// Coin ids served by the dashboards (max 10)
    pub coins: Vec<String>,

    /// Process-level settings
    pub app: AppConfig,

    /// Market-data provider settings
    pub upstream: UpstreamConfig,

    /// Response cache TTLs
    pub cache: CacheConfig,

    /// Price history database
    pub store: StoreConfig,

    /// Risk statistics parameters
    pub risk: RiskConfig,
}

/// Process-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (debug, info, warn, error)
    pub log_level: String,
    /// Address the HTTP server binds to
    pub bind_addr: String,
}

/// Market-data provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// REST base URL
    pub base_url: String,
    /// API credential sent with every request (empty = public tier)
    #[serde(default)]
    pub api_key: String,
    /// Header carrying the credential
    pub api_key_header: String,
    /// Timeout for the market snapshot call in seconds
    pub market_timeout_secs: u64,
    /// Timeout for the daily series call in seconds
    pub history_timeout_secs: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub market_ttl_secs: u64,
    pub history_ttl_secs: u64,
    pub risk_ttl_secs: u64,
    /// How long a caller waits on another caller's refresh before falling
    /// back to whatever is cached
    pub wait_timeout_secs: u64,
}

/// Upper bound for `store.max_busy_retries`.
pub const MAX_BUSY_RETRIES: u32 = 10;

/// Price history database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite file path
    pub db_path: String,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// Retries after the busy timeout expires
    pub max_busy_retries: u32,
    /// Days fetched per coin by a backfill
    pub backfill_days: u32,
    /// Backfill all coins when the server starts
    pub backfill_on_start: bool,
    /// Re-run the backfill this often while serving (0 = never)
    pub backfill_interval_secs: u64,
}

/// Risk statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Annual risk-free rate used by the Sharpe ratio (0.04 = 4%)
    pub risk_free_rate: f64,
    /// Coin whose returns beta is measured against
    pub benchmark: String,
    /// Value-at-Risk confidence level
    pub confidence: f64,
    /// Supported lookback windows in days
    pub windows: Vec<u32>,
    /// Window used when a request asks for anything else
    pub default_window: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            app: AppConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            risk: RiskConfig::default(),
            coins: [
                "bitcoin", "ethereum", "solana", "cardano", "dogecoin",
                "ripple", "litecoin", "polkadot", "tron", "chainlink",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), bind_addr: "127.0.0.1:8080".to_string() }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: String::new(),
            api_key_header: "x-cg-demo-api-key".to_string(),
            market_timeout_secs: 10,
            history_timeout_secs: 15,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            market_ttl_secs: 90,   // 1.5 minutes
            history_ttl_secs: 300, // 5 minutes
            risk_ttl_secs: 300,
            wait_timeout_secs: 20,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path().to_string_lossy().into_owned(),
            busy_timeout_ms: 5_000,
            max_busy_retries: 3,
            backfill_days: 365,
            backfill_on_start: true,
            backfill_interval_secs: 86_400,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.04,
            benchmark: "bitcoin".to_string(),
            confidence: 0.95,
            windows: vec![30, 90, 365],
            default_window: 30,
        }
    }
}

fn default_db_path() -> PathBuf {
    let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("coinrisk");
    p.push("crypto.db");
    p
}

impl CacheConfig {
    pub fn market_ttl(&self) -> Duration {
        Duration::from_secs(self.market_ttl_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }

    pub fn risk_ttl(&self) -> Duration {
        Duration::from_secs(self.risk_ttl_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl RiskConfig {
    /// Map a requested window onto a supported one; unsupported or
    /// unparsable values fall back to `default_window`.
    pub fn resolve_window(&self, requested: Option<&str>) -> u32 {
        requested
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|d| self.windows.contains(d))
            .unwrap_or(self.default_window)
    }
}

impl Config {
    /// Serialize default config to TOML string
    pub fn default_toml() -> Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::ConfigError(format!("Failed to read config file {:?}: {}", path.as_ref(), e))
        })?;
        let mut cfg: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config file: {}", e)))?;
        cfg.merge_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save the configuration to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }
        std::fs::write(path, content).map_err(|e| {
            Error::ConfigError(format!("Failed to write config file {:?}: {}", path, e))
        })?;
        Ok(())
    }

    /// Validate the configuration for required fields and reasonable values
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(Error::ConfigError("Config version must be set (e.g., '0.1.0')".into()));
        }
        // Coins
        if self.coins.is_empty() {
            return Err(Error::ConfigError("At least one coin must be configured".into()));
        }
        if self.coins.len() > 10 {
            return Err(Error::ConfigError(
                "At most 10 coins are supported by the market snapshot".into(),
            ));
        }
        if let Some(bad) = self.coins.iter().find(|c| !is_valid_coin_id(c)) {
            return Err(Error::ConfigError(format!("Invalid coin id '{}'", bad)));
        }
        // Upstream
        if self.upstream.base_url.trim().is_empty() {
            return Err(Error::ConfigError("upstream.base_url must be set".into()));
        }
        for (name, secs) in [
            ("market_timeout_secs", self.upstream.market_timeout_secs),
            ("history_timeout_secs", self.upstream.history_timeout_secs),
        ] {
            if !(1..=60).contains(&secs) {
                return Err(Error::ConfigError(format!("upstream.{} must be in 1..=60", name)));
            }
        }
        // Cache
        if self.cache.market_ttl_secs == 0
            || self.cache.history_ttl_secs == 0
            || self.cache.risk_ttl_secs == 0
        {
            return Err(Error::ConfigError("cache TTLs must be > 0".into()));
        }
        if self.cache.wait_timeout_secs == 0 {
            return Err(Error::ConfigError("cache.wait_timeout_secs must be > 0".into()));
        }
        // Store
        if self.store.db_path.trim().is_empty() {
            return Err(Error::ConfigError("store.db_path must be set".into()));
        }
        if self.store.max_busy_retries > MAX_BUSY_RETRIES {
            return Err(Error::ConfigError(format!(
                "store.max_busy_retries must be <= {}",
                MAX_BUSY_RETRIES
            )));
        }
        if self.store.backfill_days < 2 {
            return Err(Error::ConfigError("store.backfill_days must be >= 2".into()));
        }
        // Risk
        if !(self.risk.confidence > 0.0 && self.risk.confidence < 1.0) {
            return Err(Error::ConfigError("risk.confidence must be in (0, 1)".into()));
        }
        if !self.risk.windows.contains(&self.risk.default_window) {
            return Err(Error::ConfigError(
                "risk.default_window must be one of risk.windows".into(),
            ));
        }
        if !self.coins.contains(&self.risk.benchmark) {
            return Err(Error::ConfigError(format!(
                "risk.benchmark '{}' must be one of the configured coins",
                self.risk.benchmark
            )));
        }
        Ok(())
    }

    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        // Try to load from current directory
        if std::path::Path::new("config.toml").exists() {
            return Self::from_file("config.toml");
        }

        // Try to load from user config directory
        if let Some(mut path) = dirs::config_dir() {
            path.push("coinrisk");
            path.push("config.toml");
            if path.exists() {
                return Self::from_file(path);
            }
        }

        // Return default config if no config file found
        let mut config = Self::default();
        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Merge environment variables into the configuration
    pub fn merge_env(&mut self) -> Result<()> {
        if let Ok(key) = env::var("COINGECKO_API_KEY") {
            self.upstream.api_key = key;
        }

        if let Ok(url) = env::var("COINGECKO_BASE_URL") {
            self.upstream.base_url = url;
        }

        if let Ok(path) = env::var("COINRISK_DB_PATH") {
            self.store.db_path = path;
        }

        if let Ok(addr) = env::var("COINRISK_BIND") {
            self.app.bind_addr = addr;
        }

        Ok(())
    }
}

/// Coin ids are lowercase slugs (`bitcoin`, `avalanche-2`).
pub fn is_valid_coin_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.coins.len(), 10);
        assert_eq!(config.cache.market_ttl_secs, 90);
        assert_eq!(config.cache.history_ttl_secs, 300);
        assert_eq!(config.cache.risk_ttl_secs, 300);
        assert_eq!(config.risk.benchmark, "bitcoin");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.upstream.base_url = "http://127.0.0.1:9999".to_string();
        config.coins = vec!["bitcoin".into(), "ethereum".into()];

        config.save(&config_path).unwrap();

        let loaded = temp_env::with_vars_unset(
            vec!["COINGECKO_BASE_URL", "COINGECKO_API_KEY", "COINRISK_DB_PATH", "COINRISK_BIND"],
            || Config::from_file(&config_path).unwrap(),
        );
        assert_eq!(loaded.upstream.base_url, "http://127.0.0.1:9999");
        assert_eq!(loaded.coins, vec!["bitcoin".to_string(), "ethereum".to_string()]);
    }

    #[test]
    fn test_merge_env() {
        temp_env::with_vars(
            vec![
                ("COINGECKO_API_KEY", Some("CG-test")),
                ("COINRISK_DB_PATH", Some("/tmp/coinrisk-test.db")),
            ],
            || {
                let mut config = Config::default();
                config.merge_env().unwrap();

                assert_eq!(config.upstream.api_key, "CG-test");
                assert_eq!(config.store.db_path, "/tmp/coinrisk-test.db");
            },
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut c = Config::default();
        c.coins.push("eleventh".into());
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.risk.benchmark = "not-configured".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.upstream.market_timeout_secs = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.risk.default_window = 45;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.coins[0] = "Bit Coin".into();
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.store.max_busy_retries = MAX_BUSY_RETRIES;
        assert!(c.validate().is_ok());
        c.store.max_busy_retries = 64;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_resolve_window() {
        let risk = RiskConfig::default();
        assert_eq!(risk.resolve_window(Some("90")), 90);
        assert_eq!(risk.resolve_window(Some("365")), 365);
        assert_eq!(risk.resolve_window(Some("45")), 30);
        assert_eq!(risk.resolve_window(Some("abc")), 30);
        assert_eq!(risk.resolve_window(None), 30);
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = Config::default_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.coins, Config::default().coins);
    }
}
