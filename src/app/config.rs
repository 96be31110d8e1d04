//! Application configuration: TOML file plus environment overrides.
//!
//! The file carries topology (venues, endpoints, tuning); the environment
//! carries deployment specifics: `WORKER_COUNT`, `MAX_CONNECTIONS`,
//! `LOG_LEVEL`, `REDIS_HOST`/`PORT`/`DB`/`PASSWORD` for the optional
//! snapshot mirror, and `<VENUE>_API_KEY` credentials (market data is
//! public; keys are optional). Bad configuration is fatal before any
//! socket opens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cache::CacheConfig;
use crate::detector::DetectorConfig;
use crate::domain::Exchange;
use crate::error::{ConfigError, Result};
use crate::exchange::bingx::BingxConfig;
use crate::exchange::ramzinex::RamzinexConfig;
use crate::exchange::supervisor::SupervisorConfig;
use crate::exchange::wallex::WallexConfig;
use crate::hub::HubConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// TOML export of the markets + aliases metadata tables.
    #[serde(default = "default_metadata_file")]
    pub metadata_file: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub detector: DetectorSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub exchanges: ExchangesSettings,
    /// Optional external hot-store mirror for the HTTP snapshot layer.
    /// Populated from `REDIS_*`; never on the detection path.
    #[serde(skip)]
    pub mirror: Option<MirrorConfig>,
    /// Per-venue credentials from `<VENUE>_API_KEY`.
    #[serde(skip)]
    pub api_keys: HashMap<Exchange, String>,
}

fn default_metadata_file() -> PathBuf {
    PathBuf::from("markets.toml")
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Dashboard WebSocket bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8765".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Global minimum profit percentage; per-pair metadata can override.
    #[serde(default)]
    pub min_profit: Decimal,
}

fn default_workers() -> usize {
    8
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            min_profit: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl_secs")]
    pub opportunity_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            opportunity_ttl_secs: default_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_session_queue() -> usize {
    1024
}

fn default_batch_max() -> usize {
    64
}

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_stats_interval_secs() -> u64 {
    30
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            session_queue: default_session_queue(),
            batch_max: default_batch_max(),
            batch_interval_ms: default_batch_interval_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reset_after_secs")]
    pub reset_after_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_subscribe_timeout_secs")]
    pub subscribe_timeout_secs: u64,
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
    #[serde(default = "default_max_decode_errors")]
    pub max_decode_errors_per_min: u32,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_reset_after_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_subscribe_timeout_secs() -> u64 {
    10
}

fn default_stale_grace_secs() -> u64 {
    30
}

fn default_max_decode_errors() -> u32 {
    5
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            reset_after_secs: default_reset_after_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            subscribe_timeout_secs: default_subscribe_timeout_secs(),
            stale_grace_secs: default_stale_grace_secs(),
            max_decode_errors_per_min: default_max_decode_errors(),
        }
    }
}

/// Which venues to run, with their endpoints. A venue absent from the
/// config is simply not collected.
#[derive(Debug, Default, Deserialize)]
pub struct ExchangesSettings {
    pub bingx: Option<BingxSettings>,
    pub wallex: Option<WallexSettings>,
    pub ramzinex: Option<RamzinexSettings>,
}

#[derive(Debug, Deserialize)]
pub struct BingxSettings {
    #[serde(default = "default_bingx_ws")]
    pub ws_url: String,
    /// `incrDepth` reconstruction instead of server-side `bookTicker`.
    #[serde(default)]
    pub incremental_depth: bool,
    #[serde(default = "default_bingx_topics")]
    pub max_topics_per_socket: usize,
    /// Per-venue socket cap; `MAX_CONNECTIONS` lowers it further.
    #[serde(default = "default_bingx_sockets")]
    pub max_sockets: usize,
}

fn default_bingx_ws() -> String {
    BingxConfig::default().ws_url
}

fn default_bingx_topics() -> usize {
    crate::exchange::bingx::MAX_TOPICS_PER_SOCKET
}

fn default_bingx_sockets() -> usize {
    crate::exchange::bingx::MAX_SOCKETS
}

#[derive(Debug, Deserialize)]
pub struct WallexSettings {
    #[serde(default = "default_wallex_ws")]
    pub ws_url: String,
    #[serde(default = "default_wallex_api")]
    pub api_url: String,
}

fn default_wallex_ws() -> String {
    WallexConfig::default().ws_url
}

fn default_wallex_api() -> String {
    WallexConfig::default().api_url
}

#[derive(Debug, Deserialize)]
pub struct RamzinexSettings {
    #[serde(default = "default_ramzinex_ws")]
    pub ws_url: String,
}

fn default_ramzinex_ws() -> String {
    RamzinexConfig::default().ws_url
}

/// External hot-store location, for the surrounding HTTP application.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let mut config: Self = toml::from_str(&content).map_err(ConfigError::Parse)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the file for deployment-specific knobs.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(count) = std::env::var("WORKER_COUNT") {
            self.detector.workers = count.parse().map_err(|_| ConfigError::Invalid {
                field: "WORKER_COUNT",
                reason: format!("not a number: {count:?}"),
            })?;
        }
        if let Ok(cap) = std::env::var("MAX_CONNECTIONS") {
            let cap: usize = cap.parse().map_err(|_| ConfigError::Invalid {
                field: "MAX_CONNECTIONS",
                reason: format!("not a number: {cap:?}"),
            })?;
            if let Some(bingx) = &mut self.exchanges.bingx {
                bingx.max_sockets = bingx.max_sockets.min(cap);
            }
        }

        for exchange in Exchange::ALL {
            let var = format!("{}_API_KEY", exchange.as_str().to_ascii_uppercase());
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    self.api_keys.insert(exchange, key);
                }
            }
        }

        if let Ok(host) = std::env::var("REDIS_HOST") {
            let port = match std::env::var("REDIS_PORT") {
                Ok(p) => p.parse().map_err(|_| ConfigError::Invalid {
                    field: "REDIS_PORT",
                    reason: format!("not a port: {p:?}"),
                })?,
                Err(_) => 6379,
            };
            let db = match std::env::var("REDIS_DB") {
                Ok(d) => d.parse().map_err(|_| ConfigError::Invalid {
                    field: "REDIS_DB",
                    reason: format!("not a database index: {d:?}"),
                })?,
                Err(_) => 0,
            };
            self.mirror = Some(MirrorConfig {
                host,
                port,
                db,
                password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            });
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn validate(&self) -> Result<()> {
        if self.server.bind.is_empty() {
            return Err(ConfigError::MissingField { field: "server.bind" }.into());
        }
        if self.detector.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "detector.workers",
                reason: "must be at least 1".into(),
            }
            .into());
        }
        if self.cache.opportunity_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.opportunity_ttl_secs",
                reason: "must be positive".into(),
            }
            .into());
        }
        if self.exchanges.bingx.is_none()
            && self.exchanges.wallex.is_none()
            && self.exchanges.ramzinex.is_none()
        {
            return Err(ConfigError::MissingField { field: "exchanges" }.into());
        }
        Ok(())
    }

    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.logging.level));
        match self.logging.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).init(),
            _ => fmt().with_env_filter(filter).init(),
        }
    }

    #[must_use]
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            workers: self.detector.workers,
            min_profit: self.detector.min_profit,
        }
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            opportunity_ttl: Duration::from_secs(self.cache.opportunity_ttl_secs),
        }
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            session_queue: self.hub.session_queue,
            batch_max: self.hub.batch_max,
            batch_interval: Duration::from_millis(self.hub.batch_interval_ms),
            stats_interval: Duration::from_secs(self.hub.stats_interval_secs),
        }
    }

    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            reset_after: Duration::from_secs(self.reconnect.reset_after_secs),
            idle_timeout: Duration::from_secs(self.reconnect.idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.reconnect.connect_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.reconnect.subscribe_timeout_secs),
            stale_grace: Duration::from_secs(self.reconnect.stale_grace_secs),
            max_decode_errors_per_min: self.reconnect.max_decode_errors_per_min,
        }
    }

    #[must_use]
    pub fn bingx_config(&self) -> Option<BingxConfig> {
        self.exchanges.bingx.as_ref().map(|s| BingxConfig {
            ws_url: s.ws_url.clone(),
            incremental_depth: s.incremental_depth,
            max_topics_per_socket: s.max_topics_per_socket,
            max_sockets: s.max_sockets,
        })
    }

    #[must_use]
    pub fn wallex_config(&self) -> Option<WallexConfig> {
        self.exchanges.wallex.as_ref().map(|s| WallexConfig {
            ws_url: s.ws_url.clone(),
            api_url: s.api_url.clone(),
            api_key: self.api_keys.get(&Exchange::Wallex).cloned(),
        })
    }

    #[must_use]
    pub fn ramzinex_config(&self) -> Option<RamzinexConfig> {
        self.exchanges.ramzinex.as_ref().map(|s| RamzinexConfig {
            ws_url: s.ws_url.clone(),
        })
    }

    /// External mirror location for the HTTP snapshot layer, if deployed.
    #[must_use]
    pub fn mirror(&self) -> Option<&MirrorConfig> {
        self.mirror.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Config {
        let mut config: Config = toml::from_str(content).unwrap();
        config.validate().unwrap();
        config
    }

    const MINIMAL: &str = r#"
        [exchanges.wallex]
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.bind, "127.0.0.1:8765");
        assert_eq!(config.detector.workers, 8);
        assert_eq!(config.cache.opportunity_ttl_secs, 60);
        assert_eq!(config.hub.session_queue, 1024);
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 60_000);
    }

    #[test]
    fn venue_sections_select_collectors() {
        let config = parse(
            r#"
            [exchanges.bingx]
            incremental_depth = true

            [exchanges.ramzinex]
            ws_url = "wss://example.test/websocket"
        "#,
        );
        let bingx = config.bingx_config().unwrap();
        assert!(bingx.incremental_depth);
        assert_eq!(bingx.max_topics_per_socket, 200);
        assert_eq!(bingx.max_sockets, 60);
        assert_eq!(
            config.ramzinex_config().unwrap().ws_url,
            "wss://example.test/websocket"
        );
        assert!(config.wallex_config().is_none());
    }

    #[test]
    fn no_venues_is_fatal() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_workers_is_fatal() {
        let config: Config = toml::from_str(
            r#"
            [detector]
            workers = 0

            [exchanges.wallex]
        "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn durations_convert_into_component_configs() {
        let config = parse(
            r#"
            [cache]
            opportunity_ttl_secs = 10

            [hub]
            batch_interval_ms = 50

            [reconnect]
            initial_delay_ms = 250

            [exchanges.wallex]
        "#,
        );
        assert_eq!(config.cache_config().opportunity_ttl, Duration::from_secs(10));
        assert_eq!(config.hub_config().batch_interval, Duration::from_millis(50));
        assert_eq!(
            config.supervisor_config().initial_delay,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn min_profit_parses_as_decimal() {
        let config = parse(
            r#"
            [detector]
            min_profit = "0.5"

            [exchanges.wallex]
        "#,
        );
        assert_eq!(config.detector.min_profit, Decimal::new(5, 1));
    }
}
