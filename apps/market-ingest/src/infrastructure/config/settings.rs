//! Ingest Configuration Settings
//!
//! Configuration types for the ingestion pipeline, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::ports::StoreKeys;
use crate::application::services::CacheConfig;
use crate::domain::subscription::{InvalidStreamId, StreamId};
use crate::infrastructure::binance::messages::AccountType;
use crate::infrastructure::connection::{ConnectionConfig, LivenessConfig, ReconnectConfig};

/// Stream endpoint and link timing.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Account type, which selects the default endpoint.
    pub account_type: AccountType,
    /// Endpoint dialed; defaults to the account type's URL.
    pub url: String,
    /// Streams subscribed at startup, in order.
    pub streams: Vec<StreamId>,
    /// Dial plus handshake deadline.
    pub handshake_timeout: Duration,
    /// Spacing between replayed subscribe frames.
    pub replay_interval: Duration,
    /// Silence tolerated before the link is declared dead.
    pub read_timeout: Duration,
    /// Deadline for answering a probe.
    pub pong_deadline: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let account_type = AccountType::UsdMFutureTestnet;
        Self {
            account_type,
            url: account_type.ws_url().to_string(),
            streams: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            replay_interval: Duration::from_millis(300),
            read_timeout: Duration::from_secs(600),
            pong_deadline: Duration::from_secs(5),
        }
    }
}

/// Order cache namespace and cadence.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Strategy component of the store namespace.
    pub strategy_id: String,
    /// User component of the store namespace.
    pub user_id: String,
    /// Periodic sync cadence.
    pub sync_interval: Duration,
    /// Periodic cleanup cadence.
    pub cleanup_interval: Duration,
    /// In-memory order lifetime.
    pub order_ttl: Duration,
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Stream endpoint and link timing.
    pub stream: StreamSettings,
    /// Backoff between redials.
    pub reconnect: ReconnectConfig,
    /// Order cache settings.
    pub cache: CacheSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or empty, a value
    /// does not parse, or [`validate`](Self::validate) fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let account_type = match env.get("INGEST_ACCOUNT_TYPE") {
            Some(raw) => raw
                .parse::<AccountType>()
                .map_err(|_| ConfigError::invalid("INGEST_ACCOUNT_TYPE", &raw))?,
            None => StreamSettings::default().account_type,
        };
        let url = env
            .get("INGEST_WS_URL")
            .unwrap_or_else(|| account_type.ws_url().to_string());
        let streams = env
            .get("INGEST_STREAMS")
            .map(|raw| parse_streams(&raw))
            .transpose()?
            .unwrap_or_default();

        let defaults = StreamSettings::default();
        let stream = StreamSettings {
            account_type,
            url,
            streams,
            handshake_timeout: env.secs("INGEST_HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout)?,
            replay_interval: env.millis("INGEST_REPLAY_INTERVAL_MS", defaults.replay_interval)?,
            read_timeout: env.secs("INGEST_READ_TIMEOUT_SECS", defaults.read_timeout)?,
            pong_deadline: env.secs("INGEST_PONG_DEADLINE_SECS", defaults.pong_deadline)?,
        };

        let defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: env.millis("INGEST_RECONNECT_BASE_MS", defaults.base_delay)?,
            max_delay: env.secs("INGEST_RECONNECT_MAX_DELAY_SECS", defaults.max_delay)?,
            multiplier: env.parse("INGEST_RECONNECT_MULTIPLIER", defaults.multiplier)?,
            jitter_factor: env.parse("INGEST_RECONNECT_JITTER", defaults.jitter_factor)?,
            max_attempts: env.parse("INGEST_MAX_RECONNECT_ATTEMPTS", defaults.max_attempts)?,
        };

        let sync_interval = env.secs("INGEST_SYNC_INTERVAL_SECS", Duration::from_secs(5))?;
        let cache = CacheSettings {
            strategy_id: env.required("INGEST_STRATEGY_ID")?,
            user_id: env.required("INGEST_USER_ID")?,
            sync_interval,
            cleanup_interval: env.secs("INGEST_CLEANUP_INTERVAL_SECS", sync_interval)?,
            order_ttl: env.secs("INGEST_ORDER_TTL_SECS", Duration::from_secs(24 * 60 * 60))?,
        };

        let server = ServerSettings {
            health_port: env.parse("INGEST_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let config = Self {
            stream,
            reconnect,
            cache,
            server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Constraint`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let stream = &self.stream;
        if stream.url.trim().is_empty() {
            return Err(ConfigError::Constraint("stream URL cannot be empty".into()));
        }
        if stream.pong_deadline >= stream.read_timeout {
            return Err(ConfigError::Constraint(format!(
                "pong deadline ({:?}) must be shorter than read timeout ({:?})",
                stream.pong_deadline, stream.read_timeout
            )));
        }
        for (name, value) in [
            ("handshake timeout", stream.handshake_timeout),
            ("replay interval", stream.replay_interval),
            ("reconnect base delay", self.reconnect.base_delay),
            ("sync interval", self.cache.sync_interval),
            ("cleanup interval", self.cache.cleanup_interval),
            ("order TTL", self.cache.order_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Constraint(format!("{name} must be non-zero")));
            }
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Constraint(
                "max reconnect attempts must be at least 1".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Constraint(
                "reconnect multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter_factor) {
            return Err(ConfigError::Constraint(
                "reconnect jitter must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Connection manager settings.
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.stream.url.clone(),
            handshake_timeout: self.stream.handshake_timeout,
            reconnect: self.reconnect.clone(),
            liveness: LivenessConfig::new(self.stream.read_timeout, self.stream.pong_deadline),
            replay_interval: self.stream.replay_interval,
        }
    }

    /// Store key namespace: `<strategy>:<user>:<accountType>`.
    #[must_use]
    pub fn store_keys(&self) -> StoreKeys {
        StoreKeys::new(
            &self.cache.strategy_id,
            &self.cache.user_id,
            self.stream.account_type.as_str(),
        )
    }

    /// Order cache settings.
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            keys: self.store_keys(),
            sync_interval: self.cache.sync_interval,
            cleanup_interval: self.cache.cleanup_interval,
            order_ttl: self.cache.order_ttl,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable does not parse.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
    /// A stream identifier in `INGEST_STREAMS` is malformed.
    #[error("invalid stream in INGEST_STREAMS: {0}")]
    InvalidStream(#[from] InvalidStreamId),
    /// Values parse but are inconsistent.
    #[error("invalid configuration: {0}")]
    Constraint(String),
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.get(key).map_or(Ok(default), |raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, &raw))
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |raw| parse_u64(key, &raw).map(Duration::from_secs))
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.get(key)
            .map_or(Ok(default), |raw| parse_u64(key, &raw).map(Duration::from_millis))
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, raw))
}

fn parse_streams(raw: &str) -> Result<Vec<StreamId>, ConfigError> {
    let mut streams: Vec<StreamId> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id = StreamId::new(part)?;
        if !streams.contains(&id) {
            streams.push(id);
        }
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<IngestConfig, ConfigError> {
        let mut map: HashMap<String, String> = HashMap::from([
            ("INGEST_STRATEGY_ID".to_string(), "grid".to_string()),
            ("INGEST_USER_ID".to_string(), "u1".to_string()),
        ]);
        for (k, v) in vars {
            map.insert((*k).to_string(), (*v).to_string());
        }
        IngestConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.stream.account_type, AccountType::UsdMFutureTestnet);
        assert_eq!(config.stream.url, "wss://stream.binancefuture.com/ws");
        assert!(config.stream.streams.is_empty());
        assert_eq!(config.stream.replay_interval, Duration::from_millis(300));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.cache.sync_interval, Duration::from_secs(5));
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(5));
        assert_eq!(config.cache.order_ttl, Duration::from_secs(86_400));
        assert_eq!(config.server.health_port, 8083);
    }

    #[test]
    fn account_type_selects_url_unless_overridden() {
        let config = load(&[("INGEST_ACCOUNT_TYPE", "spot")]).unwrap();
        assert_eq!(config.stream.url, "wss://stream.binance.com:9443/ws");
        assert_eq!(config.store_keys().prefix(), "grid:u1:SPOT");

        let config = load(&[
            ("INGEST_ACCOUNT_TYPE", "SPOT"),
            ("INGEST_WS_URL", "ws://127.0.0.1:9000/ws"),
        ])
        .unwrap();
        assert_eq!(config.stream.url, "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn streams_are_parsed_in_order_without_duplicates() {
        let config = load(&[(
            "INGEST_STREAMS",
            "btcusdt@trade, ethusdt@bookTicker,btcusdt@trade,",
        )])
        .unwrap();
        let streams: Vec<&str> = config.stream.streams.iter().map(StreamId::as_str).collect();
        assert_eq!(streams, vec!["btcusdt@trade", "ethusdt@bookTicker"]);
    }

    #[test]
    fn cleanup_defaults_to_sync_interval() {
        let config = load(&[("INGEST_SYNC_INTERVAL_SECS", "2")]).unwrap();
        assert_eq!(config.cache.cleanup_interval, Duration::from_secs(2));
    }

    #[test]
    fn missing_namespace_is_rejected() {
        let err = IngestConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "INGEST_STRATEGY_ID"));

        let err = load(&[("INGEST_USER_ID", " ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(k) if k == "INGEST_USER_ID"));
    }

    #[test]
    fn unparseable_values_are_rejected() {
        assert!(matches!(
            load(&[("INGEST_REPLAY_INTERVAL_MS", "fast")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("INGEST_ACCOUNT_TYPE", "moon")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn pong_deadline_must_be_shorter_than_read_timeout() {
        let err = load(&[
            ("INGEST_READ_TIMEOUT_SECS", "5"),
            ("INGEST_PONG_DEADLINE_SECS", "5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Constraint(_)));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(load(&[("INGEST_SYNC_INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[("INGEST_MAX_RECONNECT_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn derived_component_configs() {
        let config = load(&[
            ("INGEST_READ_TIMEOUT_SECS", "30"),
            ("INGEST_PONG_DEADLINE_SECS", "2"),
        ])
        .unwrap();

        let connection = config.connection();
        assert_eq!(connection.liveness.read_timeout, Duration::from_secs(30));
        assert_eq!(connection.liveness.pong_deadline, Duration::from_secs(2));
        assert_eq!(connection.reconnect, config.reconnect);

        let cache = config.cache_config();
        assert_eq!(cache.keys.orders(), "grid:u1:USD_M_FUTURE_TESTNET:orders");
    }
}
