//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/flagstream/relay.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - At least one `[[environments]]` entry with an `sdk_key`
//!
//! Upstream URIs default to the hosted service and can be overridden both
//! globally and per environment.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub schema_version: u32,
    pub bind: String,
    pub upstream: UpstreamConfig,
    pub streams: StreamConfig,
    pub events: EventsConfig,
    pub environments: Vec<EnvironmentConfig>,
}

/// Upstream service endpoints, shared by every environment unless
/// overridden per environment.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Polling and flag-request base, e.g. `https://sdk.launchdarkly.com`.
    pub base_uri: String,
    /// Streaming base, e.g. `https://stream.launchdarkly.com`.
    pub stream_uri: String,
    /// Event delivery base, e.g. `https://events.launchdarkly.com`.
    pub events_uri: String,
    /// Use polling instead of streaming for flag data.
    pub polling: bool,
    /// Polling interval; clamped to at least one second.
    pub poll_interval: Duration,
    /// Total timeout for non-streaming upstream requests.
    pub init_timeout: Duration,
}

/// Fan-out behavior for SDK-facing streams.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Interval between SSE heartbeat comment lines.
    pub heartbeat_interval: Duration,
    /// When set, every subscription is closed after this long; clients
    /// reconnect normally.
    pub max_connection_time: Option<Duration>,
}

/// Event relay behavior.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Disables all event endpoints when false (they respond 503).
    pub enabled: bool,
    /// Time-based flush interval for event queues.
    pub flush_interval: Duration,
    /// Maximum queued events per publisher partition.
    pub capacity: usize,
    /// Bound on the per-partition recently-seen user key set.
    pub user_keys_capacity: usize,
    /// Per-send request timeout.
    pub send_timeout: Duration,
}

/// One environment: an isolated flag dataset with up to three credentials.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub name: String,
    pub sdk_key: String,
    pub mobile_key: Option<String>,
    pub env_id: Option<String>,
    /// Cache TTL for a persistent store wrapping this environment.
    /// `None` means no persistent store; `Some(ZERO)` means infinite TTL.
    pub ttl: Option<Duration>,
    pub secure_mode: bool,
    /// Per-environment overrides of the shared upstream URIs.
    pub stream_uri: Option<String>,
    pub base_uri: Option<String>,
    pub events_uri: Option<String>,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    relay: Option<RawRelayConfig>,
    upstream: Option<RawUpstreamConfig>,
    streams: Option<RawStreamConfig>,
    events: Option<RawEventsConfig>,
    environments: Option<Vec<RawEnvironmentConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawRelayConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpstreamConfig {
    base_uri: Option<String>,
    stream_uri: Option<String>,
    events_uri: Option<String>,
    polling: Option<bool>,
    poll_interval_secs: Option<u64>,
    init_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStreamConfig {
    heartbeat_interval_secs: Option<u64>,
    max_connection_time_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEventsConfig {
    enabled: Option<bool>,
    flush_interval_secs: Option<u64>,
    capacity: Option<usize>,
    user_keys_capacity: Option<usize>,
    send_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEnvironmentConfig {
    name: Option<String>,
    sdk_key: Option<String>,
    mobile_key: Option<String>,
    env_id: Option<String>,
    ttl_secs: Option<u64>,
    infinite_ttl: Option<bool>,
    secure_mode: Option<bool>,
    stream_uri: Option<String>,
    base_uri: Option<String>,
    events_uri: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from the default path `/etc/flagstream/relay.toml`.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/flagstream/relay.toml"))
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let bind = raw
        .relay
        .and_then(|r| r.bind)
        .unwrap_or_else(|| "0.0.0.0:8030".to_owned());

    let upstream = match raw.upstream {
        Some(u) => UpstreamConfig {
            base_uri: normalize_uri(
                u.base_uri
                    .unwrap_or_else(|| "https://sdk.launchdarkly.com".to_owned()),
            ),
            stream_uri: normalize_uri(
                u.stream_uri
                    .unwrap_or_else(|| "https://stream.launchdarkly.com".to_owned()),
            ),
            events_uri: normalize_uri(
                u.events_uri
                    .unwrap_or_else(|| "https://events.launchdarkly.com".to_owned()),
            ),
            polling: u.polling.unwrap_or(false),
            // A sub-second interval would hammer upstream; clamp.
            poll_interval: Duration::from_secs(u.poll_interval_secs.unwrap_or(30).max(1)),
            init_timeout: Duration::from_secs(u.init_timeout_secs.unwrap_or(3)),
        },
        None => UpstreamConfig {
            base_uri: "https://sdk.launchdarkly.com".to_owned(),
            stream_uri: "https://stream.launchdarkly.com".to_owned(),
            events_uri: "https://events.launchdarkly.com".to_owned(),
            polling: false,
            poll_interval: Duration::from_secs(30),
            init_timeout: Duration::from_secs(3),
        },
    };

    let streams = match raw.streams {
        Some(s) => StreamConfig {
            heartbeat_interval: Duration::from_secs(s.heartbeat_interval_secs.unwrap_or(180)),
            max_connection_time: s.max_connection_time_secs.map(Duration::from_secs),
        },
        None => StreamConfig {
            heartbeat_interval: Duration::from_secs(180),
            max_connection_time: None,
        },
    };

    let events = match raw.events {
        Some(e) => EventsConfig {
            enabled: e.enabled.unwrap_or(true),
            flush_interval: Duration::from_secs(e.flush_interval_secs.unwrap_or(5)),
            capacity: e.capacity.unwrap_or(1000),
            user_keys_capacity: e.user_keys_capacity.unwrap_or(1000),
            send_timeout: Duration::from_secs(e.send_timeout_secs.unwrap_or(10)),
        },
        None => EventsConfig {
            enabled: true,
            flush_interval: Duration::from_secs(5),
            capacity: 1000,
            user_keys_capacity: 1000,
            send_timeout: Duration::from_secs(10),
        },
    };

    let raw_envs = raw
        .environments
        .ok_or_else(|| ConfigError::MissingField("environments".to_owned()))?;
    if raw_envs.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[environments]] entry is required".to_owned(),
        ));
    }

    let mut environments = Vec::with_capacity(raw_envs.len());
    for (i, e) in raw_envs.into_iter().enumerate() {
        let name = e
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("environments[{}].name", i)))?;
        let sdk_key = e
            .sdk_key
            .ok_or_else(|| ConfigError::MissingField(format!("environments[{}].sdk_key", i)))?;
        if sdk_key.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "environments[{}].sdk_key must not be empty",
                i
            )));
        }
        let ttl = match (e.infinite_ttl.unwrap_or(false), e.ttl_secs) {
            (true, _) => Some(Duration::ZERO),
            (false, Some(secs)) => Some(Duration::from_secs(secs)),
            (false, None) => None,
        };
        environments.push(EnvironmentConfig {
            name,
            sdk_key,
            mobile_key: e.mobile_key.filter(|k| !k.is_empty()),
            env_id: e.env_id.filter(|k| !k.is_empty()),
            ttl,
            secure_mode: e.secure_mode.unwrap_or(false),
            stream_uri: e.stream_uri.map(normalize_uri),
            base_uri: e.base_uri.map(normalize_uri),
            events_uri: e.events_uri.map(normalize_uri),
        });
    }

    // Duplicate credentials would make environment lookup ambiguous.
    for i in 0..environments.len() {
        for j in (i + 1)..environments.len() {
            if environments[i].sdk_key == environments[j].sdk_key {
                return Err(ConfigError::InvalidValue(format!(
                    "environments '{}' and '{}' share an sdk_key",
                    environments[i].name, environments[j].name
                )));
            }
        }
    }

    Ok(RelayConfig {
        schema_version,
        bind,
        upstream,
        streams,
        events,
        environments,
    })
}

fn normalize_uri(uri: String) -> String {
    uri.trim_end_matches('/').to_owned()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
