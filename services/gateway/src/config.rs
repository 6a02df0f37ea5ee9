//! Gateway configuration loading.
//!
//! TOML is the primary config source; `BIND_ADDR`, `DATABASE_URL` and
//! `LOG_LEVEL` environment variables override their TOML counterparts so the
//! binary can run in containers without a config file edit.
//! Default config path: `/etc/channel-gateway/gateway.toml`.
//!
//! # Required fields
//! - `auth.jwt_secret`
//!
//! Everything else has a documented default.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub tables: TablesConfig,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Tokio worker threads serving request traffic.
    pub worker_num: usize,
    /// Task worker loops draining the dispatch bus.
    pub task_worker_num: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_idle_secs: u64,
}

#[derive(Debug, Clone)]
pub struct TablesConfig {
    pub subscriptions_capacity: usize,
    pub sessions_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// When set, wire tokens arrive as `base64(jwt XOR key)`.
    pub jwt_xor_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    /// TTL for unacknowledged deliveries, in seconds.
    pub message_retention_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_max_entries: u64,
    pub l1_default_ttl_secs: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    tables: Option<RawTablesConfig>,
    auth: Option<RawAuthConfig>,
    store: Option<RawStoreConfig>,
    cache: Option<RawCacheConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    worker_num: Option<usize>,
    task_worker_num: Option<usize>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_idle_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTablesConfig {
    subscriptions_capacity: Option<usize>,
    sessions_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthConfig {
    jwt_secret: Option<String>,
    jwt_xor_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStoreConfig {
    database_url: Option<String>,
    message_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCacheConfig {
    l1_max_entries: Option<u64>,
    l1_default_ttl_secs: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO: {0}")]
    Io(String),
    #[error("config parse: {0}")]
    Parse(String),
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from the default path `/etc/channel-gateway/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/channel-gateway/gateway.toml"))
}

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string, applying defaults and env overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

fn default_worker_num() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get() * 2)
}

fn default_task_worker_num() -> usize {
    std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get)
}

fn validate(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let server = raw.server.unwrap_or_default();
    let tables = raw.tables.unwrap_or_default();
    let auth = raw.auth.unwrap_or_default();
    let store = raw.store.unwrap_or_default();
    let cache = raw.cache.unwrap_or_default();

    let jwt_secret = auth
        .jwt_secret
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingField("auth.jwt_secret"))?;

    let bind_override = std::env::var("BIND_ADDR").ok();
    let (host, port) = match bind_override.as_deref().and_then(|a| a.rsplit_once(':')) {
        Some((h, p)) => (
            h.to_owned(),
            p.parse::<u16>()
                .map_err(|e| ConfigError::Parse(format!("BIND_ADDR port: {e}")))?,
        ),
        None => (
            server.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
            server.port.unwrap_or(8420),
        ),
    };

    let database_url = std::env::var("DATABASE_URL")
        .ok()
        .or(store.database_url)
        .unwrap_or_else(|| "sqlite://gateway.db".to_owned());

    Ok(GatewayConfig {
        server: ServerConfig {
            host,
            port,
            worker_num: server.worker_num.unwrap_or_else(default_worker_num),
            task_worker_num: server.task_worker_num.unwrap_or_else(default_task_worker_num),
            heartbeat_interval_secs: server.heartbeat_interval_secs.unwrap_or(30),
            heartbeat_idle_secs: server.heartbeat_idle_secs.unwrap_or(65),
        },
        tables: TablesConfig {
            subscriptions_capacity: tables.subscriptions_capacity.unwrap_or(10_240),
            sessions_capacity: tables.sessions_capacity.unwrap_or(2_048),
        },
        auth: AuthConfig {
            jwt_secret,
            jwt_xor_key: auth.jwt_xor_key.filter(|k| !k.is_empty()),
        },
        store: StoreConfig {
            database_url,
            message_retention_secs: store.message_retention_secs.unwrap_or(604_800),
        },
        cache: CacheConfig {
            l1_max_entries: cache.l1_max_entries.unwrap_or(4_096),
            l1_default_ttl_secs: cache.l1_default_ttl_secs.unwrap_or(300),
        },
    })
}

impl GatewayConfig {
    /// A config suitable for tests: in-memory store, tiny heartbeat windows.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_owned(),
                port: 0,
                worker_num: 2,
                task_worker_num: 2,
                heartbeat_interval_secs: 30,
                heartbeat_idle_secs: 65,
            },
            tables: TablesConfig {
                subscriptions_capacity: 10_240,
                sessions_capacity: 2_048,
            },
            auth: AuthConfig {
                jwt_secret: jwt_secret.to_owned(),
                jwt_xor_key: None,
            },
            store: StoreConfig {
                database_url: "sqlite::memory:".to_owned(),
                message_retention_secs: 604_800,
            },
            cache: CacheConfig {
                l1_max_entries: 4_096,
                l1_default_ttl_secs: 300,
            },
        }
    }
}
