//! Two-tier cache with explicit invalidation.
//!
//! L1 is a per-worker moka cache; L2 is the shared authoritative store
//! reached through the `/_internal/cache/*` system endpoints.  Every L2
//! write or delete publishes a note on the invalidation bus (and, through
//! the system endpoint handlers, on the `cache.invalidate.<namespace>`
//! channel) before success is reported; every worker's L1 evicts matching
//! entries on receipt.  Invalidation is best-effort: readers tolerate
//! transient staleness, and values that cannot afford it bypass L1.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::CacheConfig;

/// Channel prefix reserved for cache invalidation notifications.
pub const INVALIDATION_CHANNEL_PREFIX: &str = "cache.invalidate.";

/// Qualified key: `{scope_entity_id}:{namespace}:{key}`, or `global:` for
/// entries without a tenant scope.
pub fn qualify_key(scope_entity_id: Option<i64>, namespace: &str, key: &str) -> String {
    match scope_entity_id {
        Some(entity) => format!("{entity}:{namespace}:{key}"),
        None => format!("global:{namespace}:{key}"),
    }
}

/// The namespace component of a qualified key, used to pick the
/// invalidation channel.  Keys that do not follow the qualified shape fall
/// back to the whole key.
pub fn namespace_of(qualified_key: &str) -> &str {
    let mut parts = qualified_key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_scope), Some(namespace), Some(_rest)) => namespace,
        _ => qualified_key,
    }
}

/// One invalidation notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationNote {
    Key(String),
    Prefix(String),
}

/// Process-local fan-in for invalidation notes.  Notes produced by local
/// writers and notes arriving over the invalidation channel both land here.
#[derive(Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<InvalidationNote>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn publish(&self, note: InvalidationNote) {
        // Send only fails when no L1 plane is listening; nothing to evict.
        let _ = self.tx.send(note);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationNote> {
        self.tx.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

struct L2Entry {
    value: Value,
    version: u64,
    expires_at: Option<Instant>,
}

impl L2Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// The authoritative shared store.
pub struct L2Store {
    entries: DashMap<String, L2Entry>,
    version: AtomicU64,
}

impl L2Store {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            version: AtomicU64::new(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
        }
        // Expired rows are reaped on the read path.
        self.entries.remove_if(key, |_, e| e.is_expired());
        None
    }

    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> u64 {
        let version = self.version.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key.to_owned(),
            L2Entry {
                value,
                version,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        version
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every live entry under `prefix`; returns how many went.
    /// Concurrent inserts make the count approximate.
    pub fn flush_prefix(&self, prefix: &str) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len()) as u64
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.version)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for L2Store {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's view of the cache: private L1 over the shared L2.
///
/// Each plane spawns a listener draining the invalidation bus into L1
/// evictions, so planes on other workers see writes made through this one.
#[derive(Clone)]
pub struct CachePlane {
    l1: moka::sync::Cache<String, Value>,
    l2: Arc<L2Store>,
    bus: InvalidationBus,
    default_ttl: Duration,
}

impl CachePlane {
    pub fn new(config: &CacheConfig, l2: Arc<L2Store>, bus: InvalidationBus) -> Self {
        let l1: moka::sync::Cache<String, Value> = moka::sync::Cache::builder()
            .max_capacity(config.l1_max_entries)
            .time_to_live(Duration::from_secs(config.l1_default_ttl_secs))
            .build();

        let mut rx = bus.subscribe();
        let listener_l1 = l1.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(InvalidationNote::Key(key)) => {
                        listener_l1.invalidate(&key);
                    }
                    Ok(InvalidationNote::Prefix(prefix)) => {
                        // moka has no prefix invalidation; walk the keys.
                        let doomed: Vec<String> = listener_l1
                            .iter()
                            .filter(|(k, _)| k.starts_with(&prefix))
                            .map(|(k, _)| k.as_ref().clone())
                            .collect();
                        for key in doomed {
                            listener_l1.invalidate(&key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "invalidation listener lagged; flushing L1");
                        listener_l1.invalidate_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            l1,
            l2,
            bus,
            default_ttl: Duration::from_secs(config.l1_default_ttl_secs),
        }
    }

    /// L1 on hit; L2 round-trip on miss (populating L1).
    pub fn get(&self, qualified_key: &str) -> Option<Value> {
        if let Some(value) = self.l1.get(qualified_key) {
            return Some(value);
        }
        let value = self.l2.get(qualified_key)?;
        self.l1.insert(qualified_key.to_owned(), value.clone());
        Some(value)
    }

    /// Authoritative read that never consults L1; for values that cannot
    /// tolerate staleness.
    pub fn get_authoritative(&self, qualified_key: &str) -> Option<Value> {
        self.l2.get(qualified_key)
    }

    /// Write-through: L2 first, then the invalidation note, then success.
    pub fn set(&self, qualified_key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.or(Some(self.default_ttl));
        self.l2.set(qualified_key, value, ttl);
        self.bus
            .publish(InvalidationNote::Key(qualified_key.to_owned()));
        self.l1.invalidate(qualified_key);
    }

    pub fn delete(&self, qualified_key: &str) -> bool {
        let existed = self.l2.delete(qualified_key);
        self.bus
            .publish(InvalidationNote::Key(qualified_key.to_owned()));
        self.l1.invalidate(qualified_key);
        existed
    }

    /// Namespace or prefix wipe.
    pub fn flush_prefix(&self, prefix: &str) -> u64 {
        let flushed = self.l2.flush_prefix(prefix);
        self.bus
            .publish(InvalidationNote::Prefix(prefix.to_owned()));
        flushed
    }
}
