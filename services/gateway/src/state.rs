//! Process-wide shared state handed to every handler.

use chan_protocol::ServerFrame;
use dashmap::DashMap;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::auth::TokenVerifier;
use crate::cache::{CachePlane, InvalidationBus, L2Store};
use crate::config::GatewayConfig;
use crate::registry::HandlerRegistry;
use crate::tables::SharedTables;
use crate::tasks::TaskEnvelope;
use crate::util::MessageIdGen;

/// Outbound queue depth per connection.  A connection that cannot drain its
/// queue loses pushes; the persisted delivery rows make redelivery possible.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Task dispatch queue depth across all connections.
const TASK_QUEUE_DEPTH: usize = 1024;

/// Live connections and their outbound queues.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<DashMap<u64, mpsc::Sender<ServerFrame>>>,
}

impl ConnectionRegistry {
    pub fn register(&self, fd: u64) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        self.conns.insert(fd, tx);
        rx
    }

    pub fn unregister(&self, fd: u64) {
        self.conns.remove(&fd);
    }

    pub fn is_connected(&self, fd: u64) -> bool {
        self.conns.contains_key(&fd)
    }

    /// Push one frame to a connection's outbound queue.  Returns false when
    /// the connection is gone or its queue is full.
    pub fn push(&self, fd: u64, frame: ServerFrame) -> bool {
        let Some(tx) = self.conns.get(&fd) else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(fd, "outbound queue full; dropping push");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pool: SqlitePool,
    pub tables: Arc<SharedTables>,
    pub connections: ConnectionRegistry,
    pub registry: Arc<HandlerRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub cache_l2: Arc<L2Store>,
    pub invalidation_bus: InvalidationBus,
    /// Cache plane used by request-worker handlers; task workers hold their
    /// own planes over the same L2 and bus.
    pub cache: CachePlane,
    pub ids: Arc<MessageIdGen>,
    task_tx: mpsc::Sender<TaskEnvelope>,
    task_rx: Arc<Mutex<Option<mpsc::Receiver<TaskEnvelope>>>>,
    next_task_id: Arc<AtomicU64>,
    next_fd: Arc<AtomicU64>,
}

impl AppState {
    /// Allocate all shared structures.  Must run inside a tokio runtime
    /// (the cache plane spawns its invalidation listener).
    pub fn new(config: GatewayConfig, pool: SqlitePool, registry: HandlerRegistry) -> Self {
        let tables = Arc::new(SharedTables::new(
            config.tables.subscriptions_capacity,
            config.tables.sessions_capacity,
        ));
        let verifier = Arc::new(TokenVerifier::new(
            &config.auth.jwt_secret,
            config.auth.jwt_xor_key.as_deref(),
        ));
        let cache_l2 = Arc::new(L2Store::new());
        let invalidation_bus = InvalidationBus::new();
        let cache = CachePlane::new(&config.cache, cache_l2.clone(), invalidation_bus.clone());
        let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_DEPTH);

        Self {
            config: Arc::new(config),
            pool,
            tables,
            connections: ConnectionRegistry::default(),
            registry: Arc::new(registry),
            verifier,
            cache_l2,
            invalidation_bus,
            cache,
            ids: Arc::new(MessageIdGen::new()),
            task_tx,
            task_rx: Arc::new(Mutex::new(Some(task_rx))),
            next_task_id: Arc::new(AtomicU64::new(1)),
            next_fd: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn next_fd(&self) -> u64 {
        self.next_fd.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn task_sender(&self) -> mpsc::Sender<TaskEnvelope> {
        self.task_tx.clone()
    }

    /// Hand the task queue receiver to the worker pool; callable once.
    pub async fn take_task_receiver(&self) -> Option<mpsc::Receiver<TaskEnvelope>> {
        self.task_rx.lock().await.take()
    }
}
