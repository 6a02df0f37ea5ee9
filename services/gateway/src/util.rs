use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unix timestamp in milliseconds; every outbound envelope carries one.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message id generator: globally unique, monotonic within this process.
///
/// Ids are `m<node:08x>-<seq:012x>`; the node component is random per
/// process so two gateways sharing a store never collide, and the sequence
/// component makes ids assigned by one publisher worker strictly monotonic.
pub struct MessageIdGen {
    node: u32,
    seq: AtomicU64,
}

impl MessageIdGen {
    pub fn new() -> Self {
        Self {
            node: rand::thread_rng().gen(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("m{:08x}-{:012x}", self.node, seq)
    }
}

impl Default for MessageIdGen {
    fn default() -> Self {
        Self::new()
    }
}
