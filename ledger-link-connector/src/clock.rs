use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

/// Wall clock with an adjustable offset, shared between the connector and the
/// ledger engine.
///
/// Clones observe the same offset, so correcting the clock once (for example
/// after comparing with a node's reported time) affects every transport built
/// from the same [`ConnectionContext`](crate::connection::ConnectionContext).
#[derive(Debug, Clone, Default)]
pub struct Clock {
    offset_ms: Arc<AtomicI64>,
}

impl Clock {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(offset_ms)),
        }
    }

    /// Clock offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Current time in milliseconds, offset applied.
    pub fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.offset_ms()
    }

    /// Current time in whole seconds, offset applied.
    pub fn now_sec(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}
