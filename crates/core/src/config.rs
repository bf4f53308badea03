//! Tablet configuration: an immutable snapshot plus a hot-reloadable
//! holder, using an `Arc`-swapped config object in place of global mutable
//! flags.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// An immutable configuration snapshot. Every tunable a running tablet
/// consults is a field here; nothing is read from a process-global flag.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletConfig {
    /// Maximum tolerated clock skew between nodes, used to size the hybrid
    /// clock's confidence window.
    pub max_clock_skew: Duration,
    /// Interval at which a transaction client sends a heartbeat to the
    /// status tablet coordinator.
    pub heartbeat_interval: Duration,
    /// How long a transaction may go without a heartbeat before the status
    /// tablet coordinator considers it expired.
    pub transaction_timeout: Duration,
    /// Deadline for a blocking `safe_time` wait.
    pub safe_time_wait_timeout: Duration,
    /// Number of rows processed per backfill chunk.
    pub backfill_chunk_size: usize,
    /// Throttle on backfill throughput, in bytes per second.
    pub backfill_rate_limit_bytes_per_sec: u64,
    /// Interval between sweeps of the intent-store cleaner looking for
    /// intents whose transaction has since committed or aborted.
    pub intent_cleanup_interval: Duration,
    /// Interval between history-retention (compaction-time GC) sweeps.
    pub history_retention_interval: Duration,
    /// Maximum size, in bytes, of a single write batch accepted by the
    /// write pipeline before it is rejected outright.
    pub max_write_batch_bytes: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        TabletConfig {
            max_clock_skew: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(1),
            transaction_timeout: Duration::from_secs(10),
            safe_time_wait_timeout: Duration::from_secs(5),
            backfill_chunk_size: 1000,
            backfill_rate_limit_bytes_per_sec: 10 * 1024 * 1024,
            intent_cleanup_interval: Duration::from_secs(1),
            history_retention_interval: Duration::from_secs(60),
            max_write_batch_bytes: 32 * 1024 * 1024,
        }
    }
}

/// A hot-reloadable holder for a [`TabletConfig`]: readers take a cheap
/// `Arc` snapshot via [`RuntimeConfig::current`], writers install a new
/// snapshot via [`RuntimeConfig::update`]. No individual field is ever
/// mutated in place, so a reader's snapshot is always internally
/// consistent even if a reload races with it.
pub struct RuntimeConfig {
    current: RwLock<Arc<TabletConfig>>,
}

impl RuntimeConfig {
    /// Wrap an initial configuration.
    pub fn new(initial: TabletConfig) -> Self {
        RuntimeConfig {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Borrow the current configuration snapshot.
    pub fn current(&self) -> Arc<TabletConfig> {
        self.current.read().clone()
    }

    /// Install a new configuration snapshot, replacing the old one
    /// atomically from the point of view of any reader.
    pub fn update(&self, new: TabletConfig) {
        *self.current.write() = Arc::new(new);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new(TabletConfig::default())
    }
}
