//! Hybrid time: the monotonic logical clock used to order every record and
//! every read across the cluster.
//!
//! A [`HybridTime`] packs physical microseconds into the high bits and a
//! logical tie-breaking counter into the low bits, so two hybrid times
//! derived from the same physical microsecond are still totally ordered.
//! [`DocHybridTime`] additionally carries the write id a transaction assigns
//! to each write in a batch, and encodes canonically into a variable-length,
//! order-preserving byte suffix used by [`crate::key::SubDocKey`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of low bits reserved for the logical counter.
const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1u64 << LOGICAL_BITS) - 1;

/// A 64-bit hybrid logical timestamp: physical microseconds in the high
/// bits, a logical counter in the low [`LOGICAL_BITS`] bits.
///
/// Totally ordered by the natural `u64` ordering of the packed value, which
/// is exactly why physical time occupies the high bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime(u64);

impl HybridTime {
    /// The distinguished minimum value, below every real timestamp.
    pub const MIN: HybridTime = HybridTime(0);

    /// The distinguished maximum value, above every real timestamp.
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);

    /// A distinguished "invalid" sentinel, returned by e.g. a timed-out
    /// `safe_time` call.
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    /// Pack a physical-microseconds/logical-counter pair into a hybrid time.
    ///
    /// # Panics
    ///
    /// Panics if `logical` does not fit in [`LOGICAL_BITS`] bits.
    pub fn pack(physical_micros: u64, logical: u32) -> Self {
        assert!(
            (logical as u64) <= LOGICAL_MASK,
            "logical counter overflowed {LOGICAL_BITS} bits"
        );
        HybridTime((physical_micros << LOGICAL_BITS) | logical as u64)
    }

    /// Wrap a raw packed `u64` value as-is (used when decoding from bytes).
    pub const fn from_raw(raw: u64) -> Self {
        HybridTime(raw)
    }

    /// The raw packed value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The physical-microseconds component.
    pub const fn physical_micros(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// The logical-counter component.
    pub const fn logical(&self) -> u32 {
        (self.0 & LOGICAL_MASK) as u32
    }

    /// Whether this is the [`HybridTime::INVALID`] sentinel.
    pub fn is_valid(&self) -> bool {
        *self != HybridTime::INVALID
    }

    /// The smallest hybrid time strictly greater than `self` that keeps the
    /// same physical component (or rolls over into the next physical tick).
    pub fn incremented(&self) -> HybridTime {
        HybridTime(self.0.saturating_add(1))
    }
}

impl Default for HybridTime {
    fn default() -> Self {
        HybridTime::MIN
    }
}

/// A doc hybrid time: a [`HybridTime`] plus the intra-transaction write id
/// assigned to one write within a batch, and the write batch's leader term
/// (used only to disambiguate replays across a leader change; it plays no
/// role in ordering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocHybridTime {
    hybrid_time: HybridTime,
    write_id: u32,
    leader_term: i64,
}

impl DocHybridTime {
    /// Build a doc hybrid time from its parts.
    pub const fn new(hybrid_time: HybridTime, write_id: u32, leader_term: i64) -> Self {
        DocHybridTime {
            hybrid_time,
            write_id,
            leader_term,
        }
    }

    /// A doc hybrid time with write id 0 and leader term 0, used for
    /// non-transactional writes and for committed records (whose subdoc key
    /// hybrid time carries no write id).
    pub const fn from_hybrid_time(hybrid_time: HybridTime) -> Self {
        DocHybridTime {
            hybrid_time,
            write_id: 0,
            leader_term: 0,
        }
    }

    /// The underlying hybrid time.
    pub const fn hybrid_time(&self) -> HybridTime {
        self.hybrid_time
    }

    /// The intra-transaction write id.
    pub const fn write_id(&self) -> u32 {
        self.write_id
    }

    /// The write batch's leader term.
    pub const fn leader_term(&self) -> i64 {
        self.leader_term
    }

    /// Encode into the canonical, order-preserving, self-delimiting byte
    /// suffix used after a subdoc key's prefix.
    ///
    /// Encoding inverts the bits of `(hybrid_time << 32 | write_id)` so that
    /// ascending byte-order scan yields *descending* time order (newest
    /// version first), matching the intent-aware iterator's read path. A
    /// trailing length byte makes the encoding self-delimiting so a reader
    /// can strip the suffix from the back of a key without external
    /// framing.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let combined: u128 = ((self.hybrid_time.raw() as u128) << 32) | self.write_id as u128;
        let inverted = !combined;
        let bytes = inverted.to_be_bytes();
        // 12 significant bytes (96 bits) is enough for a 64-bit hybrid time
        // plus a 32-bit write id; the top 4 bytes of the 128-bit buffer are
        // always zero post-inversion-of-zero and are dropped.
        out.extend_from_slice(&bytes[4..]);
        out.push(12u8);
    }

    /// Decode a suffix previously produced by [`DocHybridTime::encode`].
    /// Returns the decoded value and the number of bytes consumed from the
    /// *end* of `buf`.
    pub fn decode_from_end(buf: &[u8]) -> Result<(Self, usize), HybridTimeDecodeError> {
        let Some(&len_byte) = buf.last() else {
            return Err(HybridTimeDecodeError::Truncated);
        };
        let len = len_byte as usize;
        if len != 12 || buf.len() < len + 1 {
            return Err(HybridTimeDecodeError::Truncated);
        }
        let body = &buf[buf.len() - 1 - len..buf.len() - 1];
        let mut padded = [0u8; 16];
        padded[4..].copy_from_slice(body);
        let inverted = u128::from_be_bytes(padded);
        let combined = !inverted;
        let write_id = (combined & 0xFFFF_FFFF) as u32;
        let hybrid_time = HybridTime::from_raw((combined >> 32) as u64);
        Ok((
            DocHybridTime::new(hybrid_time, write_id, 0),
            len + 1,
        ))
    }
}

/// Error returned when a [`DocHybridTime`] suffix cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HybridTimeDecodeError {
    /// The buffer was too short to contain a valid suffix.
    #[error("truncated hybrid time suffix")]
    Truncated,
}

/// The read point used by a single read operation.
///
/// `read` is the MVCC snapshot point. `local_limit` bounds records written
/// by the *local* tablet that must be treated as "future" (and hence
/// trigger a restart rather than being silently skipped); `global_limit`
/// is the analogous bound for records written elsewhere. `local_limits`
/// carries a per-tablet override of `local_limit`, populated when a child
/// transaction's restart is merged back into the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadHybridTime {
    /// The snapshot point.
    pub read: HybridTime,
    /// Bound for records from the local tablet.
    pub local_limit: HybridTime,
    /// Bound for records from remote tablets.
    pub global_limit: HybridTime,
    /// Per-tablet overrides of `local_limit`, keyed by tablet id bytes (the
    /// `tablet-core` crate has no tablet-id-keyed map dependency on
    /// `tablet-durability`, so callers pass raw 16-byte ids).
    pub local_limits: std::collections::BTreeMap<[u8; 16], HybridTime>,
}

impl ReadHybridTime {
    /// A read point that sees everything up to and including `ht`, with no
    /// local/global distinction (used for non-transactional, single-tablet
    /// reads).
    pub fn single_point(ht: HybridTime) -> Self {
        ReadHybridTime {
            read: ht,
            local_limit: ht,
            global_limit: ht,
            local_limits: Default::default(),
        }
    }

    /// Produce the restarted read point after a read-restart signal: `read`
    /// advances to `max_seen_ht`, and `local_limit` is pinned to
    /// `restart_local_limit` (typically the safe time observed at restart
    /// time) so a second local restart cannot happen against the same
    /// frontier.
    pub fn restarted(&self, max_seen_ht: HybridTime, restart_local_limit: HybridTime) -> Self {
        ReadHybridTime {
            read: max_seen_ht,
            local_limit: restart_local_limit,
            global_limit: self.global_limit,
            local_limits: self.local_limits.clone(),
        }
    }

    /// The effective local limit for a given tablet: the per-tablet override
    /// if present, else the general `local_limit`.
    pub fn local_limit_for(&self, tablet_id: [u8; 16]) -> HybridTime {
        self.local_limits
            .get(&tablet_id)
            .copied()
            .unwrap_or(self.local_limit)
    }
}

/// Abstracts wall-clock access so the hybrid-time clock can be driven by a
/// fake clock in tests, trait-ing out ambient services at the seam between
/// pure logic and the outside world.
pub trait PhysicalClock: Send + Sync {
    /// Current physical time in microseconds since the Unix epoch.
    fn now_micros(&self) -> u64;
}

/// The default [`PhysicalClock`] backed by [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64
    }
}

/// Error raised by clock operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// The configured max clock skew was exceeded by an observed timestamp.
    #[error("observed hybrid time {observed:?} exceeds max skew bound")]
    SkewExceeded {
        /// The hybrid time that was rejected.
        observed: HybridTime,
    },
}

/// A hybrid-time clock: `now()` mints a fresh, monotonically increasing
/// hybrid time; `update()` folds in an observed remote time per the hybrid
/// logical clock algorithm; `now_range()` gives the confidence window used
/// to pick a safe `local_limit`/`global_limit` for new reads.
pub struct HybridClock {
    clock: Box<dyn PhysicalClock>,
    max_clock_skew_micros: u64,
    last: AtomicU64,
}

impl HybridClock {
    /// Build a clock over the given physical time source, with the given
    /// maximum tolerated clock skew.
    pub fn new(clock: Box<dyn PhysicalClock>, max_clock_skew: Duration) -> Self {
        HybridClock {
            clock,
            max_clock_skew_micros: max_clock_skew.as_micros() as u64,
            last: AtomicU64::new(HybridTime::MIN.raw()),
        }
    }

    /// Convenience constructor using [`SystemClock`].
    pub fn system(max_clock_skew: Duration) -> Self {
        HybridClock::new(Box::new(SystemClock), max_clock_skew)
    }

    /// Mint a new hybrid time, strictly greater than any time previously
    /// returned by `now()` or folded in via `update()`.
    pub fn now(&self) -> HybridTime {
        loop {
            let physical = self.clock.now_micros();
            let prev_raw = self.last.load(Ordering::Acquire);
            let prev = HybridTime::from_raw(prev_raw);
            let candidate = if physical > prev.physical_micros() {
                HybridTime::pack(physical, 0)
            } else {
                prev.incremented()
            };
            if self
                .last
                .compare_exchange(prev_raw, candidate.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Merge an observed hybrid time (e.g. from an RPC response) into the
    /// clock, advancing the local physical component if the observed time is
    /// not already behind real time.
    pub fn update(&self, observed: HybridTime) {
        loop {
            let prev_raw = self.last.load(Ordering::Acquire);
            let prev = HybridTime::from_raw(prev_raw);
            let next = if observed > prev {
                observed.incremented()
            } else {
                prev.incremented()
            };
            if self
                .last
                .compare_exchange(prev_raw, next.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// The confidence window `(lo, hi)` for "now", accounting for the
    /// configured max clock skew: any two correct nodes' clocks agree that
    /// the true current time lies within `[lo, hi]`.
    pub fn now_range(&self) -> (HybridTime, HybridTime) {
        let now = self.now();
        let skew_logical_equivalent = self.max_clock_skew_micros << LOGICAL_BITS;
        let lo = HybridTime::from_raw(now.raw().saturating_sub(skew_logical_equivalent));
        let hi = HybridTime::from_raw(now.raw().saturating_add(skew_logical_equivalent));
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_round_trip() {
        let ht = HybridTime::pack(1_000_000, 7);
        assert_eq!(ht.physical_micros(), 1_000_000);
        assert_eq!(ht.logical(), 7);
    }

    #[test]
    fn ordering_is_physical_time_first() {
        let a = HybridTime::pack(100, 50);
        let b = HybridTime::pack(101, 0);
        assert!(a < b);
    }

    #[test]
    fn ordering_breaks_ties_with_logical_counter() {
        let a = HybridTime::pack(100, 1);
        let b = HybridTime::pack(100, 2);
        assert!(a < b);
    }

    #[test]
    fn min_max_invalid_are_distinguishable() {
        assert!(HybridTime::MIN < HybridTime::MAX);
        assert!(HybridTime::MAX < HybridTime::INVALID);
        assert!(!HybridTime::INVALID.is_valid());
        assert!(HybridTime::MIN.is_valid());
    }

    #[test]
    #[should_panic]
    fn pack_rejects_oversized_logical_counter() {
        HybridTime::pack(1, 1 << LOGICAL_BITS);
    }

    #[test]
    fn doc_hybrid_time_encode_decode_round_trips() {
        let dht = DocHybridTime::new(HybridTime::pack(42, 3), 9, 0);
        let mut buf = Vec::new();
        dht.encode(&mut buf);
        let (decoded, consumed) = DocHybridTime::decode_from_end(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.hybrid_time(), dht.hybrid_time());
        assert_eq!(decoded.write_id(), dht.write_id());
    }

    #[test]
    fn doc_hybrid_time_encoding_sorts_newest_first() {
        let older = DocHybridTime::new(HybridTime::pack(100, 0), 0, 0);
        let newer = DocHybridTime::new(HybridTime::pack(200, 0), 0, 0);
        let mut older_buf = Vec::new();
        let mut newer_buf = Vec::new();
        older.encode(&mut older_buf);
        newer.encode(&mut newer_buf);
        // Ascending byte order on the suffix must correspond to descending
        // hybrid time, so the newer (larger) time's encoding sorts first.
        assert!(newer_buf < older_buf);
    }

    #[test]
    fn doc_hybrid_time_decode_rejects_truncated_buffer() {
        let err = DocHybridTime::decode_from_end(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, HybridTimeDecodeError::Truncated);
    }

    struct FixedClock(std::sync::atomic::AtomicU64);
    impl PhysicalClock for FixedClock {
        fn now_micros(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn hybrid_clock_now_is_monotonic_even_with_a_stuck_physical_clock() {
        let clock = HybridClock::new(Box::new(FixedClock(AtomicU64::new(1000))), Duration::from_millis(500));
        let a = clock.now();
        let b = clock.now();
        let c = clock.now();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn hybrid_clock_update_advances_past_observed_time() {
        let clock = HybridClock::new(Box::new(FixedClock(AtomicU64::new(1000))), Duration::from_millis(500));
        let future = HybridTime::pack(1_000_000_000, 0);
        clock.update(future);
        let next = clock.now();
        assert!(next > future);
    }

    #[test]
    fn now_range_widens_with_skew() {
        let clock = HybridClock::new(Box::new(FixedClock(AtomicU64::new(5_000_000))), Duration::from_millis(100));
        let (lo, hi) = clock.now_range();
        assert!(lo < hi);
    }

    #[test]
    fn read_hybrid_time_single_point_has_equal_bounds() {
        let ht = HybridTime::pack(10, 0);
        let rht = ReadHybridTime::single_point(ht);
        assert_eq!(rht.read, ht);
        assert_eq!(rht.local_limit, ht);
        assert_eq!(rht.global_limit, ht);
    }

    #[test]
    fn read_hybrid_time_restart_pins_local_limit() {
        let original = ReadHybridTime::single_point(HybridTime::pack(10, 0));
        let restarted = original.restarted(HybridTime::pack(50, 0), HybridTime::pack(55, 0));
        assert_eq!(restarted.read, HybridTime::pack(50, 0));
        assert_eq!(restarted.local_limit, HybridTime::pack(55, 0));
        assert_eq!(restarted.global_limit, original.global_limit);
    }

    #[test]
    fn read_hybrid_time_local_limit_override_takes_precedence() {
        let mut rht = ReadHybridTime::single_point(HybridTime::pack(10, 0));
        let tablet = [9u8; 16];
        rht.local_limits.insert(tablet, HybridTime::pack(77, 0));
        assert_eq!(rht.local_limit_for(tablet), HybridTime::pack(77, 0));
        assert_eq!(rht.local_limit_for([0u8; 16]), rht.local_limit);
    }
}
