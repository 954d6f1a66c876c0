//! Sliding outcome window backing the circuit breaker
//!
//! Accumulates call outcomes and answers rate queries without scanning. The
//! three aggregate counters (total, failed, slow) are packed into a single
//! `AtomicU64` word, 21 bits each, so one load yields a self-consistent
//! snapshot: `failed <= total` and `slow <= total` hold in every observable
//! state, even under concurrent recording.
//!
//! Two eviction schemes:
//! - count-based: a fixed circular array of outcome codes with an atomic
//!   write index; overwriting a slot subtracts the evicted outcome's
//!   contribution in the same atomic add that applies the new one;
//! - time-based: one bucket per wall-second; a bucket whose stamp no longer
//!   matches the current second is cleared (and deducted from the aggregate)
//!   before reuse.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const FIELD_BITS: u32 = 21;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;

const SLOT_EMPTY: u8 = 0;
const SLOT_SUCCESS: u8 = 1;
const SLOT_SLOW_SUCCESS: u8 = 2;
const SLOT_FAILURE: u8 = 3;
const SLOT_SLOW_FAILURE: u8 = 4;

/// Maximum window size representable by the packed aggregate word
pub const MAX_WINDOW_SIZE: usize = (FIELD_MASK as usize) / 2;

fn pack(total: u64, failed: u64, slow: u64) -> u64 {
    (total << (2 * FIELD_BITS)) | (failed << FIELD_BITS) | slow
}

fn unpack(word: u64) -> (u64, u64, u64) {
    (word >> (2 * FIELD_BITS) & FIELD_MASK, word >> FIELD_BITS & FIELD_MASK, word & FIELD_MASK)
}

/// The classified result of one permitted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed successfully within the slow-call threshold
    Success(Duration),
    /// Completed successfully but slower than the slow-call threshold
    SlowSuccess(Duration),
    /// Failed within the slow-call threshold
    Failure(Duration),
    /// Failed and was also slower than the slow-call threshold
    SlowFailure(Duration),
}

impl Outcome {
    fn code(self) -> u8 {
        match self {
            Outcome::Success(_) => SLOT_SUCCESS,
            Outcome::SlowSuccess(_) => SLOT_SLOW_SUCCESS,
            Outcome::Failure(_) => SLOT_FAILURE,
            Outcome::SlowFailure(_) => SLOT_SLOW_FAILURE,
        }
    }
}

/// Per-outcome contribution to the packed aggregate word: (total, failed, slow)
fn contribution(code: u8) -> u64 {
    match code {
        SLOT_SUCCESS => pack(1, 0, 0),
        SLOT_SLOW_SUCCESS => pack(1, 0, 1),
        SLOT_FAILURE => pack(1, 1, 0),
        SLOT_SLOW_FAILURE => pack(1, 1, 1),
        _ => 0,
    }
}

/// Eviction scheme for [`OutcomeWindow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Keep the most recent N outcomes
    CountBased,
    /// Keep outcomes from the most recent N wall-seconds
    TimeBased,
}

/// One self-consistent view of the window aggregates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    /// Percentage of failed calls, 0.0 when no calls are in-window
    pub failure_rate: f32,
    /// Percentage of slow calls, 0.0 when no calls are in-window
    pub slow_call_rate: f32,
    /// True once at least `minimum_calls` outcomes are in-window; rates are
    /// not actionable before saturation
    pub saturated: bool,
}

struct TimeBucket {
    /// Epoch second this bucket currently represents, `u64::MAX` when empty
    second: AtomicU64,
    counts: AtomicU64,
}

enum Repr {
    Count { slots: Box<[AtomicU8]>, head: AtomicUsize },
    Time { buckets: Box<[TimeBucket]>, start: Instant },
}

/// Thread-safe accumulator of call outcomes with bounded retention
pub struct OutcomeWindow {
    aggregate: AtomicU64,
    minimum_calls: u64,
    repr: Repr,
}

impl OutcomeWindow {
    /// Window over the last `size` outcomes.
    pub fn count_based(size: usize, minimum_calls: u64) -> Self {
        let size = size.clamp(1, MAX_WINDOW_SIZE);
        let slots = (0..size).map(|_| AtomicU8::new(SLOT_EMPTY)).collect::<Vec<_>>();
        Self {
            aggregate: AtomicU64::new(0),
            minimum_calls,
            repr: Repr::Count { slots: slots.into_boxed_slice(), head: AtomicUsize::new(0) },
        }
    }

    /// Window over the last `seconds` wall-seconds, bucketed per second.
    /// `start` anchors the second arithmetic; pass the owning clock's `now()`.
    pub fn time_based(seconds: usize, minimum_calls: u64, start: Instant) -> Self {
        let seconds = seconds.max(1);
        let buckets = (0..seconds)
            .map(|_| TimeBucket { second: AtomicU64::new(u64::MAX), counts: AtomicU64::new(0) })
            .collect::<Vec<_>>();
        Self {
            aggregate: AtomicU64::new(0),
            minimum_calls,
            repr: Repr::Time { buckets: buckets.into_boxed_slice(), start },
        }
    }

    /// Record one outcome. `now` comes from the owning policy's clock and is
    /// only consulted by time-based windows.
    pub fn record(&self, outcome: Outcome, now: Instant) {
        let added = contribution(outcome.code());
        match &self.repr {
            Repr::Count { slots, head } => {
                let idx = head.fetch_add(1, Ordering::Relaxed) % slots.len();
                let evicted = slots[idx].swap(outcome.code(), Ordering::AcqRel);
                // Add-and-evict in one atomic op. Field borrows cannot occur:
                // componentwise, the evicted contribution never exceeds what
                // the aggregate still holds for that slot.
                let delta = added.wrapping_sub(contribution(evicted));
                self.aggregate.fetch_add(delta, Ordering::AcqRel);
            }
            Repr::Time { buckets, start } => {
                let sec = now.saturating_duration_since(*start).as_secs();
                self.expire_stale(buckets, sec);
                let bucket = &buckets[(sec % buckets.len() as u64) as usize];
                loop {
                    let stamped = bucket.second.load(Ordering::Acquire);
                    if stamped == sec {
                        break;
                    }
                    // Rotate: claim the bucket for the current second, then
                    // clear whatever the stale second left behind.
                    if bucket
                        .second
                        .compare_exchange_weak(stamped, sec, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let old = bucket.counts.swap(0, Ordering::AcqRel);
                        if old != 0 {
                            self.aggregate.fetch_sub(old, Ordering::AcqRel);
                        }
                        break;
                    }
                }
                // Aggregate first: a concurrent rotation subtracts whatever
                // it swaps out of the bucket, which therefore must never hold
                // counts the aggregate has not seen yet.
                self.aggregate.fetch_add(added, Ordering::AcqRel);
                bucket.counts.fetch_add(added, Ordering::AcqRel);
            }
        }
    }

    /// One-load snapshot of the aggregates. Time-based windows first expire
    /// buckets that have slid out of range.
    pub fn snapshot(&self, now: Instant) -> WindowSnapshot {
        if let Repr::Time { buckets, start } = &self.repr {
            let sec = now.saturating_duration_since(*start).as_secs();
            self.expire_stale(buckets, sec);
        }

        let (total, failed, slow) = unpack(self.aggregate.load(Ordering::Acquire));
        let (failure_rate, slow_call_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                failed as f32 * 100.0 / total as f32,
                slow as f32 * 100.0 / total as f32,
            )
        };

        WindowSnapshot {
            total_calls: total,
            failed_calls: failed,
            slow_calls: slow,
            failure_rate,
            slow_call_rate,
            saturated: total >= self.minimum_calls,
        }
    }

    /// Number of outcomes needed before the window saturates.
    pub fn minimum_calls(&self) -> u64 {
        self.minimum_calls
    }

    /// Clear buckets whose stamped second has slid out of the window.
    fn expire_stale(&self, buckets: &[TimeBucket], sec: u64) {
        let len = buckets.len() as u64;
        let oldest_live = sec.saturating_sub(len - 1);
        for bucket in buckets {
            let stamped = bucket.second.load(Ordering::Acquire);
            if stamped == u64::MAX || stamped >= oldest_live {
                continue;
            }
            if bucket
                .second
                .compare_exchange(stamped, u64::MAX, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let old = bucket.counts.swap(0, Ordering::AcqRel);
                if old != 0 {
                    self.aggregate.fetch_sub(old, Ordering::AcqRel);
                }
            }
        }
    }
}

impl std::fmt::Debug for OutcomeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (total, failed, slow) = unpack(self.aggregate.load(Ordering::Acquire));
        let kind = match &self.repr {
            Repr::Count { .. } => WindowKind::CountBased,
            Repr::Time { .. } => WindowKind::TimeBased,
        };
        f.debug_struct("OutcomeWindow")
            .field("kind", &kind)
            .field("total", &total)
            .field("failed", &failed)
            .field("slow", &slow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const D: Duration = Duration::from_millis(10);

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let word = pack(1_000_000, 400_000, 123);
        assert_eq!(unpack(word), (1_000_000, 400_000, 123));
    }

    #[test]
    fn test_empty_window_snapshot() {
        let window = OutcomeWindow::count_based(5, 5);
        let snap = window.snapshot(now());
        assert_eq!(snap.total_calls, 0);
        assert_eq!(snap.failure_rate, 0.0);
        assert!(!snap.saturated);
    }

    #[test]
    fn test_count_based_aggregates() {
        let window = OutcomeWindow::count_based(10, 3);
        window.record(Outcome::Success(D), now());
        window.record(Outcome::Failure(D), now());
        window.record(Outcome::SlowSuccess(D), now());

        let snap = window.snapshot(now());
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.slow_calls, 1);
        assert!(snap.saturated);
        assert!((snap.failure_rate - 100.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_count_based_eviction_subtracts_contribution() {
        let window = OutcomeWindow::count_based(3, 1);
        window.record(Outcome::Failure(D), now());
        window.record(Outcome::Failure(D), now());
        window.record(Outcome::Failure(D), now());
        // Evicts the first failure.
        window.record(Outcome::Success(D), now());

        let snap = window.snapshot(now());
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failed_calls, 2);
    }

    #[test]
    fn test_slow_failure_counts_both() {
        let window = OutcomeWindow::count_based(4, 1);
        window.record(Outcome::SlowFailure(D), now());

        let snap = window.snapshot(now());
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.slow_calls, 1);
        assert_eq!(snap.failure_rate, 100.0);
        assert_eq!(snap.slow_call_rate, 100.0);
    }

    #[test]
    fn test_saturation_threshold() {
        let window = OutcomeWindow::count_based(10, 5);
        for _ in 0..4 {
            window.record(Outcome::Failure(D), now());
        }
        assert!(!window.snapshot(now()).saturated);

        window.record(Outcome::Failure(D), now());
        assert!(window.snapshot(now()).saturated);
    }

    #[test]
    fn test_time_based_buckets_by_second() {
        let start = now();
        let window = OutcomeWindow::time_based(3, 1, start);

        window.record(Outcome::Failure(D), start);
        window.record(Outcome::Success(D), start + Duration::from_secs(1));

        let snap = window.snapshot(start + Duration::from_secs(1));
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.failed_calls, 1);
    }

    #[test]
    fn test_time_based_evicts_old_buckets() {
        let start = now();
        let window = OutcomeWindow::time_based(2, 1, start);

        window.record(Outcome::Failure(D), start);
        window.record(Outcome::Failure(D), start + Duration::from_secs(1));

        // Two seconds later the first bucket is out of the window.
        let snap = window.snapshot(start + Duration::from_secs(2));
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.failed_calls, 1);

        // Four seconds later everything has slid out.
        let snap = window.snapshot(start + Duration::from_secs(4));
        assert_eq!(snap.total_calls, 0);
    }

    #[test]
    fn test_time_based_bucket_reuse_clears_stale_counts() {
        let start = now();
        let window = OutcomeWindow::time_based(2, 1, start);

        window.record(Outcome::Failure(D), start);
        // Second 2 maps onto the same bucket index as second 0; the stale
        // counts must be cleared before the new outcome lands.
        window.record(Outcome::Success(D), start + Duration::from_secs(2));

        let snap = window.snapshot(start + Duration::from_secs(2));
        assert_eq!(snap.total_calls, 1);
        assert_eq!(snap.failed_calls, 0);
    }

    #[test]
    fn test_invariants_under_concurrent_recording() {
        let window = Arc::new(OutcomeWindow::count_based(16, 8));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let window = Arc::clone(&window);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let outcome = if (worker + i) % 3 == 0 {
                        Outcome::Failure(D)
                    } else {
                        Outcome::Success(D)
                    };
                    window.record(outcome, Instant::now());
                    let snap = window.snapshot(Instant::now());
                    assert!(snap.failed_calls <= snap.total_calls);
                    assert!(snap.slow_calls <= snap.total_calls);
                    assert!((0.0..=100.0).contains(&snap.failure_rate));
                }
            }));
        }

        for handle in handles {
            handle.join().expect("window worker should not panic");
        }

        let snap = window.snapshot(Instant::now());
        assert_eq!(snap.total_calls, 16);
    }
}
