// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use crate::HybridTime;
use async_std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Trait to support multiple sorts of clock-source.
pub trait Clock: Send + Sync {
    fn current_time(&self) -> SystemTime;
}

/// An implementation of [Clock] that calls [std::time::SystemTime::now].
pub struct RealClock;
impl Clock for RealClock {
    fn current_time(&self) -> SystemTime {
        std::time::SystemTime::now()
    }
}

/// An implementation of [Clock] that holds a shared [AtomicU64] representing
/// the current microsecond count since the epoch, that increments on each
/// call to `Clock::current_time`.
pub struct TestClock(Arc<AtomicU64>);
impl TestClock {
    pub fn new() -> Self {
        TestClock(Arc::new(AtomicU64::from(0)))
    }
}
impl Clock for TestClock {
    fn current_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_micros(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// A HybridClock issues monotonically-increasing [HybridTime]s for the current
/// process, and ratchets itself forward past any time observed on the wire so
/// that locally-issued times stay ahead of everything this process has seen.
///
/// Usually issuance moves forward with the system clock, but if the system
/// clock stalls, goes backwards, or otherwise misbehaves, we just bump the
/// logical counter of the previously-issued time, which in the worst case may
/// increment the microsecond count if the per-microsecond logical count
/// overflows. This is the best we can do.
pub struct HybridClock {
    /// The clock source we'll use to draw system time from.
    clock: Box<dyn Clock>,

    /// The previously-issued (or observed) HybridTime, packed; will only
    /// advance monotonically regardless of movement of the clock.
    prev: AtomicU64,
}

impl HybridClock {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        HybridClock {
            clock,
            prev: AtomicU64::from(0),
        }
    }

    /// Issues a HybridTime strictly greater than every time previously issued
    /// by or observed on this clock.
    pub fn now(&self) -> HybridTime {
        let now = self.clock.current_time();
        let wall_micros = match now.duration_since(UNIX_EPOCH) {
            Err(_) => None,
            Ok(dur) => {
                let secs: u64 = dur.as_secs();
                let micros: u32 = dur.subsec_micros();
                // Seconds since the unix epoch should be _way_ less than
                // 64 - LOGICAL_BITS bits; it won't exceed 33 bits in my
                // lifetime or that of anyone currently living.
                let mut us = secs
                    .checked_mul(1_000_000)
                    .expect("hybrid clock sec-to-us overflow");
                us = us
                    .checked_add(micros as u64)
                    .expect("hybrid clock us-addition overflow");
                Some(us)
            }
        };
        let mut prev = self.prev.load(Ordering::Acquire);
        loop {
            let issued = match wall_micros {
                Some(us) if HybridTime::from_micros(us) > HybridTime::from_u64(prev) => {
                    HybridTime::from_micros(us)
                }
                _ => HybridTime::from_u64(prev).next_logical(),
            };
            match self.prev.compare_exchange_weak(
                prev,
                issued.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return issued,
                Err(p) => prev = p,
            }
        }
    }

    /// Ratchets the clock past a time observed from another peer, so the next
    /// locally-issued time is ordered after it.
    pub fn observe(&self, ht: HybridTime) {
        self.prev.fetch_max(ht.to_u64(), Ordering::AcqRel);
    }
}

#[test]
fn test_issues_monotone_times() {
    let clock = HybridClock::new(Box::new(TestClock::new()));
    let mut prev = clock.now();
    for _ in 0..100 {
        let next = clock.now();
        assert!(next > prev);
        prev = next;
    }
}

#[test]
fn test_observe_ratchets_forward() {
    let clock = HybridClock::new(Box::new(TestClock::new()));
    let far = HybridTime::new(1_000_000, 3);
    clock.observe(far);
    assert!(clock.now() > far);
    // Observing the past must not move the clock backwards.
    let present = clock.now();
    clock.observe(HybridTime::new(5, 0));
    assert!(clock.now() > present);
}
