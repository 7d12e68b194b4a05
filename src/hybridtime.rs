// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};

/// HybridTimes are the fundamental timekeeping type in the system.
///
/// They have some interesting properties:
///
///   - They are totally ordered.
///   - They combine a physical microsecond count with a logical event counter,
///     so a peer whose wall clock stalls or steps backwards can keep issuing
///     strictly increasing times by bumping the logical component.
///   - They are issued at each peer _without_ coordination; cross-peer causality
///     is maintained by piggybacking times on messages and ratcheting the local
///     clock past every time observed on the wire (see [crate::HybridClock]).
///   - They do assume some level of real-time-clock availability on all peers,
///     but those clocks do not need to be very tightly synchronized. Larger
///     skew only widens the uncertainty window a reader has to account for; it
///     does not affect correctness.
///
/// The representation packs both components into a single `u64` -- the low
/// [HybridTime::LOGICAL_BITS] bits hold the logical counter, the rest hold
/// microseconds since the unix epoch -- so a `HybridTime` travels over the
/// wire as one integer and orders correctly as one integer.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl std::fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}.{}", self.micros(), self.logical()))
    }
}

impl HybridTime {
    /// Width of the logical counter in the packed representation.
    pub const LOGICAL_BITS: u32 = 12;
    const LOGICAL_MASK: u64 = (1 << Self::LOGICAL_BITS) - 1;

    pub fn new(micros: u64, logical: u64) -> HybridTime {
        HybridTime((micros << Self::LOGICAL_BITS) | (logical & Self::LOGICAL_MASK))
    }

    pub fn from_micros(micros: u64) -> HybridTime {
        HybridTime::new(micros, 0)
    }

    pub fn micros(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & Self::LOGICAL_MASK
    }

    /// The smallest HybridTime strictly greater than `self`. If the logical
    /// counter overflows this carries into the microsecond component.
    pub fn next_logical(&self) -> HybridTime {
        HybridTime(
            self.0
                .checked_add(1)
                .expect("hybrid time logical-increment overflow"),
        )
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> HybridTime {
        HybridTime(raw)
    }
}

#[test]
fn test_packing_and_order() {
    let a = HybridTime::new(5, 1);
    assert_eq!(a.micros(), 5);
    assert_eq!(a.logical(), 1);
    assert!(HybridTime::new(5, 1) < HybridTime::new(5, 2));
    assert!(HybridTime::new(5, HybridTime::LOGICAL_MASK) < HybridTime::new(6, 0));
    assert_eq!(HybridTime::from_u64(a.to_u64()), a);
}

#[test]
fn test_next_logical_carries() {
    let t = HybridTime::new(7, (1 << HybridTime::LOGICAL_BITS) - 1);
    let n = t.next_logical();
    assert!(n > t);
    assert_eq!(n.micros(), 8);
    assert_eq!(n.logical(), 0);
}
