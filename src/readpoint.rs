// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

//! A transaction reads from a _read point_: a single hybrid-time snapshot,
//! plus a per-shard map of "local limits" that bound how far into its
//! uncertainty window each shard has to look. When some shard reports a
//! committed value newer than the read time, the snapshot is no longer
//! consistent and the whole transaction has to be rerun at a later read time;
//! the read point records the highest such observation so a restarted attempt
//! can be pinned at or past it.

use crate::wire::{ChildTransactionData, ReadPointDelta};
use crate::{HybridTime, ShardId};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadPoint {
    /// The chosen snapshot time. Deferred (None) until the first read under
    /// isolation levels that do not pin the snapshot at construction.
    read_time: Option<HybridTime>,

    /// Per-shard upper bounds on uncertainty, learned from read responses.
    /// Reads at a shard need not consider times above its local limit.
    local_limits: BTreeMap<ShardId, HybridTime>,

    /// Highest conflicting observation reported by any shard, if one was. A
    /// read point with a restart time is invalid and the transaction must be
    /// rerun past it.
    restart_time: Option<HybridTime>,
}

impl ReadPoint {
    pub fn read_time(&self) -> Option<HybridTime> {
        self.read_time
    }

    pub fn local_limits(&self) -> &BTreeMap<ShardId, HybridTime> {
        &self.local_limits
    }

    pub fn is_restart_required(&self) -> bool {
        self.restart_time.is_some()
    }

    /// Pins the snapshot to `now`. Called at construction for snapshot
    /// isolation, or just before the first read otherwise.
    pub fn set_read_time_to(&mut self, now: HybridTime) {
        self.read_time = Some(now);
    }

    /// Adopts a read point handed down from a parent transaction.
    pub fn set_read_time(
        &mut self,
        read_time: Option<HybridTime>,
        local_limits: BTreeMap<ShardId, HybridTime>,
    ) {
        self.read_time = read_time;
        self.local_limits = local_limits;
    }

    /// Records a shard's uncertainty bound. Keeps the smaller bound if one was
    /// already known; a limit only ever shrinks the window a read considers.
    pub fn update_local_limit(&mut self, shard: ShardId, limit: HybridTime) {
        let entry = self.local_limits.entry(shard).or_insert(limit);
        *entry = std::cmp::min(*entry, limit);
    }

    /// Records that `shard` observed a committed value at `observed`, newer
    /// than our snapshot. The read point is invalid from here on. The
    /// observation also serves as that shard's local limit: a restarted
    /// attempt need not look past it there.
    pub fn observed_conflict(&mut self, shard: ShardId, observed: HybridTime) {
        self.local_limits.insert(shard, observed);
        self.restart_time = Some(match self.restart_time {
            None => observed,
            Some(existing) => std::cmp::max(existing, observed),
        });
    }

    /// Called on the read point after it has been moved into a restarted
    /// sibling transaction: advances the snapshot strictly past its previous
    /// value, to at or past the highest conflicting observation, and clears
    /// the restart state. Local limits are kept, they remain valid bounds.
    pub fn restart(&mut self) {
        if let Some(conflict) = self.restart_time.take() {
            let past_conflict = match self.read_time {
                Some(read_time) => std::cmp::max(conflict, read_time.next_logical()),
                None => conflict,
            };
            self.read_time = Some(past_conflict);
        }
    }

    /// Writes the parts of this read point a child transaction inherits.
    pub fn prepare_child_data(&self, data: &mut ChildTransactionData) {
        data.read_time = self.read_time;
        data.local_limits = self.local_limits.clone();
    }

    /// Writes the updates a finished child hands back to its parent.
    pub fn finish_child_result(&self, delta: &mut ReadPointDelta) {
        delta.restart_time = self.restart_time;
        delta.local_limits = self.local_limits.clone();
    }

    /// Merges a finished child's updates into this (parent) read point.
    pub fn apply_child_result(&mut self, delta: &ReadPointDelta) {
        for (shard, limit) in &delta.local_limits {
            self.update_local_limit(*shard, *limit);
        }
        if let Some(observed) = delta.restart_time {
            self.restart_time = Some(match self.restart_time {
                None => observed,
                Some(existing) => std::cmp::max(existing, observed),
            });
        }
    }
}

#[test]
fn test_restart_advances_to_highest_conflict() {
    let mut rp = ReadPoint::default();
    rp.set_read_time_to(HybridTime::new(100, 0));
    rp.observed_conflict(ShardId(1), HybridTime::new(150, 2));
    rp.observed_conflict(ShardId(2), HybridTime::new(140, 0));
    assert!(rp.is_restart_required());

    rp.restart();
    assert!(!rp.is_restart_required());
    assert_eq!(rp.read_time(), Some(HybridTime::new(150, 2)));
}

#[test]
fn test_restart_past_conflict_at_read_time() {
    // A conflict reported at (or below) the snapshot still forces the
    // restarted snapshot strictly forward.
    let mut rp = ReadPoint::default();
    rp.set_read_time_to(HybridTime::new(100, 0));
    rp.observed_conflict(ShardId(1), HybridTime::new(100, 0));
    rp.restart();
    assert!(rp.read_time() > Some(HybridTime::new(100, 0)));
}

#[test]
fn test_local_limits_keep_the_tighter_bound() {
    let mut rp = ReadPoint::default();
    rp.update_local_limit(ShardId(1), HybridTime::new(50, 0));
    rp.update_local_limit(ShardId(1), HybridTime::new(40, 0));
    rp.update_local_limit(ShardId(1), HybridTime::new(60, 0));
    assert_eq!(
        rp.local_limits().get(&ShardId(1)),
        Some(&HybridTime::new(40, 0))
    );
}

#[test]
fn test_child_roundtrip_is_idempotent_on_parent() {
    use crate::{IsolationLevel, TransactionMetadata};

    let mut parent = ReadPoint::default();
    parent.set_read_time_to(HybridTime::new(10, 0));
    parent.update_local_limit(ShardId(1), HybridTime::new(20, 0));

    let mut data = ChildTransactionData {
        metadata: TransactionMetadata::new(IsolationLevel::Snapshot, HybridTime::new(10, 0)),
        read_time: None,
        local_limits: Default::default(),
    };
    parent.prepare_child_data(&mut data);

    let mut child = ReadPoint::default();
    child.set_read_time(data.read_time, data.local_limits);
    child.update_local_limit(ShardId(2), HybridTime::new(30, 0));
    child.observed_conflict(ShardId(3), HybridTime::new(35, 0));

    let mut delta = ReadPointDelta::default();
    child.finish_child_result(&mut delta);

    parent.apply_child_result(&delta);
    let merged_once = parent.clone();
    parent.apply_child_result(&delta);
    assert_eq!(parent, merged_once);
    assert!(parent.is_restart_required());
    assert_eq!(
        parent.local_limits().get(&ShardId(2)),
        Some(&HybridTime::new(30, 0))
    );
}
