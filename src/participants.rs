// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use crate::wire::ParticipantEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A simple "shard identifier" naming one horizontal partition of the keyspace
/// (and the replica group that owns it). Assigned by the cluster; unique for
/// the life of the shard.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl std::fmt::Debug for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("s{}", self.0))
    }
}

/// Per-shard state a transaction tracks about one of its participants.
///
/// `has_parameters` becomes true once the shard has been told the full
/// transaction metadata on a successful write; from then on batches to that
/// shard only need to carry the transaction id.
#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub has_parameters: bool,
}

impl ParticipantRecord {
    pub fn merge(&mut self, has_parameters: bool) {
        self.has_parameters = self.has_parameters || has_parameters;
    }
}

/// The set of shards a transaction has touched, with their per-shard state.
/// Commit references every key in this table; a child transaction hands its
/// table back to the parent for merging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParticipantTable {
    records: BTreeMap<ShardId, ParticipantRecord>,
}

impl ParticipantTable {
    /// Ensures `shard` has an entry and reports whether it still needs the
    /// full transaction metadata (i.e. it is new, or no write to it has
    /// succeeded yet).
    pub fn note(&mut self, shard: ShardId) -> bool {
        !self.records.entry(shard).or_default().has_parameters
    }

    pub fn mark_has_parameters(&mut self, shard: ShardId) {
        // Every shard seen by a batch was noted when the batch was prepared.
        debug_assert!(self.records.contains_key(&shard));
        if let Some(record) = self.records.get_mut(&shard) {
            record.has_parameters = true;
        }
    }

    pub fn merge(&mut self, shard: ShardId, has_parameters: bool) {
        self.records.entry(shard).or_default().merge(has_parameters);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.records.keys().copied().collect()
    }

    pub fn entries(&self) -> Vec<ParticipantEntry> {
        self.records
            .iter()
            .map(|(shard, record)| ParticipantEntry {
                shard: *shard,
                has_parameters: record.has_parameters,
            })
            .collect()
    }
}

#[test]
fn test_note_and_mark() {
    let mut table = ParticipantTable::default();
    let a = ShardId(1);
    assert!(table.note(a));
    assert!(table.note(a)); // still no parameters delivered
    table.mark_has_parameters(a);
    assert!(!table.note(a));
    assert_eq!(table.shard_ids(), vec![a]);
}

#[test]
fn test_merge_is_monotone_and_idempotent() {
    let mut table = ParticipantTable::default();
    let a = ShardId(1);
    table.merge(a, true);
    table.merge(a, false);
    assert!(!table.note(a));
    let before = table.clone();
    table.merge(a, true);
    assert_eq!(table, before);
}
