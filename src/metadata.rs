// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{HybridTime, ShardId};
use serde::{Deserialize, Serialize};

/// An opaque 16-byte transaction identifier, unique per attempt. A restarted
/// transaction is a new attempt and gets a fresh id.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub [u8; 16]);

impl TransactionId {
    pub fn generate() -> TransactionId {
        TransactionId(rand::random())
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:032x}", u128::from_be_bytes(self.0)))
    }
}

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// All reads in the transaction observe one snapshot, pinned when the
    /// transaction is constructed.
    Snapshot,
    /// The read time is chosen when the first read executes.
    Serializable,
}

/// Everything a shard needs to know to start tracking a transaction. Sent in
/// full with the first batch to each participant shard; afterwards batches
/// carry only the id.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: TransactionId,
    pub isolation: IsolationLevel,
    /// Filled in once the status shard has been resolved.
    pub status_shard: Option<ShardId>,
    /// Random; the server uses it to break deadlocks deterministically.
    pub priority: u64,
    pub start_time: HybridTime,
}

impl TransactionMetadata {
    pub fn new(isolation: IsolationLevel, start_time: HybridTime) -> TransactionMetadata {
        TransactionMetadata {
            transaction_id: TransactionId::generate(),
            isolation,
            status_shard: None,
            priority: rand::random(),
            start_time,
        }
    }
}

#[test]
fn test_attempts_are_distinct() {
    let a = TransactionMetadata::new(IsolationLevel::Snapshot, HybridTime::new(1, 0));
    let b = TransactionMetadata::new(IsolationLevel::Snapshot, HybridTime::new(1, 0));
    assert_ne!(a.transaction_id, b.transaction_id);
}
