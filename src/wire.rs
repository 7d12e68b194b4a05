// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

//! Wire messages exchanged with the status shard, and the envelopes that carry
//! a transaction into and out of a nested ("child") attempt. The field sets
//! here are fixed by the server side; every request piggybacks the sender's
//! current hybrid time and every response may carry one back, which callers
//! must feed into the local clock.

use crate::{HybridTime, ShardId, TransactionId, TransactionMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status values a client may write into a transaction's status record.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    /// First heartbeat; creates the status record.
    Created,
    /// Subsequent keep-alive heartbeats.
    Pending,
    /// Final update, listing every participant shard.
    Committed,
}

/// The transaction-state portion of an [UpdateTransactionRequest].
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnStatePayload {
    pub transaction_id: TransactionId,
    pub status: TxnStatus,
    /// Participant shards; empty for heartbeats, complete for Committed.
    pub shards: Vec<ShardId>,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateTransactionRequest {
    pub shard: ShardId,
    pub propagated_hybrid_time: HybridTime,
    pub state: TxnStatePayload,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateTransactionResponse {
    pub propagated_hybrid_time: Option<HybridTime>,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbortTransactionRequest {
    pub shard: ShardId,
    pub propagated_hybrid_time: HybridTime,
    pub transaction_id: TransactionId,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbortTransactionResponse {
    pub propagated_hybrid_time: Option<HybridTime>,
}

/// Everything a child transaction needs to run under its parent's identity:
/// the full metadata plus the parent's read point.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildTransactionData {
    pub metadata: TransactionMetadata,
    pub read_time: Option<HybridTime>,
    pub local_limits: BTreeMap<ShardId, HybridTime>,
}

/// One participant shard as reported back by a finished child.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantEntry {
    pub shard: ShardId,
    pub has_parameters: bool,
}

/// Read-point updates a child hands back to its parent: local limits the child
/// learned about, and the highest conflicting observation if the child hit a
/// read conflict (so the parent restarts past it).
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadPointDelta {
    pub restart_time: Option<HybridTime>,
    pub local_limits: BTreeMap<ShardId, HybridTime>,
}

/// What a finished child transaction hands back to its parent for merging.
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildTransactionResult {
    pub shards: Vec<ParticipantEntry>,
    pub read_point_delta: ReadPointDelta,
}
