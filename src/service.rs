// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use crate::wire::{
    AbortTransactionRequest, AbortTransactionResponse, UpdateTransactionRequest,
    UpdateTransactionResponse,
};
use crate::{Error, ShardId, SyncBoxFuture};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Routing descriptor for a shard, as resolved through the cluster's shard
/// metadata cache. Implementations attach whatever they need to reach the
/// shard's current leader; the coordinator only holds and hands it back.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRoute {
    pub shard: ShardId,
    /// Metadata-cache generation at resolution time; lets an implementation
    /// notice that a held route has gone stale.
    pub generation: u64,
}

/// The cluster-facing half of transaction coordination: picking a status
/// shard, resolving shard routes, and the two status-record RPCs. Clients of
/// this crate provide an implementation backed by their RPC layer and pass an
/// instance to the constructor of [crate::TransactionManager].
///
/// Every call carries a deadline; blowing it is a per-call failure (the caller
/// decides whether to retry), never a transaction failure by itself.
pub trait ShardService: Send + Sync + 'static {
    /// Picks a status shard for a new transaction.
    fn pick_status_shard(&self) -> SyncBoxFuture<Result<ShardId, Error>>;

    /// Resolves the routing descriptor for `shard`. `fast_path` permits
    /// answering from a possibly-stale local cache.
    fn lookup_shard(
        &self,
        shard: ShardId,
        deadline: Duration,
        fast_path: bool,
    ) -> SyncBoxFuture<Result<ShardRoute, Error>>;

    /// Writes a status update (Created / Pending / Committed) to the
    /// transaction's status record.
    fn update_transaction(
        &self,
        route: ShardRoute,
        req: UpdateTransactionRequest,
        deadline: Duration,
    ) -> SyncBoxFuture<Result<UpdateTransactionResponse, Error>>;

    /// Asks the status shard to drop the transaction's status record.
    fn abort_transaction(
        &self,
        route: ShardRoute,
        req: AbortTransactionRequest,
        deadline: Duration,
    ) -> SyncBoxFuture<Result<AbortTransactionResponse, Error>>;
}
