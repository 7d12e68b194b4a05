// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate is the client-side transaction coordinator for a distributed,
//! sharded, strongly-consistent database. It is the piece of a client library
//! that lets an application group reads and writes spanning many shards into
//! one atomic transaction, while the client keeps talking to the data-bearing
//! shards directly and in parallel.
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - Each transaction is assigned a _status shard_: the shard hosting the
//!     authoritative record of the transaction's fate. The assignment is
//!     resolved lazily and asynchronously, on the first operation that needs
//!     it.
//!
//!   - The coordinator keeps the transaction alive with periodic heartbeats
//!     to the status shard; a server that stops hearing them expires the
//!     transaction.
//!
//!   - Batches of operations flow to their shards directly. The coordinator
//!     only tracks which shards participated, and whether each has been told
//!     the full transaction metadata yet.
//!
//!   - Commit is a single message to the status shard referencing every
//!     participant shard. There is no voting round: the status record _is_
//!     the commit point.
//!
//!   - Reads are pinned to a consistent _read point_ across shards. When a
//!     shard reports a committed value newer than the read point, the
//!     transaction restarts as a sibling with a fresh identity and an
//!     advanced read point.
//!
//!   - A transaction can spawn nested ("child") coordinators that run under
//!     the parent's identity -- for work shipped to another process -- and
//!     are merged back into the parent through a serializable envelope.
//!
//! ## Caveats
//!
//!  - The coordinator is purely in-memory and lives exactly as long as one
//!    transaction attempt. It persists nothing; durability is the server
//!    side's problem.
//!
//!  - It does require partial clock synchronization, in the usual
//!    hybrid-logical-clock sense: skew does not affect correctness, only the
//!    width of the uncertainty windows readers have to wait out. Normal
//!    weak-NTP-level sync should be ok.
//!
//!  - The RPC fabric is not in here. The coordinator drives everything
//!    through the [ShardService] trait and an async task spawner; wire
//!    codecs, connection management and retries-with-backoff live behind
//!    that seam.

use futures::Future;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Transaction already completed")]
    AlreadyCompleted,
    #[error("{0}")]
    IllegalState(String),
    #[error("Transaction expired on its status shard")]
    Expired,
    #[error("Conflicting write observed, batch must be retried")]
    TryAgain,
    #[error("Status shard unavailable")]
    StatusShardUnavailable,
    #[error("Networking error")]
    NetworkingError,
}

mod clock;
mod hybridtime;
mod manager;
mod metadata;
mod participants;
mod readpoint;
mod service;
mod transaction;
pub mod wire;

// We define a BoxFuture-like wrapper type here and return it from the
// [ShardService] trait methods, for compilation and code footprint reasons:
// it costs an extra heap allocation per async call, but keeps the trait
// object-safe and lets implementations be written as plain async fns wrapped
// in Box::pin. We don't use the standard BoxFuture type because we want our
// boxed futures to also implement Sync, which the standard one doesn't.
pub type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use clock::{Clock, HybridClock, RealClock, TestClock};
pub use hybridtime::HybridTime;
pub use manager::{TransactionConfig, TransactionManager};
pub use metadata::{IsolationLevel, TransactionId, TransactionMetadata};
pub use participants::{ParticipantRecord, ParticipantTable, ShardId};
pub use readpoint::ReadPoint;
pub use service::{ShardRoute, ShardService};
pub use transaction::{BatchMetadata, InFlightOp, Transaction, TransactionState, Waiter};
