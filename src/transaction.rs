// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

//! A [Transaction] is the client-side coordinator for one atomic multi-shard
//! transaction attempt. The client talks to data-bearing shards directly and
//! in parallel; the coordinator's job is the bookkeeping around that traffic:
//!
//!   - It lazily resolves a cluster-assigned _status shard_ which arbitrates
//!     the transaction's fate, coalescing concurrent demands into a single
//!     resolution.
//!
//!   - Until the status shard has acknowledged the transaction's creation the
//!     coordinator is not _ready_; operations that need the status shard park
//!     a continuation in a waiter queue and are re-run by their callers once
//!     readiness (or failure) is signalled.
//!
//!   - It keeps the transaction alive with periodic keep-alive heartbeats to
//!     the status shard, and tracks every participant shard so commit can
//!     reference all of them in a single status-record update -- there is no
//!     voting round.
//!
//!   - It carries the consistent read point across shards and coordinates the
//!     restart dance when some shard reports a read conflict.
//!
//!   - It can spawn nested ("child") coordinators that run under the parent's
//!     identity and are merged back in through a serializable envelope.
//!
//! The coordinator owns no threads. Everything asynchronous runs as a spawned
//! task; spawned work holds the coordinator alive only while actually in
//! flight, and the heartbeat task in particular downgrades to a weak reference
//! between sends so a dropped transaction stops heartbeating on its own.

use crate::wire::{
    AbortTransactionRequest, ChildTransactionData, ChildTransactionResult, TxnStatePayload,
    TxnStatus, UpdateTransactionRequest,
};
use crate::{
    Error, HybridTime, IsolationLevel, ParticipantTable, ReadPoint, ShardId, ShardRoute,
    TransactionId, TransactionManager, TransactionMetadata,
};
use async_std::{
    future,
    sync::{Arc, Mutex, Weak},
    task,
};
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, debug_span, error, warn, Instrument};

/// Lifecycle of a transaction attempt. Moves forward only: once a transaction
/// leaves `Running` it never returns.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

fn state_from_u8(raw: u8) -> TransactionState {
    match raw {
        0 => TransactionState::Running,
        1 => TransactionState::Committed,
        _ => TransactionState::Aborted,
    }
}

/// A continuation parked on a transaction that is not ready yet. Fired exactly
/// once, in insertion order: with `Ok` when the status shard acknowledges the
/// transaction's creation, or with the error if initialization failed.
pub type Waiter = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Descriptor of one application operation queued into a batch: the shard it
/// is destined for, and -- once the batch has completed -- whether it
/// succeeded there.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct InFlightOp {
    pub shard: ShardId,
    pub succeeded: bool,
}

impl InFlightOp {
    pub fn new(shard: ShardId) -> InFlightOp {
        InFlightOp {
            shard,
            succeeded: false,
        }
    }
}

/// What a prepared batch has to carry to its shards: the full transaction
/// metadata while some destination shard has not been told it yet, or just
/// the transaction id once every destination has.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchMetadata {
    Full(TransactionMetadata),
    IdOnly(TransactionId),
}

// State behind the coordinator mutex. The lock is held only for bookkeeping,
// never across an RPC.
struct Progress {
    metadata: TransactionMetadata,
    read_point: ReadPoint,
    route: Option<ShardRoute>,
    ready: bool,
    error: Option<Error>,
    commit_waker: Option<oneshot::Sender<Result<(), Error>>>,
    participants: ParticipantTable,
    waiters: Vec<Waiter>,
}

struct Inner {
    manager: TransactionManager,
    id: TransactionId,
    child: bool,
    state: AtomicU8,
    requested_status_shard: AtomicBool,
    progress: Mutex<Progress>,
}

impl Inner {
    fn state(&self) -> TransactionState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn store_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn check_running(&self, progress: &Progress) -> Result<(), Error> {
        if self.state() != TransactionState::Running {
            return Err(progress.error.clone().unwrap_or(Error::AlreadyCompleted));
        }
        Ok(())
    }
}

/// Client handle for one transaction attempt. Cheap to clone; all clones refer
/// to the same coordinator.
pub struct Transaction {
    inner: Arc<Inner>,
}

impl Clone for Transaction {
    fn clone(&self) -> Self {
        Transaction {
            inner: self.inner.clone(),
        }
    }
}

impl Transaction {
    /// Starts a new top-level transaction. Construction is purely local: the
    /// status shard is resolved lazily, on the first operation that needs it.
    pub fn new(manager: &TransactionManager, isolation: IsolationLevel) -> Transaction {
        let mut read_point = ReadPoint::default();
        let metadata = match isolation {
            IsolationLevel::Snapshot => {
                let now = manager.now();
                read_point.set_read_time_to(now);
                TransactionMetadata::new(isolation, now)
            }
            // The read time is chosen when the first read executes.
            IsolationLevel::Serializable => TransactionMetadata::new(isolation, manager.now()),
        };
        debug!("started transaction {:?}", metadata.transaction_id);
        Transaction::from_parts(manager, metadata, read_point, false, false)
    }

    /// Starts a child transaction from a parent's envelope. A child inherits
    /// the parent's identity and read point, is ready immediately, and never
    /// commits or aborts on its own -- it is finished and merged back into
    /// the parent.
    pub fn new_child(manager: &TransactionManager, data: ChildTransactionData) -> Transaction {
        let mut read_point = ReadPoint::default();
        read_point.set_read_time(data.read_time, data.local_limits);
        debug!("started child transaction {:?}", data.metadata.transaction_id);
        Transaction::from_parts(manager, data.metadata, read_point, true, true)
    }

    fn from_parts(
        manager: &TransactionManager,
        metadata: TransactionMetadata,
        read_point: ReadPoint,
        child: bool,
        ready: bool,
    ) -> Transaction {
        Transaction {
            inner: Arc::new(Inner {
                manager: manager.clone(),
                id: metadata.transaction_id,
                child,
                state: AtomicU8::new(TransactionState::Running as u8),
                requested_status_shard: AtomicBool::new(false),
                progress: Mutex::new(Progress {
                    metadata,
                    read_point,
                    route: None,
                    ready,
                    error: None,
                    commit_waker: None,
                    participants: ParticipantTable::default(),
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Lock-free state check; pairs with the release stores on transition.
    pub fn state(&self) -> TransactionState {
        self.inner.state()
    }

    /// Called before a batch is sent. When the transaction is not ready yet,
    /// parks `waiter` (fired on readiness or failure), triggers status-shard
    /// resolution, and returns `None`; the caller must postpone the batch and
    /// prepare it again later. When ready, records every destination shard as
    /// a participant and returns what the batch must carry.
    pub async fn prepare(&self, ops: &[InFlightOp], waiter: Waiter) -> Option<BatchMetadata> {
        let mut progress = self.inner.progress.lock().await;
        if !progress.ready {
            progress.waiters.push(waiter);
            drop(progress);
            self.request_status_shard();
            debug!("prepare of {:?} rejected, not ready yet", self.inner.id);
            return None;
        }
        let mut needs_parameters = false;
        for op in ops {
            needs_parameters |= progress.participants.note(op.shard);
        }
        Some(if needs_parameters {
            BatchMetadata::Full(progress.metadata.clone())
        } else {
            BatchMetadata::IdOnly(progress.metadata.transaction_id)
        })
    }

    /// Called after a batch completes. On success, every shard that executed
    /// an op has learned the full transaction metadata and future batches to
    /// it may carry the id alone. A retriable conflict invalidates the whole
    /// transaction; any other failure is reported through the batch's own
    /// completion path and is not the coordinator's to handle.
    pub async fn flushed(&self, ops: &[InFlightOp], status: Result<(), Error>) {
        match status {
            Ok(()) => {
                let mut progress = self.inner.progress.lock().await;
                for op in ops {
                    if op.succeeded {
                        progress.participants.mark_has_parameters(op.shard);
                    }
                }
            }
            Err(Error::TryAgain) => self.set_error(Error::TryAgain).await,
            Err(_) => (),
        }
    }

    /// Commits the transaction: one status-record update naming every
    /// participant shard. Resolves when the status shard acknowledges. A
    /// transaction that wrote nothing commits trivially -- its status record
    /// is dropped instead, invisibly to the caller.
    pub async fn commit(&self) -> Result<(), Error> {
        let span = debug_span!("commit", txn = ?self.inner.id);
        async move {
            let receiver = {
                let mut progress = self.inner.progress.lock().await;
                self.inner.check_running(&progress)?;
                if self.inner.child {
                    return Err(Error::IllegalState(
                        "commit of a child transaction is not allowed".into(),
                    ));
                }
                if progress.read_point.is_restart_required() {
                    return Err(Error::IllegalState(
                        "commit of a transaction that requires restart is not allowed".into(),
                    ));
                }
                self.inner.store_state(TransactionState::Committed);
                let (sender, receiver) = oneshot::channel();
                progress.commit_waker = Some(sender);
                if progress.ready {
                    drop(progress);
                    self.do_commit(Ok(())).await;
                } else {
                    let this = self.clone();
                    progress.waiters.push(Box::new(move |outcome| {
                        task::spawn(async move { this.do_commit(outcome).await });
                    }));
                    drop(progress);
                    self.request_status_shard();
                }
                receiver
            };
            match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::NetworkingError),
            }
        }
        .instrument(span)
        .await
    }

    /// Aborts the transaction. Fire-and-forget from the caller's point of
    /// view: the status shard is told, but nobody waits for it to answer.
    pub async fn abort(&self) {
        let span = debug_span!("abort", txn = ?self.inner.id);
        async move {
            {
                let mut progress = self.inner.progress.lock().await;
                let state = self.inner.state();
                if state != TransactionState::Running {
                    if state != TransactionState::Aborted {
                        warn!("abort of a committed transaction");
                    }
                    return;
                }
                if self.inner.child {
                    warn!("abort of a child transaction");
                    return;
                }
                self.inner.store_state(TransactionState::Aborted);
                if !progress.ready {
                    let this = self.clone();
                    progress.waiters.push(Box::new(move |outcome| {
                        task::spawn(async move { this.do_abort(outcome).await });
                    }));
                    drop(progress);
                    self.request_status_shard();
                    return;
                }
            }
            self.do_abort(Ok(())).await;
        }
        .instrument(span)
        .await
    }

    /// Builds the sibling transaction that reruns this one after a read
    /// conflict: same isolation, fresh identity, read point advanced strictly
    /// forward, to at or past the highest conflicting observation. This
    /// transaction is aborted.
    pub async fn create_restarted_transaction(&self) -> Result<Transaction, Error> {
        let sibling = {
            let mut progress = self.inner.progress.lock().await;
            self.inner.check_running(&progress)?;
            if self.inner.child {
                return Err(Error::IllegalState(
                    "restart of a child transaction is not allowed".into(),
                ));
            }
            if !progress.read_point.is_restart_required() {
                return Err(Error::IllegalState(
                    "restart of a transaction that does not require it".into(),
                ));
            }
            debug!("restarting {:?}", self.inner.id);
            let sibling = Transaction::new(&self.inner.manager, progress.metadata.isolation);
            {
                // The sibling is freshly constructed and unshared; the nested
                // lock cannot contend.
                let mut sibling_progress = sibling.inner.progress.lock().await;
                sibling_progress.read_point = std::mem::take(&mut progress.read_point);
                sibling_progress.read_point.restart();
            }
            self.inner.store_state(TransactionState::Aborted);
            sibling
        };
        self.do_abort(Ok(())).await;
        Ok(sibling)
    }

    /// Serializes this transaction into an envelope a child coordinator can
    /// be constructed from, waiting for readiness first if necessary.
    pub async fn prepare_child(&self) -> Result<ChildTransactionData, Error> {
        let mut progress = self.inner.progress.lock().await;
        self.inner.check_running(&progress)?;
        if progress.read_point.is_restart_required() {
            return Err(Error::IllegalState("restart required".into()));
        }
        if progress.ready {
            return Ok(Self::child_data(&progress));
        }
        let (sender, receiver) = oneshot::channel();
        progress.waiters.push(Box::new(move |outcome| {
            let _ = sender.send(outcome);
        }));
        drop(progress);
        self.request_status_shard();
        receiver.await.map_err(|_| Error::NetworkingError)??;
        let progress = self.inner.progress.lock().await;
        Ok(Self::child_data(&progress))
    }

    /// Finishes a child transaction and hands back what the parent needs to
    /// merge: the participant table and the read-point updates. The child
    /// transitions to Committed as a sentinel; actually committing the work
    /// is the parent's job.
    pub async fn finish_child(&self) -> Result<ChildTransactionResult, Error> {
        let progress = self.inner.progress.lock().await;
        self.inner.check_running(&progress)?;
        if !self.inner.child {
            return Err(Error::IllegalState(
                "finish child of a non-child transaction".into(),
            ));
        }
        self.inner.store_state(TransactionState::Committed);
        let mut result = ChildTransactionResult {
            shards: progress.participants.entries(),
            read_point_delta: Default::default(),
        };
        progress
            .read_point
            .finish_child_result(&mut result.read_point_delta);
        Ok(result)
    }

    /// Merges a finished child back into this (parent) transaction.
    pub async fn apply_child_result(&self, result: &ChildTransactionResult) -> Result<(), Error> {
        let mut progress = self.inner.progress.lock().await;
        self.inner.check_running(&progress)?;
        if self.inner.child {
            return Err(Error::IllegalState(
                "apply child result of a child transaction".into(),
            ));
        }
        for entry in &result.shards {
            progress
                .participants
                .merge(entry.shard, entry.has_parameters);
        }
        progress
            .read_point
            .apply_child_result(&result.read_point_delta);
        Ok(())
    }

    /// The transaction's metadata, complete with its status shard; waits for
    /// readiness if resolution is still in flight.
    pub async fn metadata(&self) -> Result<TransactionMetadata, Error> {
        {
            let mut progress = self.inner.progress.lock().await;
            if progress.ready {
                return Ok(progress.metadata.clone());
            }
            let (sender, receiver) = oneshot::channel();
            progress.waiters.push(Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }));
            drop(progress);
            self.request_status_shard();
            receiver
        }
        .await
        .map_err(|_| Error::NetworkingError)??;
        Ok(self.inner.progress.lock().await.metadata.clone())
    }

    pub async fn read_time(&self) -> Option<HybridTime> {
        self.inner.progress.lock().await.read_point.read_time()
    }

    /// Pins the read point to the current clock; used just before the first
    /// read under isolation levels that defer the choice.
    pub async fn set_current_read_time(&self) {
        let now = self.inner.manager.now();
        self.inner
            .progress
            .lock()
            .await
            .read_point
            .set_read_time_to(now);
    }

    /// Records a shard's uncertainty bound from a read response.
    pub async fn update_local_limit(&self, shard: ShardId, limit: HybridTime) {
        self.inner
            .progress
            .lock()
            .await
            .read_point
            .update_local_limit(shard, limit);
    }

    /// Records that `shard` reported a committed value newer than our read
    /// time; the transaction has to restart to see a consistent snapshot.
    pub async fn observed_conflict(&self, shard: ShardId, observed: HybridTime) {
        self.inner
            .progress
            .lock()
            .await
            .read_point
            .observed_conflict(shard, observed);
    }

    pub async fn is_restart_required(&self) -> bool {
        self.inner
            .progress
            .lock()
            .await
            .read_point
            .is_restart_required()
    }

    fn child_data(progress: &Progress) -> ChildTransactionData {
        let mut data = ChildTransactionData {
            metadata: progress.metadata.clone(),
            read_time: None,
            local_limits: Default::default(),
        };
        progress.read_point.prepare_child_data(&mut data);
        data
    }

    /// Kicks off status-shard resolution; concurrent demands coalesce into a
    /// single attempt.
    fn request_status_shard(&self) {
        if self
            .inner
            .requested_status_shard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        let span = debug_span!("resolve-status-shard", txn = ?self.inner.id);
        task::spawn(async move { this.resolve_status_shard().await }.instrument(span));
    }

    async fn resolve_status_shard(self) {
        let shard = match self.inner.manager.pick_status_shard().await {
            Ok(shard) => shard,
            Err(e) => {
                warn!("status shard pick failed: {}", e);
                self.set_error(e).await;
                return;
            }
        };
        debug!("picked status shard {:?}", shard);
        let route = match self.inner.manager.lookup_shard(shard).await {
            Ok(route) => route,
            Err(e) => {
                warn!("status shard lookup failed: {}", e);
                self.set_error(e).await;
                return;
            }
        };
        {
            let mut progress = self.inner.progress.lock().await;
            progress.metadata.status_shard = Some(route.shard);
            progress.route = Some(route);
        }
        let span = debug_span!("heartbeat", txn = ?self.inner.id);
        task::spawn(
            heartbeat_loop(Arc::downgrade(&self.inner), TxnStatus::Created).instrument(span),
        );
    }

    /// Records the first error that invalidates the transaction, aborts it,
    /// and fires every parked waiter with that error. Later errors are
    /// dropped.
    async fn set_error(&self, error: Error) {
        let waiters = {
            let mut progress = self.inner.progress.lock().await;
            if progress.error.is_some() {
                return;
            }
            warn!("transaction {:?} failed: {}", self.inner.id, error);
            progress.error = Some(error.clone());
            self.inner.store_state(TransactionState::Aborted);
            std::mem::take(&mut progress.waiters)
        };
        for waiter in waiters {
            waiter(Err(error.clone()));
        }
    }

    async fn do_commit(&self, outcome: Result<(), Error>) {
        if let Err(e) = outcome {
            self.finish_commit(Err(e)).await;
            return;
        }
        let (route, request) = {
            let progress = self.inner.progress.lock().await;
            debug!(
                "commit, participants: {:?}",
                progress.participants.shard_ids()
            );
            match progress.route {
                None => (None, None),
                Some(route) if progress.participants.is_empty() => (Some(route), None),
                Some(route) => {
                    let request = UpdateTransactionRequest {
                        shard: route.shard,
                        propagated_hybrid_time: self.inner.manager.now(),
                        state: TxnStatePayload {
                            transaction_id: self.inner.id,
                            status: TxnStatus::Committed,
                            shards: progress.participants.shard_ids(),
                        },
                    };
                    (Some(route), Some(request))
                }
            }
        };
        let route = match route {
            Some(route) => route,
            None => {
                error!("commit ran without a resolved status shard");
                self.finish_commit(Err(Error::StatusShardUnavailable)).await;
                return;
            }
        };
        let request = match request {
            // The transaction wrote nothing, so there is nothing to commit:
            // drop the status record, and report success to the caller.
            None => {
                self.do_abort(Ok(())).await;
                self.finish_commit(Ok(())).await;
                return;
            }
            Some(request) => request,
        };
        let result = self
            .inner
            .manager
            .service()
            .update_transaction(route, request, self.inner.manager.rpc_deadline())
            .await;
        let delivered = match result {
            Ok(response) => {
                if let Some(ht) = response.propagated_hybrid_time {
                    self.inner.manager.update_clock(ht);
                }
                Ok(())
            }
            Err(e) => Err(e),
        };
        debug!("committed: {:?}", delivered);
        self.finish_commit(delivered).await;
    }

    async fn finish_commit(&self, outcome: Result<(), Error>) {
        let waker = self.inner.progress.lock().await.commit_waker.take();
        match waker {
            Some(waker) => {
                let _ = waker.send(outcome);
            }
            None => warn!("commit completion with nobody waiting"),
        }
    }

    async fn do_abort(&self, outcome: Result<(), Error>) {
        if let Err(e) = outcome {
            // Heartbeats have already stopped, so the status shard will
            // expire the transaction on its own.
            warn!("failed to abort transaction: {}", e);
            return;
        }
        let (route, request) = {
            let progress = self.inner.progress.lock().await;
            match progress.route {
                None => {
                    // Resolution never completed: no status record exists,
                    // nothing to tear down.
                    debug!("abort with no status record, nothing to do");
                    (None, None)
                }
                Some(route) => {
                    let request = AbortTransactionRequest {
                        shard: route.shard,
                        propagated_hybrid_time: self.inner.manager.now(),
                        transaction_id: self.inner.id,
                    };
                    (Some(route), Some(request))
                }
            }
        };
        if let (Some(route), Some(request)) = (route, request) {
            let manager = self.inner.manager.clone();
            let deadline = manager.rpc_deadline();
            let span = debug_span!("abort-rpc", txn = ?self.inner.id);
            task::spawn(
                async move {
                    match manager
                        .service()
                        .abort_transaction(route, request, deadline)
                        .await
                    {
                        Ok(response) => {
                            if let Some(ht) = response.propagated_hybrid_time {
                                manager.update_clock(ht);
                            }
                        }
                        Err(e) => warn!("abort rpc failed: {}", e),
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn heartbeat_step(&self, status: TxnStatus) -> HeartbeatStep {
        if self.inner.state() != TransactionState::Running {
            debug!("heartbeat stopping, transaction completed");
            return HeartbeatStep::Stop;
        }
        let interval = self.inner.manager.config().heartbeat_interval;
        if status != TxnStatus::Created && self.inner.manager.config().disable_heartbeat_in_tests {
            return HeartbeatStep::Sleep(interval);
        }
        let (route, request) = {
            let progress = self.inner.progress.lock().await;
            let route = match progress.route {
                Some(route) => route,
                None => {
                    error!("heartbeat without a resolved status shard");
                    return HeartbeatStep::Stop;
                }
            };
            let request = UpdateTransactionRequest {
                shard: route.shard,
                propagated_hybrid_time: self.inner.manager.now(),
                state: TxnStatePayload {
                    transaction_id: self.inner.id,
                    status,
                    shards: Vec::new(),
                },
            };
            (route, request)
        };
        let result = self
            .inner
            .manager
            .service()
            .update_transaction(route, request, self.inner.manager.rpc_deadline())
            .await;
        match result {
            Ok(response) => {
                if let Some(ht) = response.propagated_hybrid_time {
                    self.inner.manager.update_clock(ht);
                }
                if status == TxnStatus::Created {
                    let waiters = {
                        let mut progress = self.inner.progress.lock().await;
                        debug_assert!(!progress.ready);
                        progress.ready = true;
                        std::mem::take(&mut progress.waiters)
                    };
                    debug!("created, notifying {:?} waiters", waiters.len());
                    for waiter in waiters {
                        waiter(Ok(()));
                    }
                }
                HeartbeatStep::Sleep(interval)
            }
            Err(Error::Expired) => {
                self.set_error(Error::Expired).await;
                HeartbeatStep::Stop
            }
            Err(e) => {
                // Could have any number of causes; just send it again.
                warn!("send heartbeat failed: {}", e);
                HeartbeatStep::Retry
            }
        }
    }
}

enum HeartbeatStep {
    Stop,
    Retry,
    Sleep(std::time::Duration),
}

// Keep-alive loop for one transaction. Holds only a weak reference while
// parked between sends, so a transaction dropped by the application stops
// heartbeating at the next wakeup instead of being kept alive by its own
// keep-alives.
async fn heartbeat_loop(weak: Weak<Inner>, mut status: TxnStatus) {
    loop {
        let step = {
            let txn = match weak.upgrade() {
                None => return,
                Some(inner) => Transaction { inner },
            };
            txn.heartbeat_step(status).await
        };
        match step {
            HeartbeatStep::Stop => return,
            HeartbeatStep::Retry => (),
            HeartbeatStep::Sleep(interval) => {
                status = TxnStatus::Pending;
                let never = future::pending::<()>();
                let _ = future::timeout(interval, never).await;
            }
        }
    }
}
