// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use hydria::wire::{
    AbortTransactionRequest, AbortTransactionResponse, TxnStatus, UpdateTransactionRequest,
    UpdateTransactionResponse,
};
use hydria::{
    BatchMetadata, Error, HybridTime, InFlightOp, IsolationLevel, ShardId, ShardRoute,
    ShardService, SyncBoxFuture, TestClock, Transaction, TransactionConfig, TransactionManager,
    TransactionState, Waiter,
};

use async_std::task;
use futures::channel::oneshot;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATUS_SHARD: ShardId = ShardId(7);

#[derive(Clone, Debug, PartialEq, Eq)]
enum SentRequest {
    Update(TxnStatus, Vec<ShardId>),
    Abort,
}

/// Shared state of the scripted shard service: counters, canned responses and
/// a log of everything the coordinator sent.
struct ScriptState {
    picks: AtomicUsize,
    /// When set, status-shard picking fails with this error.
    pick_error: Mutex<Option<Error>>,
    /// When set, status-shard picking parks until the gate fires.
    pick_gate: Mutex<Option<oneshot::Receiver<()>>>,
    /// Canned responses for Created/Pending updates, in order; empty means Ok.
    heartbeat_script: Mutex<VecDeque<Result<(), Error>>>,
    /// Canned responses for Committed updates, in order; empty means Ok.
    commit_script: Mutex<VecDeque<Result<(), Error>>>,
    requests: Mutex<Vec<SentRequest>>,
    times: AtomicU64,
}

impl ScriptState {
    fn new() -> Arc<ScriptState> {
        Arc::new(ScriptState {
            picks: AtomicUsize::new(0),
            pick_error: Mutex::new(None),
            pick_gate: Mutex::new(None),
            heartbeat_script: Mutex::new(VecDeque::new()),
            commit_script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            times: AtomicU64::new(0),
        })
    }

    fn next_time(&self) -> HybridTime {
        HybridTime::new(1_000_000 + self.times.fetch_add(1, Ordering::SeqCst), 0)
    }

    fn requests(&self) -> Vec<SentRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn count_updates(&self, status: TxnStatus) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, SentRequest::Update(s, _) if *s == status))
            .count()
    }

    fn count_aborts(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, SentRequest::Abort))
            .count()
    }

    fn committed_shards(&self) -> Option<Vec<ShardId>> {
        self.requests().iter().find_map(|r| match r {
            SentRequest::Update(TxnStatus::Committed, shards) => Some(shards.clone()),
            _ => None,
        })
    }
}

/// A [ShardService] whose behavior is scripted by a [ScriptState].
struct ScriptedShards(Arc<ScriptState>);

impl ShardService for ScriptedShards {
    fn pick_status_shard(&self) -> SyncBoxFuture<Result<ShardId, Error>> {
        let state = self.0.clone();
        Box::pin(async move {
            state.picks.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = state.pick_error.lock().unwrap().clone() {
                return Err(error);
            }
            let gate = state.pick_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(STATUS_SHARD)
        })
    }

    fn lookup_shard(
        &self,
        shard: ShardId,
        _deadline: Duration,
        _fast_path: bool,
    ) -> SyncBoxFuture<Result<ShardRoute, Error>> {
        Box::pin(async move {
            Ok(ShardRoute {
                shard,
                generation: 1,
            })
        })
    }

    fn update_transaction(
        &self,
        _route: ShardRoute,
        req: UpdateTransactionRequest,
        _deadline: Duration,
    ) -> SyncBoxFuture<Result<UpdateTransactionResponse, Error>> {
        let state = self.0.clone();
        Box::pin(async move {
            let status = req.state.status;
            state
                .requests
                .lock()
                .unwrap()
                .push(SentRequest::Update(status, req.state.shards.clone()));
            let outcome = match status {
                TxnStatus::Committed => state.commit_script.lock().unwrap().pop_front(),
                _ => state.heartbeat_script.lock().unwrap().pop_front(),
            }
            .unwrap_or(Ok(()));
            outcome.map(|()| UpdateTransactionResponse {
                propagated_hybrid_time: Some(state.next_time()),
            })
        })
    }

    fn abort_transaction(
        &self,
        _route: ShardRoute,
        _req: AbortTransactionRequest,
        _deadline: Duration,
    ) -> SyncBoxFuture<Result<AbortTransactionResponse, Error>> {
        let state = self.0.clone();
        Box::pin(async move {
            state.requests.lock().unwrap().push(SentRequest::Abort);
            Ok(AbortTransactionResponse {
                propagated_hybrid_time: Some(state.next_time()),
            })
        })
    }
}

/// Tight heartbeat interval, keep-alives short-circuited: scenarios that do
/// not exercise the keep-alive loop use this so request logs stay exact.
fn quiet_config() -> TransactionConfig {
    TransactionConfig {
        heartbeat_interval: Duration::from_millis(2),
        max_clock_skew: Duration::from_millis(1),
        disable_heartbeat_in_tests: true,
    }
}

/// Tight heartbeat interval with live keep-alives.
fn live_config() -> TransactionConfig {
    TransactionConfig {
        disable_heartbeat_in_tests: false,
        ..quiet_config()
    }
}

fn mk_manager(script: &Arc<ScriptState>, config: TransactionConfig) -> TransactionManager {
    TransactionManager::new(
        Box::new(TestClock::new()),
        Arc::new(ScriptedShards(script.clone())),
        config,
    )
}

/// A waiter that forwards its outcome into a oneshot the test can await.
fn readiness_probe() -> (Waiter, oneshot::Receiver<Result<(), Error>>) {
    let (sender, receiver) = oneshot::channel();
    let waiter: Waiter = Box::new(move |outcome| {
        let _ = sender.send(outcome);
    });
    (waiter, receiver)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        task::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

/// Drives a not-yet-ready transaction to readiness through the waiter path.
async fn await_ready(txn: &Transaction) {
    let (waiter, ready) = readiness_probe();
    match txn.prepare(&[], waiter).await {
        Some(_) => (),
        None => ready
            .await
            .expect("readiness probe dropped")
            .expect("transaction failed to initialize"),
    }
}

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn read_only_commit() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        txn.commit().await.expect("read-only commit should succeed");
        wait_until(|| script.count_aborts() >= 1).await;

        assert_eq!(script.picks.load(Ordering::SeqCst), 1);
        assert_eq!(script.count_updates(TxnStatus::Created), 1);
        assert_eq!(script.count_updates(TxnStatus::Pending), 0);
        assert_eq!(script.count_updates(TxnStatus::Committed), 0);
        assert_eq!(script.count_aborts(), 1);
        assert_eq!(txn.state(), TransactionState::Committed);
    });
}

pub fn prepare_queues_until_ready() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        let a = ShardId(1);
        let ops = [InFlightOp::new(a)];

        let (waiter, ready) = readiness_probe();
        assert!(txn.prepare(&ops, waiter).await.is_none());
        ready.await.unwrap().expect("initialization failed");

        let (waiter, _unused) = readiness_probe();
        let batch = txn.prepare(&ops, waiter).await.expect("ready now");
        match batch {
            BatchMetadata::Full(metadata) => {
                assert_eq!(metadata.transaction_id, txn.id());
                assert_eq!(metadata.status_shard, Some(STATUS_SHARD));
            }
            BatchMetadata::IdOnly(_) => panic!("first batch must carry full metadata"),
        }
        assert_eq!(
            txn.metadata().await.unwrap().status_shard,
            Some(STATUS_SHARD)
        );

        let done = [InFlightOp { shard: a, succeeded: true }];
        txn.flushed(&done, Ok(())).await;
        txn.commit().await.expect("commit should succeed");

        assert_eq!(script.picks.load(Ordering::SeqCst), 1);
        assert_eq!(script.committed_shards(), Some(vec![a]));
    });
}

pub fn second_prepare_carries_id_only() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        await_ready(&txn).await;

        let a = ShardId(1);
        let ops = [InFlightOp::new(a)];
        let (waiter, _unused) = readiness_probe();
        assert!(matches!(
            txn.prepare(&ops, waiter).await,
            Some(BatchMetadata::Full(_))
        ));
        let done = [InFlightOp { shard: a, succeeded: true }];
        txn.flushed(&done, Ok(())).await;

        let (waiter, _unused) = readiness_probe();
        match txn.prepare(&ops, waiter).await {
            Some(BatchMetadata::IdOnly(id)) => assert_eq!(id, txn.id()),
            other => panic!("expected id-only metadata, got {:?}", other),
        }
    });
}

pub fn retriable_conflict_aborts() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        await_ready(&txn).await;

        let a = ShardId(1);
        let ops = [InFlightOp::new(a)];
        let (waiter, _unused) = readiness_probe();
        assert!(txn.prepare(&ops, waiter).await.is_some());
        txn.flushed(&ops, Err(Error::TryAgain)).await;

        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.commit().await, Err(Error::TryAgain));
    });
}

pub fn child_roundtrip() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let parent = Transaction::new(&manager, IsolationLevel::Snapshot);

        let a = ShardId(1);
        let b = ShardId(2);
        let (waiter, _unused) = readiness_probe();
        if parent.prepare(&[InFlightOp::new(a)], waiter).await.is_none() {
            await_ready(&parent).await;
            let (waiter, _unused) = readiness_probe();
            assert!(parent.prepare(&[InFlightOp::new(a)], waiter).await.is_some());
        }
        parent
            .flushed(&[InFlightOp { shard: a, succeeded: true }], Ok(()))
            .await;

        let data = parent.prepare_child().await.expect("prepare child");
        assert_eq!(data.metadata.transaction_id, parent.id());
        assert_eq!(data.read_time, parent.read_time().await);

        let child = Transaction::new_child(&manager, data);
        assert_eq!(child.id(), parent.id());

        // The child is ready immediately; its first batch still announces the
        // full metadata to shards the transaction has not visited.
        let (waiter, _unused) = readiness_probe();
        assert!(matches!(
            child.prepare(&[InFlightOp::new(b)], waiter).await,
            Some(BatchMetadata::Full(_))
        ));
        child
            .flushed(&[InFlightOp { shard: b, succeeded: true }], Ok(()))
            .await;
        child.update_local_limit(b, HybridTime::new(2_000_000, 0)).await;

        // A child neither commits nor aborts on its own.
        assert!(matches!(
            child.commit().await,
            Err(Error::IllegalState(_))
        ));
        child.abort().await;
        assert_eq!(child.state(), TransactionState::Running);

        let result = child.finish_child().await.expect("finish child");
        assert_eq!(child.state(), TransactionState::Committed);
        assert!(matches!(
            child.finish_child().await,
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(
            child.apply_child_result(&result).await,
            Err(Error::AlreadyCompleted)
        ));

        parent.apply_child_result(&result).await.expect("first merge");
        parent.apply_child_result(&result).await.expect("second merge");

        // Merging twice changed nothing: the envelope a further child would
        // get is stable.
        let limits = parent.prepare_child().await.unwrap().local_limits;
        assert_eq!(limits.get(&b), Some(&HybridTime::new(2_000_000, 0)));

        parent.commit().await.expect("commit");
        assert_eq!(script.committed_shards(), Some(vec![a, b]));
    });
}

pub fn waiters_fire_in_order() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let (gate_send, gate_recv) = oneshot::channel();
        *script.pick_gate.lock().unwrap() = Some(gate_recv);

        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        let ops = [InFlightOp::new(ShardId(1))];

        let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            let waiter: Waiter = Box::new(move |outcome| {
                outcome.expect("initialization failed");
                log.lock().unwrap().push(i);
            });
            assert!(txn.prepare(&ops, waiter).await.is_none());
        }

        gate_send.send(()).expect("resolution should be parked");
        wait_until(|| log.lock().unwrap().len() == 3).await;

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(script.picks.load(Ordering::SeqCst), 1);
    });
}

pub fn heartbeat_retries_transient_failures() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        for _ in 0..3 {
            script
                .heartbeat_script
                .lock()
                .unwrap()
                .push_back(Err(Error::NetworkingError));
        }
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        await_ready(&txn).await;

        assert_eq!(script.count_updates(TxnStatus::Created), 4);
        assert_eq!(txn.state(), TransactionState::Running);

        let a = ShardId(1);
        let (waiter, _unused) = readiness_probe();
        assert!(txn.prepare(&[InFlightOp::new(a)], waiter).await.is_some());
        txn.flushed(&[InFlightOp { shard: a, succeeded: true }], Ok(()))
            .await;
        txn.commit().await.expect("commit after flaky heartbeats");
        assert_eq!(script.committed_shards(), Some(vec![a]));
    });
}

pub fn heartbeat_expiry_surfaces_in_commit() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        {
            let mut hb = script.heartbeat_script.lock().unwrap();
            hb.push_back(Ok(())); // Created
            hb.push_back(Ok(())); // Pending
            hb.push_back(Ok(())); // Pending
            hb.push_back(Err(Error::Expired));
        }
        let manager = mk_manager(&script, live_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        await_ready(&txn).await;

        let a = ShardId(1);
        let (waiter, _unused) = readiness_probe();
        assert!(txn.prepare(&[InFlightOp::new(a)], waiter).await.is_some());
        txn.flushed(&[InFlightOp { shard: a, succeeded: true }], Ok(()))
            .await;

        wait_until(|| txn.state() == TransactionState::Aborted).await;
        assert_eq!(txn.commit().await, Err(Error::Expired));
        assert_eq!(script.count_updates(TxnStatus::Committed), 0);
    });
}

pub fn restart_after_conflict() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        await_ready(&txn).await;

        let a = ShardId(1);
        let (waiter, _unused) = readiness_probe();
        assert!(txn.prepare(&[InFlightOp::new(a)], waiter).await.is_some());
        txn.flushed(&[InFlightOp { shard: a, succeeded: true }], Ok(()))
            .await;

        let read_time = txn.read_time().await.expect("snapshot pins a read time");
        let conflict = HybridTime::new(read_time.micros() + 10, 0);
        txn.observed_conflict(a, conflict).await;
        assert!(txn.is_restart_required().await);
        assert!(matches!(txn.commit().await, Err(Error::IllegalState(_))));

        let sibling = txn
            .create_restarted_transaction()
            .await
            .expect("restart should be allowed");
        assert_ne!(sibling.id(), txn.id());
        assert!(!sibling.is_restart_required().await);
        assert!(sibling.read_time().await.expect("sibling read time") > read_time);
        assert_eq!(txn.state(), TransactionState::Aborted);
        wait_until(|| script.count_aborts() >= 1).await;

        assert_eq!(txn.commit().await, Err(Error::AlreadyCompleted));
    });
}

pub fn terminal_states_reject_reuse() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);
        txn.commit().await.expect("empty commit");

        assert_eq!(txn.commit().await, Err(Error::AlreadyCompleted));
        txn.abort().await;
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(matches!(
            txn.finish_child().await,
            Err(Error::AlreadyCompleted)
        ));
    });
}

pub fn resolution_failure_fails_waiters() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        *script.pick_error.lock().unwrap() = Some(Error::StatusShardUnavailable);

        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Snapshot);

        let (waiter, outcome) = readiness_probe();
        assert!(txn.prepare(&[InFlightOp::new(ShardId(1))], waiter).await.is_none());
        assert_eq!(
            outcome.await.expect("waiter must fire"),
            Err(Error::StatusShardUnavailable)
        );
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(txn.commit().await, Err(Error::StatusShardUnavailable));
        assert_eq!(script.picks.load(Ordering::SeqCst), 1);
    });
}

pub fn serializable_defers_read_time() {
    setup_tracing_subscriber();
    task::block_on(async {
        let script = ScriptState::new();
        let manager = mk_manager(&script, quiet_config());
        let txn = Transaction::new(&manager, IsolationLevel::Serializable);
        assert_eq!(txn.read_time().await, None);
        txn.set_current_read_time().await;
        assert!(txn.read_time().await.is_some());
    });
}
