// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Clock, Error, HybridClock, HybridTime, ShardId, ShardRoute, ShardService};
use async_std::sync::Arc;
use std::time::Duration;

/// Knobs shared by every transaction a manager creates. Immutable after
/// construction; callers wanting different settings construct another manager.
#[derive(Clone, Debug)]
pub struct TransactionConfig {
    /// Interval between keep-alive heartbeats to the status shard.
    pub heartbeat_interval: Duration,

    /// Assumed bound on clock skew between this process and any shard. RPC
    /// deadlines are derived from it.
    pub max_clock_skew: Duration,

    /// Skips keep-alive (but not Created) heartbeats, so tests can exercise
    /// server-side expiry without fighting the keep-alive loop.
    pub disable_heartbeat_in_tests: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            heartbeat_interval: Duration::from_micros(500_000),
            max_clock_skew: Duration::from_micros(50_000),
            disable_heartbeat_in_tests: false,
        }
    }
}

/// Main object that clients instantiate, once per process or service.
/// Encapsulates what every transaction shares: the hybrid clock, the
/// cluster-facing [ShardService], and the configuration. Cheap to clone; all
/// clones refer to the same state.
pub struct TransactionManager {
    clock: Arc<HybridClock>,
    service: Arc<dyn ShardService>,
    config: Arc<TransactionConfig>,
}

impl Clone for TransactionManager {
    fn clone(&self) -> Self {
        TransactionManager {
            clock: self.clock.clone(),
            service: self.service.clone(),
            config: self.config.clone(),
        }
    }
}

impl TransactionManager {
    pub fn new(
        clock: Box<dyn Clock>,
        service: Arc<dyn ShardService>,
        config: TransactionConfig,
    ) -> Self {
        TransactionManager {
            clock: Arc::new(HybridClock::new(clock)),
            service,
            config: Arc::new(config),
        }
    }

    /// Issues a fresh hybrid time from the local clock.
    pub fn now(&self) -> HybridTime {
        self.clock.now()
    }

    /// Feeds a hybrid time observed on the wire back into the local clock.
    pub fn update_clock(&self, observed: HybridTime) {
        self.clock.observe(observed);
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Deadline applied to each transaction-status RPC. Twice the skew bound
    /// leaves room for the receiving shard to wait out its own uncertainty
    /// window before answering.
    pub fn rpc_deadline(&self) -> Duration {
        self.config.max_clock_skew * 2
    }

    pub(crate) fn service(&self) -> &Arc<dyn ShardService> {
        &self.service
    }

    pub(crate) async fn pick_status_shard(&self) -> Result<ShardId, Error> {
        self.service.pick_status_shard().await
    }

    pub(crate) async fn lookup_shard(&self, shard: ShardId) -> Result<ShardRoute, Error> {
        self.service
            .lookup_shard(shard, self.rpc_deadline(), true)
            .await
    }
}
