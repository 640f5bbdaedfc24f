//! The control-channel boundary: `stats()`/`active_queues()` broadcast
//! replies and transport-specific queue introspection. Both traits are the
//! one place the out-of-scope broker client library is consumed from this
//! crate (spec.md §1, §4.6).

use async_trait::async_trait;
use qwatch_core::ExporterError;

/// One worker's reply to a `stats()` broadcast.
#[derive(Debug, Clone)]
pub struct WorkerStatsEntry {
    pub hostname: String,
    /// The worker's pool process identifiers; concurrency is `len()` of
    /// this, per spec.md §4.6 step 3 ("concurrency = len(pool.processes)").
    pub pool_processes: Vec<String>,
}

/// One worker's reply to an `active_queues()` broadcast: which queues it is
/// currently bound to and consuming from.
#[derive(Debug, Clone)]
pub struct ActiveQueuesEntry {
    pub hostname: String,
    pub queues: Vec<String>,
}

/// The broker's control channel: broadcast RPCs answered by every
/// connected worker. Either reply may come back empty (no workers online)
/// — that is not an error.
#[async_trait]
pub trait BrokerControl: Send + Sync {
    async fn worker_stats(&self) -> Result<Vec<WorkerStatsEntry>, ExporterError>;
    async fn active_queues(&self) -> Result<Vec<ActiveQueuesEntry>, ExporterError>;
}

/// Length and consumer count for one physical queue name.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub length: u64,
    /// `None` for transports that don't expose a consumer-count concept
    /// (Redis-family — spec.md §4.6 step 4 only asks for `LLEN` there).
    pub consumer_count: Option<u64>,
}

/// Transport-specific per-queue introspection (spec.md §4.6 step 4).
/// Implementations distinguish "the queue doesn't exist yet" (publish
/// zeroes, see `QueueStats::default()`) from a genuine broker fault
/// (returned as `Err`, propagated to the HTTP layer as a 500, spec.md §7)
/// by matching the transport's own NOT_FOUND signal internally rather than
/// surfacing a dedicated outcome type here.
#[async_trait]
pub trait QueueIntrospector: Send + Sync {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, ExporterError>;
}

/// An in-memory test double standing in for an actual broker connection,
/// used by `qwatch-server`'s scenario tests (spec.md §8 Scenario C, G).
#[derive(Default)]
pub struct InMemoryBroker {
    pub workers: parking_lot::Mutex<Vec<WorkerStatsEntry>>,
    pub bindings: parking_lot::Mutex<Vec<ActiveQueuesEntry>>,
    pub queues: parking_lot::Mutex<std::collections::HashMap<String, QueueStats>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue(&self, name: impl Into<String>, length: u64, consumer_count: u64) {
        self.queues.lock().insert(
            name.into(),
            QueueStats {
                length,
                consumer_count: Some(consumer_count),
            },
        );
    }

    pub fn bind_worker(&self, hostname: impl Into<String>, pool_size: usize, queues: Vec<String>) {
        let hostname = hostname.into();
        self.workers.lock().push(WorkerStatsEntry {
            hostname: hostname.clone(),
            pool_processes: (0..pool_size).map(|i| format!("pid-{i}")).collect(),
        });
        self.bindings.lock().push(ActiveQueuesEntry { hostname, queues });
    }
}

#[async_trait]
impl BrokerControl for InMemoryBroker {
    async fn worker_stats(&self) -> Result<Vec<WorkerStatsEntry>, ExporterError> {
        Ok(self.workers.lock().clone())
    }

    async fn active_queues(&self) -> Result<Vec<ActiveQueuesEntry>, ExporterError> {
        Ok(self.bindings.lock().clone())
    }
}

#[async_trait]
impl QueueIntrospector for InMemoryBroker {
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, ExporterError> {
        Ok(self.queues.lock().get(queue).copied().unwrap_or_default())
    }
}
