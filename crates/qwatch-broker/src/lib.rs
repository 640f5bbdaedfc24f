//! Broker-probe: transport-aware queue-length and consumer-count queries
//! invoked once per HTTP scrape (spec.md §4.6).

pub mod control;
pub mod probe;
pub mod transports;

pub use control::{ActiveQueuesEntry, BrokerControl, QueueIntrospector, QueueStats, WorkerStatsEntry};
pub use probe::{BrokerProbe, PriorityConfig};
pub use transports::{AmqpBrokerControl, AmqpIntrospector, RedisBrokerControl, RedisIntrospector};
