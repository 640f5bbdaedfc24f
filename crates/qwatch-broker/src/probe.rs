//! The broker probe algorithm (spec.md §4.6), invoked once per HTTP scrape
//! by the scrape orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use qwatch_core::ExporterError;
use qwatch_metrics::registry::MetricRegistry;
use qwatch_state::tracker::StateTracker;
use tracing::debug;

use crate::control::{BrokerControl, QueueIntrospector};

/// Priority-aware queue fan-out (spec.md §4.6 step 5): when the broker's
/// transport options carry a priority-step list, every discovered queue is
/// queried once per step under a derived pseudo-queue name, and the
/// results are summed back onto the base queue's gauges — dashboards key
/// on the base `queue_name`, not on the internal priority encoding (see
/// DESIGN.md Open Question).
#[derive(Debug, Clone)]
pub struct PriorityConfig {
    pub steps: Vec<u32>,
    pub separator: String,
}

impl PriorityConfig {
    pub const DEFAULT_SEPARATOR: &'static str = "\u{6}\u{16}";

    fn pseudo_queue(&self, base: &str, step: u32) -> String {
        format!("{base}{}{step}", self.separator)
    }
}

pub struct BrokerProbe {
    control: Arc<dyn BrokerControl>,
    introspector: Arc<dyn QueueIntrospector>,
    priority: Option<PriorityConfig>,
}

impl BrokerProbe {
    pub fn new(
        control: Arc<dyn BrokerControl>,
        introspector: Arc<dyn QueueIntrospector>,
        priority: Option<PriorityConfig>,
    ) -> Self {
        Self {
            control,
            introspector,
            priority,
        }
    }

    /// Run one full probe pass: query worker stats/bindings, publish
    /// per-queue worker/process counts, then query each discovered queue's
    /// length and consumer count.
    pub async fn run(&self, tracker: &mut StateTracker, metrics: &MetricRegistry) -> Result<(), ExporterError> {
        let stats = self.control.worker_stats().await?;
        let bindings = self.control.active_queues().await?;

        let concurrency_by_host: HashMap<&str, usize> = stats
            .iter()
            .map(|entry| (entry.hostname.as_str(), entry.pool_processes.len()))
            .collect();

        let mut processes_per_queue: HashMap<String, u64> = HashMap::new();
        let mut workers_per_queue: HashMap<String, u64> = HashMap::new();

        for binding in &bindings {
            let concurrency = concurrency_by_host.get(binding.hostname.as_str()).copied().unwrap_or(0) as u64;
            for queue in &binding.queues {
                tracker.add_discovered_queue(queue.clone());
                *processes_per_queue.entry(queue.clone()).or_default() += concurrency;
                *workers_per_queue.entry(queue.clone()).or_default() += 1;
            }
        }

        let discovered: Vec<String> = tracker.discovered_queues().map(str::to_string).collect();

        for queue in &discovered {
            metrics.set_active_worker_count(queue, workers_per_queue.get(queue).copied().unwrap_or(0));
            metrics.set_active_process_count(queue, processes_per_queue.get(queue).copied().unwrap_or(0));

            let stats = self.query_queue(queue).await?;
            metrics.set_queue_length(queue, stats.length);
            if let Some(consumers) = stats.consumer_count {
                metrics.set_active_consumer_count(queue, consumers);
            }
        }

        Ok(())
    }

    /// Bounded broker reachability probe for `GET /health` (spec.md §6):
    /// one `worker_stats()` round-trip per attempt, each capped at 2
    /// seconds, retried once before giving up.
    pub async fn health_check(&self) -> bool {
        for _ in 0..2 {
            let attempt = tokio::time::timeout(std::time::Duration::from_secs(2), self.control.worker_stats()).await;
            if matches!(attempt, Ok(Ok(_))) {
                return true;
            }
        }
        false
    }

    async fn query_queue(&self, queue: &str) -> Result<crate::control::QueueStats, ExporterError> {
        let Some(priority) = &self.priority else {
            return self.introspector.queue_stats(queue).await;
        };

        let mut total_length = 0u64;
        let mut total_consumers = 0u64;
        let mut saw_consumers = false;
        for step in &priority.steps {
            let pseudo = priority.pseudo_queue(queue, *step);
            let stats = self.introspector.queue_stats(&pseudo).await?;
            total_length += stats.length;
            if let Some(c) = stats.consumer_count {
                saw_consumers = true;
                total_consumers += c;
            }
        }
        debug!(queue, steps = priority.steps.len(), total_length, "priority-fanned-out queue query");
        Ok(crate::control::QueueStats {
            length: total_length,
            consumer_count: saw_consumers.then_some(total_consumers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::InMemoryBroker;

    fn metrics() -> MetricRegistry {
        MetricRegistry::new(&qwatch_core::ExporterConfig {
            broker_url: "memory://".into(),
            ..qwatch_core::ExporterConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn queue_length_published_for_queue_seeded_without_workers() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_queue("celery", 3, 0);
        let registry = metrics();
        let mut tracker = StateTracker::new();
        tracker.seed_queues(["celery".to_string()]);

        let probe = BrokerProbe::new(broker.clone(), broker.clone(), None);
        probe.run(&mut tracker, &registry).await.unwrap();

        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"celery_queue_length{queue_name="celery"} 3"#));
    }

    #[tokio::test]
    async fn worker_bindings_discover_queues_and_publish_counts() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.bind_worker("host-a", 4, vec!["celery".to_string()]);
        broker.set_queue("celery", 0, 2);
        let registry = metrics();
        let mut tracker = StateTracker::new();

        let probe = BrokerProbe::new(broker.clone(), broker.clone(), None);
        probe.run(&mut tracker, &registry).await.unwrap();

        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"celery_active_worker_count{queue_name="celery"} 1"#));
        assert!(text.contains(r#"celery_active_process_count{queue_name="celery"} 4"#));
        assert!(text.contains(r#"celery_active_consumer_count{queue_name="celery"} 2"#));
    }

    #[tokio::test]
    async fn priority_fan_out_sums_pseudo_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_queue("celery\u{6}\u{16}0", 2, 1);
        broker.set_queue("celery\u{6}\u{16}9", 1, 0);
        let registry = metrics();
        let mut tracker = StateTracker::new();
        tracker.seed_queues(["celery".to_string()]);

        let priority = PriorityConfig {
            steps: vec![0, 9],
            separator: PriorityConfig::DEFAULT_SEPARATOR.to_string(),
        };
        let probe = BrokerProbe::new(broker.clone(), broker.clone(), Some(priority));
        probe.run(&mut tracker, &registry).await.unwrap();

        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"celery_queue_length{queue_name="celery"} 3"#));
    }
}
