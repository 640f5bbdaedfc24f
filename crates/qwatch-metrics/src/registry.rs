//! Prometheus-compatible metric families, label-schema construction, the
//! zero-fill policy, and purge bookkeeping.

use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use qwatch_core::model::extract_exception_class;
use qwatch_core::{ExporterConfig, ExporterError, StaticLabels};
use tracing::debug;

/// Families that carry a `hostname` label and therefore participate in
/// purge bookkeeping. `TaskSent` is intentionally excluded from zero-fill
/// (spec.md §4.2) but still participates in purge, since a forgotten
/// worker's `task_sent` samples (real-hostname ones; generic-mode samples
/// never carry a real hostname) should disappear too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Family {
    TaskSent,
    TaskReceived,
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskRejected,
    TaskRevoked,
    TaskRetried,
    TaskRuntime,
    TaskQueueTime,
    WorkerUp,
    WorkerTasksActive,
    WorkerLastHeartbeat,
}

/// The seven task-state counters (excluding `task-sent`, per spec.md §4.2's
/// zero-fill exemption) that must zero-fill each other's siblings.
fn all_zero_fillable() -> [Family; 7] {
    [
        Family::TaskReceived,
        Family::TaskStarted,
        Family::TaskSucceeded,
        Family::TaskFailed,
        Family::TaskRejected,
        Family::TaskRevoked,
        Family::TaskRetried,
    ]
}

/// Index of every label tuple ever written for a given hostname, so purge
/// can call `remove_label_values` precisely — Prometheus vectors have no
/// "remove everything matching this one label" primitive.
#[derive(Default)]
struct LabelIndex {
    by_hostname: HashMap<String, Vec<(Family, Vec<String>)>>,
}

impl LabelIndex {
    fn record(&mut self, hostname: &str, family: Family, values: Vec<String>) {
        let entries = self.by_hostname.entry(hostname.to_string()).or_default();
        if !entries.iter().any(|(f, v)| *f == family && *v == values) {
            entries.push((family, values));
        }
    }

    fn take(&mut self, hostname: &str) -> Vec<(Family, Vec<String>)> {
        self.by_hostname.remove(hostname).unwrap_or_default()
    }
}

/// Owns every Prometheus family the exporter exposes, built once at
/// startup with the fixed label schema of spec.md §4.4 plus the
/// sorted-by-key static-label suffix (spec.md §6 metric name stability).
pub struct MetricRegistry {
    registry: Registry,
    static_keys: Vec<String>,
    static_values: Vec<String>,
    task_sent: IntCounterVec,
    task_received: IntCounterVec,
    task_started: IntCounterVec,
    task_succeeded: IntCounterVec,
    task_failed: IntCounterVec,
    task_rejected: IntCounterVec,
    task_revoked: IntCounterVec,
    task_retried: IntCounterVec,
    task_runtime: HistogramVec,
    task_queuing_time: GaugeVec,
    worker_up: GaugeVec,
    worker_tasks_active: GaugeVec,
    worker_last_heartbeat: GaugeVec,
    queue_length: GaugeVec,
    active_consumer_count: GaugeVec,
    active_worker_count: GaugeVec,
    active_process_count: GaugeVec,
    index: Mutex<LabelIndex>,
}

fn task_labels_vec(static_keys: &[String]) -> Vec<&str> {
    let mut v = vec!["name", "hostname", "queue_name"];
    v.extend(static_keys.iter().map(String::as_str));
    v
}

fn task_failed_labels_vec(static_keys: &[String]) -> Vec<&str> {
    let mut v = vec!["name", "hostname", "exception", "queue_name"];
    v.extend(static_keys.iter().map(String::as_str));
    v
}

fn worker_labels_vec(static_keys: &[String]) -> Vec<&str> {
    let mut v = vec!["hostname"];
    v.extend(static_keys.iter().map(String::as_str));
    v
}

fn queue_labels_vec(static_keys: &[String]) -> Vec<&str> {
    let mut v = vec!["queue_name"];
    v.extend(static_keys.iter().map(String::as_str));
    v
}

impl MetricRegistry {
    pub fn new(config: &ExporterConfig) -> Result<Self, ExporterError> {
        let registry = Registry::new();
        let prefix = &config.metric_prefix;
        let static_keys: Vec<String> = config.static_labels.keys().map(str::to_string).collect();
        let static_values: Vec<String> = config
            .static_labels
            .values_in_key_order()
            .into_iter()
            .map(str::to_string)
            .collect();

        let task_labels = task_labels_vec(&static_keys);
        let failed_labels = task_failed_labels_vec(&static_keys);
        let worker_labels = worker_labels_vec(&static_keys);
        let queue_labels = queue_labels_vec(&static_keys);

        macro_rules! counter {
            ($name:expr, $help:expr, $labels:expr) => {{
                let c = IntCounterVec::new(Opts::new(format!("{prefix}{}", $name), $help), $labels)
                    .map_err(registry_err)?;
                registry.register(Box::new(c.clone())).map_err(registry_err)?;
                c
            }};
        }
        macro_rules! gauge {
            ($name:expr, $help:expr, $labels:expr) => {{
                let g = GaugeVec::new(Opts::new(format!("{prefix}{}", $name), $help), $labels)
                    .map_err(registry_err)?;
                registry.register(Box::new(g.clone())).map_err(registry_err)?;
                g
            }};
        }

        let task_sent = counter!(
            "task_sent_total",
            "Sent when a task message is published.",
            &task_labels
        );
        let task_received = counter!(
            "task_received_total",
            "Sent when the worker receives a task.",
            &task_labels
        );
        let task_started = counter!(
            "task_started_total",
            "Sent just before the worker executes the task.",
            &task_labels
        );
        let task_succeeded = counter!(
            "task_succeeded_total",
            "Sent if the task executed successfully.",
            &task_labels
        );
        let task_failed = counter!(
            "task_failed_total",
            "Sent if the execution of the task failed.",
            &failed_labels
        );
        let task_rejected = counter!(
            "task_rejected_total",
            "The task was rejected by the worker, possibly to be re-queued or moved to a dead letter queue.",
            &task_labels
        );
        let task_revoked = counter!(
            "task_revoked_total",
            "Sent if the task has been revoked.",
            &task_labels
        );
        let task_retried = counter!(
            "task_retried_total",
            "Sent if the task failed, but will be retried in the future.",
            &task_labels
        );

        let task_runtime = {
            let h = HistogramVec::new(
                HistogramOpts::new(
                    format!("{prefix}task_runtime_seconds"),
                    "Histogram of task runtime measurements in seconds.",
                )
                .buckets(config.buckets.clone()),
                &task_labels,
            )
            .map_err(registry_err)?;
            registry.register(Box::new(h.clone())).map_err(registry_err)?;
            h
        };

        let task_queuing_time = gauge!(
            "task_queuing_time_seconds",
            "How long in seconds the task spent waiting in the queue before it started executing.",
            &task_labels
        );
        let worker_up = gauge!(
            "worker_up",
            "Indicates if a worker has recently sent a heartbeat.",
            &worker_labels
        );
        let worker_tasks_active = gauge!(
            "worker_tasks_active",
            "The number of tasks the worker is currently processing.",
            &worker_labels
        );
        let worker_last_heartbeat = gauge!(
            "worker_last_heartbeat_timestamp",
            "Unix timestamp of the last heartbeat received from the worker.",
            &worker_labels
        );
        let queue_length = gauge!(
            "queue_length",
            "Number of messages in the queue.",
            &queue_labels
        );
        let active_consumer_count = gauge!(
            "active_consumer_count",
            "Number of active consumers reading from the queue.",
            &queue_labels
        );
        let active_worker_count = gauge!(
            "active_worker_count",
            "Number of active workers bound to the queue.",
            &queue_labels
        );
        let active_process_count = gauge!(
            "active_process_count",
            "Number of active worker processes bound to the queue.",
            &queue_labels
        );

        Ok(Self {
            registry,
            static_keys,
            static_values,
            task_sent,
            task_received,
            task_started,
            task_succeeded,
            task_failed,
            task_rejected,
            task_revoked,
            task_retried,
            task_runtime,
            task_queuing_time,
            worker_up,
            worker_tasks_active,
            worker_last_heartbeat,
            queue_length,
            active_consumer_count,
            active_worker_count,
            active_process_count,
            index: Mutex::new(LabelIndex::default()),
        })
    }

    fn task_values(&self, name: &str, hostname: &str, queue: &str) -> Vec<String> {
        let mut v = vec![name.to_string(), hostname.to_string(), queue.to_string()];
        v.extend(self.static_values.iter().cloned());
        v
    }

    fn task_failed_values(&self, name: &str, hostname: &str, exception: &str, queue: &str) -> Vec<String> {
        let mut v = vec![
            name.to_string(),
            hostname.to_string(),
            exception.to_string(),
            queue.to_string(),
        ];
        v.extend(self.static_values.iter().cloned());
        v
    }

    fn worker_values(&self, hostname: &str) -> Vec<String> {
        let mut v = vec![hostname.to_string()];
        v.extend(self.static_values.iter().cloned());
        v
    }

    fn queue_values(&self, queue: &str) -> Vec<String> {
        let mut v = vec![queue.to_string()];
        v.extend(self.static_values.iter().cloned());
        v
    }

    fn remember(&self, hostname: &str, family: Family, values: &[String]) {
        self.index.lock().record(hostname, family, values.to_vec());
    }

    fn str_refs(values: &[String]) -> Vec<&str> {
        values.iter().map(String::as_str).collect()
    }

    /// `task-sent`: incremented, never zero-filled in either direction
    /// (spec.md §4.2 — its producer is not a worker, so its hostname label
    /// would otherwise create unbounded cardinality).
    pub fn record_sent(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_sent
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskSent, &values);
    }

    pub fn record_received(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_received
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskReceived, &values);
        self.zero_fill_siblings(Family::TaskReceived, name, hostname, queue);
    }

    pub fn record_started(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_started
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskStarted, &values);
        self.zero_fill_siblings(Family::TaskStarted, name, hostname, queue);
    }

    pub fn record_succeeded(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_succeeded
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskSucceeded, &values);
        self.zero_fill_siblings(Family::TaskSucceeded, name, hostname, queue);
    }

    pub fn observe_runtime(&self, name: &str, hostname: &str, queue: &str, runtime_secs: f64) {
        let values = self.task_values(name, hostname, queue);
        self.task_runtime
            .with_label_values(&Self::str_refs(&values))
            .observe(runtime_secs);
        self.remember(hostname, Family::TaskRuntime, &values);
    }

    /// `task-failed`: `exception` resolved by the caller via
    /// [`extract_exception_class`] beforehand, or pass the raw repr and let
    /// this method extract it.
    pub fn record_failed(&self, name: &str, hostname: &str, queue: &str, exception_repr: &str) {
        let exception = extract_exception_class(exception_repr);
        let values = self.task_failed_values(name, hostname, &exception, queue);
        self.task_failed
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskFailed, &values);
        self.zero_fill_siblings(Family::TaskFailed, name, hostname, queue);
    }

    pub fn record_rejected(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_rejected
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskRejected, &values);
        self.zero_fill_siblings(Family::TaskRejected, name, hostname, queue);
    }

    pub fn record_revoked(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_revoked
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskRevoked, &values);
        self.zero_fill_siblings(Family::TaskRevoked, name, hostname, queue);
    }

    pub fn record_retried(&self, name: &str, hostname: &str, queue: &str) {
        let values = self.task_values(name, hostname, queue);
        self.task_retried
            .with_label_values(&Self::str_refs(&values))
            .inc();
        self.remember(hostname, Family::TaskRetried, &values);
        self.zero_fill_siblings(Family::TaskRetried, name, hostname, queue);
    }

    /// Queuing-time gauge (spec.md §4.2's "optional variant"): `started -
    /// received`, skipped entirely by the caller for eta/countdown/retry
    /// tasks that bypassed the queue.
    pub fn observe_queue_time(&self, name: &str, hostname: &str, queue: &str, seconds: f64) {
        let values = self.task_values(name, hostname, queue);
        self.task_queuing_time
            .with_label_values(&Self::str_refs(&values))
            .set(seconds);
        self.remember(hostname, Family::TaskQueueTime, &values);
    }

    /// Touch every non-sent task-state family except `except`, creating a
    /// zero-valued sample if one doesn't already exist. `with_label_values`
    /// lazily creates the child metric at 0 on first access, so "touching"
    /// without incrementing is exactly the zero-fill semantics spec.md
    /// §4.2 asks for.
    fn zero_fill_siblings(&self, except: Family, name: &str, hostname: &str, queue: &str) {
        for family in all_zero_fillable() {
            if family == except {
                continue;
            }
            match family {
                Family::TaskReceived => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_received.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskStarted => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_started.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskSucceeded => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_succeeded.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskFailed => {
                    // Zero-fill write: exception label set to empty string
                    // (spec.md §4.2).
                    let v = self.task_failed_values(name, hostname, "", queue);
                    self.task_failed.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskRejected => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_rejected.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskRevoked => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_revoked.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                Family::TaskRetried => {
                    let v = self.task_values(name, hostname, queue);
                    self.task_retried.with_label_values(&Self::str_refs(&v));
                    self.remember(hostname, family, &v);
                }
                _ => {}
            }
        }
    }

    /// `worker-online` / `worker-heartbeat`.
    pub fn set_worker_up(&self, hostname: &str, up: bool) {
        let values = self.worker_values(hostname);
        self.worker_up
            .with_label_values(&Self::str_refs(&values))
            .set(if up { 1.0 } else { 0.0 });
        self.remember(hostname, Family::WorkerUp, &values);
    }

    pub fn set_worker_tasks_active(&self, hostname: &str, active: u64) {
        let values = self.worker_values(hostname);
        self.worker_tasks_active
            .with_label_values(&Self::str_refs(&values))
            .set(active as f64);
        self.remember(hostname, Family::WorkerTasksActive, &values);
    }

    pub fn set_worker_last_heartbeat(&self, hostname: &str, unix_ts: f64) {
        let values = self.worker_values(hostname);
        self.worker_last_heartbeat
            .with_label_values(&Self::str_refs(&values))
            .set(unix_ts);
        self.remember(hostname, Family::WorkerLastHeartbeat, &values);
    }

    /// Set `worker_up=0` and `worker_tasks_active=0`, but retain the
    /// label-set's existence (spec.md §4.5 "forget worker").
    pub fn forget_worker(&self, hostname: &str) {
        self.set_worker_up(hostname, false);
        self.set_worker_tasks_active(hostname, 0);
    }

    /// Remove every sample referencing `hostname` from every family
    /// (spec.md §4.5 "purge metrics for hostname").
    pub fn purge_worker(&self, hostname: &str) {
        let entries = self.index.lock().take(hostname);
        for (family, values) in entries {
            let refs = Self::str_refs(&values);
            let result = match family {
                Family::TaskSent => self.task_sent.remove_label_values(&refs),
                Family::TaskReceived => self.task_received.remove_label_values(&refs),
                Family::TaskStarted => self.task_started.remove_label_values(&refs),
                Family::TaskSucceeded => self.task_succeeded.remove_label_values(&refs),
                Family::TaskFailed => self.task_failed.remove_label_values(&refs),
                Family::TaskRejected => self.task_rejected.remove_label_values(&refs),
                Family::TaskRevoked => self.task_revoked.remove_label_values(&refs),
                Family::TaskRetried => self.task_retried.remove_label_values(&refs),
                Family::TaskRuntime => self.task_runtime.remove_label_values(&refs),
                Family::TaskQueueTime => self.task_queuing_time.remove_label_values(&refs),
                Family::WorkerUp => self.worker_up.remove_label_values(&refs),
                Family::WorkerTasksActive => self.worker_tasks_active.remove_label_values(&refs),
                Family::WorkerLastHeartbeat => self.worker_last_heartbeat.remove_label_values(&refs),
            };
            if let Err(err) = result {
                debug!(%hostname, ?family, error = %err, "label-set already absent during purge");
            }
        }
    }

    /// Publish the per-queue gauges derived by the broker probe (spec.md
    /// §4.6 step 4).
    pub fn set_queue_length(&self, queue: &str, length: u64) {
        let values = self.queue_values(queue);
        self.queue_length
            .with_label_values(&Self::str_refs(&values))
            .set(length as f64);
    }

    pub fn set_active_consumer_count(&self, queue: &str, count: u64) {
        let values = self.queue_values(queue);
        self.active_consumer_count
            .with_label_values(&Self::str_refs(&values))
            .set(count as f64);
    }

    pub fn set_active_worker_count(&self, queue: &str, count: u64) {
        let values = self.queue_values(queue);
        self.active_worker_count
            .with_label_values(&Self::str_refs(&values))
            .set(count as f64);
    }

    pub fn set_active_process_count(&self, queue: &str, count: u64) {
        let values = self.queue_values(queue);
        self.active_process_count
            .with_label_values(&Self::str_refs(&values))
            .set(count as f64);
    }

    /// Encode the registry in Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, ExporterError> {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| ExporterError::Other(format!("metric encoding failed: {e}")))?;
        String::from_utf8(buf).map_err(|e| ExporterError::Other(format!("non-utf8 metrics output: {e}")))
    }
}

fn registry_err(e: prometheus::Error) -> ExporterError {
    ExporterError::Other(format!("metric registry setup failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ExporterConfig {
        ExporterConfig {
            broker_url: "memory://".into(),
            ..ExporterConfig::default()
        }
    }

    #[test]
    fn zero_fill_creates_sibling_samples_at_zero() {
        let registry = MetricRegistry::new(&config()).unwrap();
        registry.record_received("pkg.task", "h", "celery");
        let text = registry.gather_text().unwrap();
        assert!(text.contains("celery_task_received_total"));
        assert!(text.contains("celery_task_started_total"));
        assert!(text.contains("celery_task_succeeded_total"));
        assert!(text.contains(r#"celery_task_failed_total{exception="",hostname="h",name="pkg.task",queue_name="celery"} 0"#));
    }

    #[test]
    fn task_sent_does_not_zero_fill_or_get_zero_filled() {
        let registry = MetricRegistry::new(&config()).unwrap();
        registry.record_sent("pkg.task", "h", "celery");
        let text = registry.gather_text().unwrap();
        assert!(text.contains("celery_task_sent_total"));
        assert!(!text.contains("celery_task_received_total"));

        registry.record_received("pkg.task", "h", "celery");
        let text = registry.gather_text().unwrap();
        // task-received's zero-fill pass must not touch task_sent.
        let sent_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("celery_task_sent_total{")).collect();
        assert_eq!(sent_lines.len(), 1);
    }

    #[test]
    fn purge_removes_every_sample_for_hostname() {
        let registry = MetricRegistry::new(&config()).unwrap();
        registry.record_sent("pkg.task", "h", "celery");
        registry.record_received("pkg.task", "h", "celery");
        registry.set_worker_up("h", true);
        registry.purge_worker("h");
        let text = registry.gather_text().unwrap();
        assert!(!text.contains("hostname=\"h\""));
    }

    #[test]
    fn forget_worker_zeros_gauges_without_removing_them() {
        let registry = MetricRegistry::new(&config()).unwrap();
        registry.set_worker_up("h", true);
        registry.set_worker_tasks_active("h", 4);
        registry.forget_worker("h");
        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"celery_worker_up{hostname="h"} 0"#));
        assert!(text.contains(r#"celery_worker_tasks_active{hostname="h"} 0"#));
    }

    #[test]
    fn static_labels_appended_sorted_by_key() {
        let mut cfg = config();
        cfg.static_labels = StaticLabels::new([
            ("zone".to_string(), "us".to_string()),
            ("env".to_string(), "prod".to_string()),
        ]);
        let registry = MetricRegistry::new(&cfg).unwrap();
        registry.set_worker_up("h", true);
        let text = registry.gather_text().unwrap();
        // keys sorted: env, zone
        assert!(text.contains(r#"celery_worker_up{env="prod",hostname="h",zone="us"} 1"#));
    }

    #[test]
    fn queue_length_published_for_unknown_queue_as_zero() {
        let registry = MetricRegistry::new(&config()).unwrap();
        registry.set_queue_length("q_seed", 0);
        let text = registry.gather_text().unwrap();
        assert!(text.contains(r#"celery_queue_length{queue_name="q_seed"} 0"#));
    }
}
