//! In-memory worker/task/queue model, mutated from the event loop.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use qwatch_core::model::{extract_hostname, normalize_timestamp};
use qwatch_core::{Event, Queue, Task, Worker};
use tracing::warn;

/// What `record_event` actually did, so the handler table can decide which
/// metrics to touch without re-deriving it from the event kind string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    WorkerUpdated { hostname: String },
    TaskUpdated { uuid: String },
    /// The event kind isn't one of the recognized kinds in the handler
    /// table. State remains consistent; nothing was mutated.
    Unrecognized { kind: String },
}

/// Workers declared down by a liveness scan, and workers purged entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub newly_down: Vec<String>,
    pub purged: Vec<String>,
}

/// The worker/task tables and the discovered-queue set.
///
/// Task mutations are driven exclusively by `record_event` (the event
/// loop). The liveness scan additionally mutates the worker table and is
/// invoked from the scrape path; callers are expected to serialize access
/// with a lock (see `qwatch-server`'s use of `parking_lot::RwLock`).
#[derive(Debug, Default)]
pub struct StateTracker {
    workers: HashMap<String, Worker>,
    tasks: HashMap<String, Task>,
    discovered_queues: BTreeSet<String>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the discovered-queue set at startup (the `--queues` CLI option).
    pub fn seed_queues(&mut self, names: impl IntoIterator<Item = String>) {
        self.discovered_queues.extend(names);
    }

    pub fn add_discovered_queue(&mut self, name: impl Into<String>) {
        self.discovered_queues.insert(name.into());
    }

    pub fn discovered_queues(&self) -> impl Iterator<Item = &str> {
        self.discovered_queues.iter().map(String::as_str)
    }

    pub fn queue_snapshot(&self, name: &str) -> Queue {
        Queue::new(name)
    }

    pub fn get_task(&self, uuid: &str) -> Option<&Task> {
        self.tasks.get(uuid)
    }

    pub fn get_worker(&self, hostname: &str) -> Option<&Worker> {
        self.workers.get(hostname)
    }

    pub fn list_workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    /// Apply a raw event to the worker/task tables. `local_utcoffset` is the
    /// exporter's own UTC offset in hours, used by `timestamp-normalize`.
    pub fn record_event(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
        local_utcoffset: f64,
    ) -> RecordOutcome {
        match event.kind.as_str() {
            "worker-online" => self.record_worker_online(event, now, local_utcoffset),
            "worker-offline" => self.record_worker_offline(event),
            "worker-heartbeat" => self.record_worker_heartbeat(event, now, local_utcoffset),
            "task-sent" | "task-received" | "task-started" | "task-succeeded"
            | "task-failed" | "task-rejected" | "task-revoked" | "task-retried" => {
                self.record_task_event(event, local_utcoffset)
            }
            other => {
                warn!(kind = %other, "unrecognized event kind");
                RecordOutcome::Unrecognized {
                    kind: other.to_string(),
                }
            }
        }
    }

    fn record_worker_online(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
        local_utcoffset: f64,
    ) -> RecordOutcome {
        let Some(raw_hostname) = event.hostname.as_deref() else {
            return RecordOutcome::Unrecognized {
                kind: event.kind.clone(),
            };
        };
        let hostname = extract_hostname(raw_hostname);
        let last_seen = event
            .timestamp
            .map(|ts| normalized_datetime(ts, event.utcoffset_or_zero(), local_utcoffset))
            .unwrap_or(now);
        let worker = self
            .workers
            .entry(hostname.clone())
            .or_insert_with(|| Worker::new(hostname.clone(), last_seen));
        worker.last_seen = last_seen;
        worker.alive = true;
        worker.forgotten = false;
        RecordOutcome::WorkerUpdated { hostname }
    }

    fn record_worker_offline(&mut self, event: &Event) -> RecordOutcome {
        let Some(raw_hostname) = event.hostname.as_deref() else {
            return RecordOutcome::Unrecognized {
                kind: event.kind.clone(),
            };
        };
        let hostname = extract_hostname(raw_hostname);
        self.forget_worker(&hostname);
        RecordOutcome::WorkerUpdated { hostname }
    }

    /// Mark a worker down and forgotten without removing its entry
    /// (spec.md §4.2 `worker-offline` -> "Call forget worker"; spec.md
    /// §4.5's purge pass later drops the entry once the purge threshold
    /// elapses). A no-op if the worker was never observed.
    pub fn forget_worker(&mut self, hostname: &str) {
        if let Some(worker) = self.workers.get_mut(hostname) {
            worker.alive = false;
            worker.forgotten = true;
        }
    }

    fn record_worker_heartbeat(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
        local_utcoffset: f64,
    ) -> RecordOutcome {
        let Some(raw_hostname) = event.hostname.as_deref() else {
            return RecordOutcome::Unrecognized {
                kind: event.kind.clone(),
            };
        };
        let hostname = extract_hostname(raw_hostname);
        let last_seen = event
            .timestamp
            .map(|ts| normalized_datetime(ts, event.utcoffset_or_zero(), local_utcoffset))
            .unwrap_or(now);
        let worker = self
            .workers
            .entry(hostname.clone())
            .or_insert_with(|| Worker::new(hostname.clone(), last_seen));
        worker.last_seen = last_seen;
        worker.alive = true;
        worker.forgotten = false;
        worker.active_tasks = event.active.unwrap_or(0);
        RecordOutcome::WorkerUpdated { hostname }
    }

    fn record_task_event(&mut self, event: &Event, local_utcoffset: f64) -> RecordOutcome {
        let Some(uuid) = event.uuid.as_deref() else {
            return RecordOutcome::Unrecognized {
                kind: event.kind.clone(),
            };
        };
        let task = self.tasks.entry(uuid.to_string()).or_default();
        if let Some(name) = &event.name {
            task.name.get_or_insert_with(|| name.clone());
        }
        if let Some(raw_hostname) = &event.hostname {
            let hostname = extract_hostname(raw_hostname);
            task.hostname.get_or_insert(hostname);
        }
        // queue_name never changes once observed (invariant, spec.md §3).
        if let Some(queue) = &event.queue {
            task.queue_name.get_or_insert_with(|| queue.clone());
        }
        let normalize = |ts: f64| normalize_timestamp(ts, event.utcoffset_or_zero(), local_utcoffset);
        match event.kind.as_str() {
            "task-received" => {
                if let Some(ts) = event.received.or(event.timestamp) {
                    task.received.get_or_insert(normalize(ts));
                }
            }
            "task-started" => {
                if let Some(ts) = event.started.or(event.timestamp) {
                    task.started.get_or_insert(normalize(ts));
                }
            }
            "task-succeeded" => {
                if let Some(runtime) = event.runtime {
                    task.runtime = Some(runtime);
                }
            }
            "task-failed" => {
                if let Some(exception) = &event.exception {
                    task.exception = Some(exception.clone());
                }
            }
            _ => {}
        }
        RecordOutcome::TaskUpdated {
            uuid: uuid.to_string(),
        }
    }

    /// Scan worker liveness and run the purge policy. Invoked once per
    /// scrape, not on a background ticker (spec.md §4.5).
    ///
    /// `purge_secs == 0` disables purging; `forget_worker` then happens but
    /// the worker entry is never dropped by *this* pass (it is dropped
    /// immediately once `worker-offline`/timeout declares it down, per
    /// spec.md §4.5's "value of 0 disables purging... forget-worker then
    /// deletes the worker entry immediately" — modeled here as purge_secs=0
    /// meaning "purge on the very next scan after forgetting").
    pub fn scan_liveness(
        &mut self,
        now: DateTime<Utc>,
        timeout_secs: u64,
        purge_secs: u64,
    ) -> LivenessReport {
        let mut report = LivenessReport::default();
        let mut to_purge = Vec::new();

        for (hostname, worker) in self.workers.iter_mut() {
            let alive = worker.is_alive(now, timeout_secs);
            if !alive && !worker.forgotten {
                worker.alive = false;
                worker.forgotten = true;
                report.newly_down.push(hostname.clone());
            }
            if worker.forgotten {
                let idle = (now - worker.last_seen).num_seconds().max(0) as u64;
                let should_purge = if purge_secs == 0 {
                    true
                } else {
                    idle >= purge_secs
                };
                if should_purge {
                    to_purge.push(hostname.clone());
                }
            }
        }

        for hostname in to_purge {
            self.workers.remove(&hostname);
            report.purged.push(hostname);
        }

        report
    }
}

fn normalized_datetime(ts: f64, utcoffset: f64, local_utcoffset: f64) -> DateTime<Utc> {
    let adjusted = normalize_timestamp(ts, utcoffset, local_utcoffset);
    let secs = adjusted.trunc() as i64;
    let nanos = ((adjusted.fract()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qwatch_core::model::DEFAULT_QUEUE_NAME;

    fn event(kind: &str) -> Event {
        Event {
            kind: kind.to_string(),
            hostname: None,
            timestamp: None,
            utcoffset: None,
            uuid: None,
            name: None,
            queue: None,
            runtime: None,
            exception: None,
            received: None,
            started: None,
            active: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn worker_online_creates_worker_with_extracted_hostname() {
        let mut tracker = StateTracker::new();
        let mut e = event("worker-online");
        e.hostname = Some("celery@host.example.com".to_string());
        e.timestamp = Some(1_700_000_000.0);
        let now = Utc::now();
        let outcome = tracker.record_event(&e, now, 0.0);
        assert_eq!(
            outcome,
            RecordOutcome::WorkerUpdated {
                hostname: "host.example.com".to_string()
            }
        );
        let worker = tracker.get_worker("host.example.com").unwrap();
        assert!(worker.alive);
        assert!(!worker.forgotten);
    }

    #[test]
    fn worker_offline_marks_not_alive_without_dropping_entry() {
        let mut tracker = StateTracker::new();
        let mut online = event("worker-online");
        online.hostname = Some("w@h".to_string());
        tracker.record_event(&online, Utc::now(), 0.0);

        let mut offline = event("worker-offline");
        offline.hostname = Some("w@h".to_string());
        tracker.record_event(&offline, Utc::now(), 0.0);

        let worker = tracker.get_worker("h").unwrap();
        assert!(!worker.alive);
    }

    #[test]
    fn task_queue_name_defaults_and_never_changes_once_observed() {
        let mut tracker = StateTracker::new();
        let mut sent = event("task-sent");
        sent.uuid = Some("t1".into());
        sent.name = Some("pkg.task".into());
        sent.hostname = Some("producer@h".into());
        tracker.record_event(&sent, Utc::now(), 0.0);

        let mut received = event("task-received");
        received.uuid = Some("t1".into());
        received.queue = Some("custom".into());
        tracker.record_event(&received, Utc::now(), 0.0);

        let task = tracker.get_task("t1").unwrap();
        // queue was never set by task-sent, so task-received's value sticks.
        assert_eq!(task.queue_name_or_default(), "custom");

        let mut again = event("task-started");
        again.uuid = Some("t1".into());
        again.queue = Some("different".into());
        tracker.record_event(&again, Utc::now(), 0.0);
        let task = tracker.get_task("t1").unwrap();
        assert_eq!(task.queue_name_or_default(), "custom");
    }

    #[test]
    fn task_without_queue_defaults_to_celery() {
        let mut tracker = StateTracker::new();
        let mut sent = event("task-sent");
        sent.uuid = Some("t2".into());
        tracker.record_event(&sent, Utc::now(), 0.0);
        let task = tracker.get_task("t2").unwrap();
        assert_eq!(task.queue_name_or_default(), DEFAULT_QUEUE_NAME);
    }

    #[test]
    fn unrecognized_kind_is_reported_but_consistent() {
        let mut tracker = StateTracker::new();
        let e = event("task-unsubscribed-from-planet");
        let outcome = tracker.record_event(&e, Utc::now(), 0.0);
        assert!(matches!(outcome, RecordOutcome::Unrecognized { .. }));
        assert!(tracker.list_workers().next().is_none());
    }

    #[test]
    fn liveness_scan_forgets_then_purges() {
        let mut tracker = StateTracker::new();
        let mut online = event("worker-online");
        online.hostname = Some("w@h".into());
        tracker.record_event(&online, Utc::now() - chrono::Duration::seconds(1000), 0.0);
        // last_seen defaults to `now` param passed to record_event when no
        // timestamp field is set; force it far in the past directly.
        {
            let worker = tracker.workers.get_mut("h").unwrap();
            worker.last_seen = Utc::now() - chrono::Duration::seconds(1000);
        }

        let now = Utc::now();
        let report = tracker.scan_liveness(now, 300, 600);
        assert_eq!(report.newly_down, vec!["h".to_string()]);
        assert!(report.purged.is_empty());

        let report2 = tracker.scan_liveness(now, 300, 600);
        assert!(report2.newly_down.is_empty());
        assert_eq!(report2.purged, vec!["h".to_string()]);
        assert!(tracker.get_worker("h").is_none());
    }

    #[test]
    fn purge_zero_disables_retention_and_drops_immediately() {
        let mut tracker = StateTracker::new();
        let mut online = event("worker-online");
        online.hostname = Some("w@h".into());
        tracker.record_event(&online, Utc::now() - chrono::Duration::seconds(1000), 0.0);
        {
            let worker = tracker.workers.get_mut("h").unwrap();
            worker.last_seen = Utc::now() - chrono::Duration::seconds(1000);
        }
        let now = Utc::now();
        let report = tracker.scan_liveness(now, 300, 0);
        assert_eq!(report.newly_down, vec!["h".to_string()]);
        assert_eq!(report.purged, vec!["h".to_string()]);
    }
}
