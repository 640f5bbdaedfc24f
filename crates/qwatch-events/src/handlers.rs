//! The handler table: spec.md §4.2's `event kind -> mutation on state + metric
//! update` map, implemented as a dispatch function rather than a class
//! hierarchy (spec.md §9 "Handler polymorphism" — no inheritance required).

use chrono::{DateTime, Utc};
use qwatch_core::model::DEFAULT_QUEUE_NAME;
use qwatch_core::Event;
use qwatch_metrics::registry::MetricRegistry;
use qwatch_state::tracker::{RecordOutcome, StateTracker};
use tracing::warn;

/// The literal hostname substituted for `task-sent` in generic-hostname
/// mode (spec.md §4.2).
pub const GENERIC_HOSTNAME: &str = "generic";

/// Whether queuing-time gauge updates are applied (spec.md §4.2's
/// "(optional variant)", promoted to a default-on ambient feature by
/// SPEC_FULL.md §9 — escape-hatched via `--no-queue-time-gauge`).
#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    pub generic_hostname_task_sent_metric: bool,
    pub queue_time_gauge_enabled: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            generic_hostname_task_sent_metric: false,
            queue_time_gauge_enabled: true,
        }
    }
}

/// Stateless dispatcher: given an already-parsed event, mutate the state
/// tracker and project the corresponding metric updates.
pub struct HandlerTable;

impl HandlerTable {
    /// Apply one event end to end. Returns the state tracker's resolution
    /// outcome so callers (and tests) can assert on what happened without
    /// re-deriving it from the event kind string.
    pub fn dispatch(
        event: &Event,
        tracker: &mut StateTracker,
        metrics: &MetricRegistry,
        options: HandlerOptions,
        now: DateTime<Utc>,
        local_utcoffset: f64,
    ) -> RecordOutcome {
        let outcome = tracker.record_event(event, now, local_utcoffset);

        let is_task_event = matches!(
            event.kind.as_str(),
            "task-sent"
                | "task-received"
                | "task-started"
                | "task-succeeded"
                | "task-failed"
                | "task-rejected"
                | "task-revoked"
                | "task-retried"
        );

        match event.kind.as_str() {
            "task-sent" => Self::on_task_sent(event, metrics, options),
            "task-received" => Self::on_task_received(event, tracker, metrics),
            "task-started" => Self::on_task_started(event, tracker, metrics, options),
            "task-succeeded" => Self::on_task_succeeded(event, tracker, metrics),
            "task-failed" => Self::on_task_failed(event, tracker, metrics),
            "task-rejected" => Self::on_task_simple(event, tracker, metrics, MetricRegistry::record_rejected),
            "task-revoked" => Self::on_task_simple(event, tracker, metrics, MetricRegistry::record_revoked),
            "task-retried" => Self::on_task_simple(event, tracker, metrics, MetricRegistry::record_retried),
            "worker-online" => Self::on_worker_online(event, metrics),
            "worker-offline" => Self::on_worker_offline(event, tracker, metrics),
            "worker-heartbeat" => Self::on_worker_heartbeat(event, metrics),
            other => warn!(kind = %other, "no metric projection for event kind"),
        }

        // Task traffic discovers its queue even with no worker bound to it
        // yet (DESIGN.md Open Question: queue discovery sources) — the
        // broker-probe's active_queues()/startup seed (spec.md §3) are the
        // other two sources feeding the same set.
        if is_task_event {
            if let Some(uuid) = event.uuid.as_deref() {
                if let Some(queue) = tracker.get_task(uuid).map(|t| t.queue_name_or_default().to_string()) {
                    tracker.add_discovered_queue(queue);
                }
            }
        }

        outcome
    }

    /// `task-sent` never looks the task up in the tracker: its producer may
    /// not be a worker at all, so there is nothing to join against, and the
    /// hostname used for the label is resolved straight from the event
    /// (replaced with `generic` under generic-hostname mode) rather than
    /// from the tracked task entity.
    fn on_task_sent(event: &Event, metrics: &MetricRegistry, options: HandlerOptions) {
        let name = event.name.as_deref().unwrap_or("unknown");
        let queue = event.queue.as_deref().unwrap_or(DEFAULT_QUEUE_NAME);
        let hostname = if options.generic_hostname_task_sent_metric {
            GENERIC_HOSTNAME.to_string()
        } else {
            event
                .hostname
                .as_deref()
                .map(qwatch_core::model::extract_hostname)
                .unwrap_or_else(|| "unknown".to_string())
        };
        metrics.record_sent(name, &hostname, queue);
    }

    fn on_task_received(event: &Event, tracker: &StateTracker, metrics: &MetricRegistry) {
        let Some((name, hostname, queue)) = resolved_task_labels(event, tracker) else {
            return;
        };
        metrics.record_received(&name, &hostname, &queue);
    }

    fn on_task_started(
        event: &Event,
        tracker: &StateTracker,
        metrics: &MetricRegistry,
        options: HandlerOptions,
    ) {
        let Some((name, hostname, queue)) = resolved_task_labels(event, tracker) else {
            return;
        };
        metrics.record_started(&name, &hostname, &queue);

        if !options.queue_time_gauge_enabled {
            return;
        }
        // Tasks with eta/countdown, or retries, bypass the queue and never
        // produce a `task-received` event for this uuid; the presence of a
        // recorded `received` timestamp is exactly the distinguishing
        // signal spec.md §4.2 calls for.
        let Some(uuid) = event.uuid.as_deref() else { return };
        let Some(task) = tracker.get_task(uuid) else { return };
        if let (Some(received), Some(started)) = (task.received, task.started) {
            let seconds = started - received;
            if seconds >= 0.0 {
                metrics.observe_queue_time(&name, &hostname, &queue, seconds);
            }
        }
    }

    fn on_task_succeeded(event: &Event, tracker: &StateTracker, metrics: &MetricRegistry) {
        let Some((name, hostname, queue)) = resolved_task_labels(event, tracker) else {
            return;
        };
        metrics.record_succeeded(&name, &hostname, &queue);
        if let Some(runtime) = event.runtime {
            metrics.observe_runtime(&name, &hostname, &queue, runtime);
        }
    }

    fn on_task_failed(event: &Event, tracker: &StateTracker, metrics: &MetricRegistry) {
        let Some((name, hostname, queue)) = resolved_task_labels(event, tracker) else {
            return;
        };
        let exception_repr = event.exception.as_deref().unwrap_or("");
        metrics.record_failed(&name, &hostname, &queue, exception_repr);
    }

    fn on_task_simple(
        event: &Event,
        tracker: &StateTracker,
        metrics: &MetricRegistry,
        write: fn(&MetricRegistry, &str, &str, &str),
    ) {
        let Some((name, hostname, queue)) = resolved_task_labels(event, tracker) else {
            return;
        };
        write(metrics, &name, &hostname, &queue);
    }

    fn on_worker_online(event: &Event, metrics: &MetricRegistry) {
        let Some(raw) = event.hostname.as_deref() else { return };
        let hostname = qwatch_core::model::extract_hostname(raw);
        metrics.set_worker_up(&hostname, true);
        if let Some(ts) = event.timestamp {
            metrics.set_worker_last_heartbeat(&hostname, ts);
        }
    }

    fn on_worker_offline(event: &Event, tracker: &mut StateTracker, metrics: &MetricRegistry) {
        let Some(raw) = event.hostname.as_deref() else { return };
        let hostname = qwatch_core::model::extract_hostname(raw);
        tracker.forget_worker(&hostname);
        metrics.forget_worker(&hostname);
    }

    fn on_worker_heartbeat(event: &Event, metrics: &MetricRegistry) {
        let Some(raw) = event.hostname.as_deref() else { return };
        let hostname = qwatch_core::model::extract_hostname(raw);
        metrics.set_worker_up(&hostname, true);
        metrics.set_worker_tasks_active(&hostname, event.active.unwrap_or(0));
        if let Some(ts) = event.timestamp {
            metrics.set_worker_last_heartbeat(&hostname, ts);
        }
    }
}

/// Resolve `(name, hostname, queue_name)` for a task-event's label set by
/// reading the tracker's merged task record (spec.md §4.2 "Label
/// extraction rule"). Returns `None` only when the event carries no uuid
/// at all — an event the state tracker itself couldn't associate with any
/// task, which the receiver already logged as unrecognized.
fn resolved_task_labels(event: &Event, tracker: &StateTracker) -> Option<(String, String, String)> {
    let uuid = event.uuid.as_deref()?;
    let task = tracker.get_task(uuid)?;
    let name = task.name.clone().unwrap_or_else(|| "unknown".to_string());
    let hostname = task.hostname.clone().unwrap_or_else(|| {
        event
            .hostname
            .as_deref()
            .map(qwatch_core::model::extract_hostname)
            .unwrap_or_else(|| "unknown".to_string())
    });
    let queue = task.queue_name_or_default().to_string();
    Some((name, hostname, queue))
}
