//! The worker/task/queue data model shared by every other crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default queue name used when a task event reports none.
pub const DEFAULT_QUEUE_NAME: &str = "celery";

/// Extract the hostname portion of a broker worker identifier.
///
/// Worker identifiers look like `worker1@host.example.com`; only the part
/// after `@` is kept as a metric label, bounding cardinality to the host
/// rather than the worker-name prefix.
pub fn extract_hostname(worker_id: &str) -> String {
    match worker_id.split_once('@') {
        Some((_, host)) => host.to_string(),
        None => worker_id.to_string(),
    }
}

/// Extract the leading identifier of an exception repr, e.g. `HTTPError("boom")`
/// becomes `HTTPError`. Falls back to `UnknownException` for anything that
/// doesn't look like `Identifier(...)`.
pub fn extract_exception_class(repr: &str) -> String {
    match repr.split_once('(') {
        Some((class, _)) if !class.is_empty() && is_identifier(class) => class.to_string(),
        _ => "UnknownException".to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// Adjust a broker-reported epoch timestamp to the exporter's wall-clock,
/// correcting for the difference between the worker's reported UTC offset
/// (hours) and the exporter's own UTC offset (hours).
///
/// `ts + (utcoffset - local_utcoffset) * 3600`. The inverse is
/// `normalize_timestamp(ts, local_utcoffset, utcoffset)`.
pub fn normalize_timestamp(ts: f64, utcoffset: f64, local_utcoffset: f64) -> f64 {
    ts + (utcoffset - local_utcoffset) * 3600.0
}

/// A worker known to the exporter, keyed by hostname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub hostname: String,
    pub last_seen: DateTime<Utc>,
    pub alive: bool,
    pub active_tasks: u64,
    /// Set once `forget_worker` has run but the purge threshold hasn't elapsed.
    pub forgotten: bool,
}

impl Worker {
    pub fn new(hostname: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            last_seen,
            alive: true,
            active_tasks: 0,
            forgotten: false,
        }
    }

    /// True iff `now - last_seen <= timeout` and the worker hasn't been
    /// explicitly marked offline.
    pub fn is_alive(&self, now: DateTime<Utc>, timeout_secs: u64) -> bool {
        if !self.alive {
            return false;
        }
        if timeout_secs == 0 {
            return true;
        }
        let elapsed = (now - self.last_seen).num_seconds();
        elapsed >= 0 && (elapsed as u64) <= timeout_secs
    }
}

/// A task known to the exporter, keyed by UUID.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Task {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub queue_name: Option<String>,
    pub received: Option<f64>,
    pub started: Option<f64>,
    pub runtime: Option<f64>,
    pub exception: Option<String>,
}

impl Task {
    /// Queue name with the `celery` default applied.
    pub fn queue_name_or_default(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE_NAME)
    }
}

/// Per-scrape derived metrics for a queue, plus its discovery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Queue {
    pub name: String,
    pub length: u64,
    pub consumer_count: u64,
    pub active_worker_count: u64,
    pub active_process_count: u64,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A raw event delivered by the broker event stream.
///
/// Only fields named in the wire contract are typed; anything else survives
/// in `extra` so handlers that need provider-specific fields can still reach
/// them without the model growing a field for every broker quirk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub hostname: Option<String>,
    pub timestamp: Option<f64>,
    pub utcoffset: Option<f64>,
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub queue: Option<String>,
    pub runtime: Option<f64>,
    pub exception: Option<String>,
    pub received: Option<f64>,
    pub started: Option<f64>,
    /// Count of currently active tasks, reported on `worker-heartbeat`.
    pub active: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Event {
    /// UTC offset reported by the worker, defaulting to 0 when absent.
    pub fn utcoffset_or_zero(&self) -> f64 {
        self.utcoffset.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_extraction_splits_on_at() {
        assert_eq!(extract_hostname("worker1@host.example.com"), "host.example.com");
        assert_eq!(extract_hostname("celery@10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn hostname_extraction_without_at_passes_through() {
        assert_eq!(extract_hostname("bare-hostname"), "bare-hostname");
    }

    #[test]
    fn exception_class_extraction() {
        assert_eq!(extract_exception_class("HTTPError(\"boom\")"), "HTTPError");
        assert_eq!(extract_exception_class("module.DeepError('x')"), "module.DeepError");
    }

    #[test]
    fn exception_class_falls_back_on_malformed_repr() {
        assert_eq!(extract_exception_class("not an exception"), "UnknownException");
        assert_eq!(extract_exception_class(""), "UnknownException");
        assert_eq!(extract_exception_class("(no-leading-ident)"), "UnknownException");
    }

    #[test]
    fn timestamp_normalize_round_trips_for_integer_offsets() {
        let ts = 1_700_000_000.0;
        let worker_offset = 5.0;
        let local_offset = -3.0;
        let adjusted = normalize_timestamp(ts, worker_offset, local_offset);
        let back = normalize_timestamp(adjusted, local_offset, worker_offset);
        assert!((back - ts).abs() < f64::EPSILON);
    }

    #[test]
    fn worker_alive_respects_timeout() {
        let now = Utc::now();
        let w = Worker::new("h", now - chrono::Duration::seconds(100));
        assert!(w.is_alive(now, 300));
        assert!(!w.is_alive(now, 50));
    }

    #[test]
    fn worker_timeout_zero_disables_timeout() {
        let now = Utc::now();
        let w = Worker::new("h", now - chrono::Duration::days(10));
        assert!(w.is_alive(now, 0));
    }
}
