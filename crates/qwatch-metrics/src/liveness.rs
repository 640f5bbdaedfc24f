//! Liveness & purge manager (spec.md §4.5): runs the state tracker's scan
//! and projects the result onto the metric registry. Invoked once per
//! scrape by the scrape orchestrator (`qwatch-server`), never on a
//! background ticker.

use chrono::{DateTime, Utc};
use qwatch_state::tracker::{LivenessReport, StateTracker};

use crate::registry::MetricRegistry;

/// Scan worker liveness, forget newly-timed-out workers, and purge workers
/// past the purge threshold — mutating both the state tracker and the
/// metric registry so they agree about which hostnames still exist.
pub fn run_liveness_scan(
    tracker: &mut StateTracker,
    metrics: &MetricRegistry,
    now: DateTime<Utc>,
    worker_timeout_secs: u64,
    purge_offline_worker_metrics_secs: u64,
) -> LivenessReport {
    let report = tracker.scan_liveness(now, worker_timeout_secs, purge_offline_worker_metrics_secs);
    for hostname in &report.newly_down {
        metrics.forget_worker(hostname);
    }
    for hostname in &report.purged {
        metrics.purge_worker(hostname);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use qwatch_core::{Event, ExporterConfig};

    fn registry() -> MetricRegistry {
        MetricRegistry::new(&ExporterConfig {
            broker_url: "memory://".into(),
            ..ExporterConfig::default()
        })
        .unwrap()
    }

    fn online_event(hostname: &str) -> Event {
        Event {
            kind: "worker-online".into(),
            hostname: Some(hostname.to_string()),
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
    fn timeout_then_purge_zeroes_then_removes_samples() {
        let mut tracker = StateTracker::new();
        let metrics = registry();
        let past = Utc::now() - chrono::Duration::seconds(1000);
        tracker.record_event(&online_event("w@h"), past, 0.0);
        metrics.set_worker_up("h", true);

        let now = Utc::now();
        let report = run_liveness_scan(&mut tracker, &metrics, now, 300, 600);
        assert_eq!(report.newly_down, vec!["h".to_string()]);
        let text = metrics.gather_text().unwrap();
        assert!(text.contains(r#"celery_worker_up{hostname="h"} 0"#));

        let report2 = run_liveness_scan(&mut tracker, &metrics, now, 300, 600);
        assert_eq!(report2.purged, vec!["h".to_string()]);
        let text = metrics.gather_text().unwrap();
        assert!(!text.contains("hostname=\"h\""));
    }
}
