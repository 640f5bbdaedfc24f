//! End-to-end scenarios (spec.md §8 scenarios A-G), driven through the same
//! seams production code uses: the handler table dispatches events onto a
//! shared state tracker + metric registry, and `run_scrape` triggers the
//! liveness scan and an in-memory broker probe exactly as `/metrics` would.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use qwatch_broker::control::InMemoryBroker;
use qwatch_broker::probe::BrokerProbe;
use qwatch_core::{Event, ExporterConfig};
use qwatch_events::handlers::{HandlerOptions, HandlerTable};
use qwatch_metrics::registry::MetricRegistry;
use qwatch_server::state::AppState;
use qwatch_server::scrape::run_scrape;
use qwatch_state::tracker::StateTracker;

fn blank_event(kind: &str) -> Event {
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

struct Harness {
    tracker: Arc<Mutex<StateTracker>>,
    metrics: Arc<MetricRegistry>,
    broker: Arc<InMemoryBroker>,
    state: AppState,
    options: HandlerOptions,
}

impl Harness {
    fn new(config: ExporterConfig) -> Self {
        let tracker = Arc::new(Mutex::new(StateTracker::new()));
        for queue in &config.queues {
            tracker.lock().seed_queues([queue.clone()]);
        }
        let options = HandlerOptions {
            generic_hostname_task_sent_metric: config.generic_hostname_task_sent_metric,
            ..HandlerOptions::default()
        };
        let metrics = Arc::new(MetricRegistry::new(&config).unwrap());
        let broker = Arc::new(InMemoryBroker::new());
        let probe = Arc::new(BrokerProbe::new(broker.clone(), broker.clone(), None));
        let state = AppState::new(tracker.clone(), metrics.clone(), probe, Arc::new(config));
        Self {
            tracker,
            metrics,
            broker,
            state,
            options,
        }
    }

    fn dispatch(&self, event: &Event) {
        let mut tracker = self.tracker.lock();
        HandlerTable::dispatch(event, &mut tracker, &self.metrics, self.options, Utc::now(), 0.0);
    }

    async fn scrape(&self) -> String {
        run_scrape(&self.state).await.unwrap()
    }
}

fn config() -> ExporterConfig {
    ExporterConfig {
        broker_url: "memory://".into(),
        ..ExporterConfig::default()
    }
}

#[tokio::test]
async fn scenario_a_single_success() {
    let h = Harness::new(config());

    let mut online = blank_event("worker-online");
    online.hostname = Some("w@h".into());
    h.dispatch(&online);

    for kind in ["task-sent", "task-received", "task-started"] {
        let mut e = blank_event(kind);
        e.uuid = Some("t1".into());
        e.name = Some("pkg.succeed".into());
        e.hostname = Some("w@h".into());
        e.queue = Some("celery".into());
        h.dispatch(&e);
    }
    let mut succeeded = blank_event("task-succeeded");
    succeeded.uuid = Some("t1".into());
    succeeded.hostname = Some("w@h".into());
    succeeded.runtime = Some(0.42);
    h.dispatch(&succeeded);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_task_sent_total{hostname="h",name="pkg.succeed",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_task_received_total{hostname="h",name="pkg.succeed",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_task_started_total{hostname="h",name="pkg.succeed",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_task_succeeded_total{hostname="h",name="pkg.succeed",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_task_runtime_seconds_count{hostname="h",name="pkg.succeed",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_worker_up{hostname="h"} 1"#));
}

#[tokio::test]
async fn scenario_b_failure_label() {
    let h = Harness::new(config());
    let mut online = blank_event("worker-online");
    online.hostname = Some("w@h".into());
    h.dispatch(&online);

    let mut failed = blank_event("task-failed");
    failed.uuid = Some("t2".into());
    failed.name = Some("pkg.fail".into());
    failed.hostname = Some("w@h".into());
    failed.queue = Some("celery".into());
    failed.exception = Some("HTTPError(\"boom\")".into());
    h.dispatch(&failed);

    let text = h.scrape().await;
    assert!(text.contains(
        r#"celery_task_failed_total{exception="HTTPError",hostname="h",name="pkg.fail",queue_name="celery"} 1"#
    ));
}

#[tokio::test]
async fn scenario_c_queue_length_without_workers_then_drained() {
    let h = Harness::new(config());

    for i in 0..3 {
        let mut sent = blank_event("task-sent");
        sent.uuid = Some(format!("t{i}"));
        sent.name = Some("pkg.task".into());
        sent.hostname = Some("producer@p".into());
        sent.queue = Some("celery".into());
        h.dispatch(&sent);
    }
    h.broker.set_queue("celery", 3, 0);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_queue_length{queue_name="celery"} 3"#));

    h.broker.set_queue("celery", 0, 0);
    let text = h.scrape().await;
    assert!(text.contains(r#"celery_queue_length{queue_name="celery"} 0"#));
}

#[tokio::test]
async fn scenario_d_worker_timeout() {
    let mut cfg = config();
    cfg.worker_timeout_secs = 5;
    cfg.purge_offline_worker_metrics_secs = 3600;
    let h = Harness::new(cfg);

    let mut online = blank_event("worker-online");
    online.hostname = Some("w@h".into());
    online.timestamp = Some(Utc::now().timestamp() as f64);
    h.dispatch(&online);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_worker_up{hostname="h"} 1"#));

    // Simulate the clock advancing past worker_timeout_secs: a heartbeat
    // reporting a last_seen already beyond the timeout window backdates
    // the tracked value the same way a real gap in heartbeats would.
    let mut heartbeat = blank_event("worker-heartbeat");
    heartbeat.hostname = Some("w@h".into());
    heartbeat.timestamp = Some((Utc::now() - chrono::Duration::seconds(10)).timestamp() as f64);
    h.dispatch(&heartbeat);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_worker_up{hostname="h"} 0"#));
}

#[tokio::test]
async fn scenario_e_purge_after_timeout() {
    let mut cfg = config();
    cfg.worker_timeout_secs = 5;
    cfg.purge_offline_worker_metrics_secs = 10;
    let h = Harness::new(cfg);

    let mut sent = blank_event("task-sent");
    sent.uuid = Some("t1".into());
    sent.name = Some("pkg.task".into());
    sent.hostname = Some("w@h".into());
    h.dispatch(&sent);

    let mut online = blank_event("worker-online");
    online.hostname = Some("w@h".into());
    online.timestamp = Some((Utc::now() - chrono::Duration::seconds(6)).timestamp() as f64);
    h.dispatch(&online);

    // First scrape: past worker_timeout_secs (6s old, timeout=5) but well
    // under purge_offline_worker_metrics_secs (10s) -> forgotten and
    // zeroed, sample still present.
    let text = h.scrape().await;
    assert!(text.contains(r#"celery_task_sent_total{hostname="h",name="pkg.task",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_worker_up{hostname="h"} 0"#));

    // A heartbeat reporting a last_seen far enough in the past pushes idle
    // time past the purge threshold on the very next scan.
    let mut heartbeat = blank_event("worker-heartbeat");
    heartbeat.hostname = Some("w@h".into());
    heartbeat.timestamp = Some((Utc::now() - chrono::Duration::seconds(20)).timestamp() as f64);
    h.dispatch(&heartbeat);

    let text = h.scrape().await;
    assert!(!text.contains("hostname=\"h\""));
}

#[tokio::test]
async fn scenario_f_generic_hostname_mode() {
    let mut cfg = config();
    cfg.generic_hostname_task_sent_metric = true;
    let h = Harness::new(cfg);

    let mut sent = blank_event("task-sent");
    sent.uuid = Some("t1".into());
    sent.name = Some("pkg.task".into());
    sent.hostname = Some("producer@real-host".into());
    h.dispatch(&sent);

    let mut received = blank_event("task-received");
    received.uuid = Some("t1".into());
    received.hostname = Some("w@real-host".into());
    h.dispatch(&received);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_task_sent_total{hostname="generic",name="pkg.task",queue_name="celery"} 1"#));
    assert!(text.contains(r#"celery_task_received_total{hostname="real-host",name="pkg.task",queue_name="celery"} 1"#));
}

#[tokio::test]
async fn scenario_g_initial_queue_seeding() {
    let mut cfg = config();
    cfg.queues = vec!["q_seed".to_string()];
    let h = Harness::new(cfg);

    let text = h.scrape().await;
    assert!(text.contains(r#"celery_queue_length{queue_name="q_seed"} 0"#));
    assert!(!text.contains(r#"queue_name="celery""#));
}
