//! Binary entry point: parse flags, wire the production broker transports
//! into the core crates, and run the event loop alongside the HTTP server
//! until a terminal signal or a fatal broker fault (spec.md §5, §6).

mod cli;
mod transports;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use qwatch_broker::control::{BrokerControl, InMemoryBroker, QueueIntrospector};
use qwatch_broker::probe::{BrokerProbe, PriorityConfig};
use qwatch_broker::transports::{AmqpBrokerControl, AmqpIntrospector, RedisBrokerControl, RedisIntrospector};
use qwatch_core::{BrokerTransport, ExporterConfig};
use qwatch_events::handlers::HandlerOptions;
use qwatch_events::receiver::{EventReceiver, ReceiverOutcome};
use qwatch_events::source::{EventSource, InMemoryEventSource};
use qwatch_metrics::MetricRegistry;
use qwatch_server::{build_router, AppState};
use qwatch_state::tracker::StateTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::transports::{AmqpEventSource, RedisEventSource};

/// Namespace prefix the broker-side pidbox/event channels are built from.
/// Mirrors the default Celery uses when the broker URL carries no
/// transport option overriding it.
const DEFAULT_NAMESPACE: &str = "celery";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_format = cli.log_format.clone();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config.log_level, &log_format);

    match run(config).await {
        Ok(ReceiverOutcome::Signalled) => {
            info!("exporter shut down cleanly");
            ExitCode::SUCCESS
        }
        Ok(ReceiverOutcome::FatalBrokerFault) => {
            error!("fatal broker exception with retry disabled; exiting");
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "fatal error during startup");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_format.eq_ignore_ascii_case("json") {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}

/// The exporter's own UTC offset in hours, used by `timestamp-normalize`
/// (spec.md §4.3) to correct cross-timezone worker timestamps.
fn local_utcoffset_hours() -> f64 {
    chrono::Local::now().offset().local_minus_utc() as f64 / 3600.0
}

/// Read an optional priority-step fan-out configuration from the parsed
/// broker transport options (spec.md §4.6 step 5). Absent unless the
/// broker URL's transport options name both a step list and (optionally) a
/// custom separator.
fn priority_config(config: &ExporterConfig) -> Option<PriorityConfig> {
    let steps = config
        .broker_transport_options
        .get("priority_steps")
        .and_then(|v| v.as_array())?
        .iter()
        .filter_map(|v| v.as_u64().map(|n| n as u32))
        .collect::<Vec<_>>();
    if steps.is_empty() {
        return None;
    }
    let separator = config
        .broker_transport_options
        .get("priority_separator")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| PriorityConfig::DEFAULT_SEPARATOR.to_string());
    Some(PriorityConfig { steps, separator })
}

async fn run(config: ExporterConfig) -> anyhow::Result<ReceiverOutcome> {
    let transport = config.broker_transport()?;
    let config = Arc::new(config);

    let mut tracker = StateTracker::new();
    tracker.seed_queues(config.queues.iter().cloned());
    let tracker = Arc::new(Mutex::new(tracker));

    let metrics = Arc::new(MetricRegistry::new(&config)?);
    let priority = priority_config(&config);

    // Kept alive for the lifetime of the event loop: dropping the in-memory
    // source's sender would close its channel and make the receiver see an
    // immediate, permanent disconnect.
    let mut memory_sender_keepalive: Option<tokio::sync::mpsc::Sender<qwatch_core::Event>> = None;

    let (event_source, control, introspector): (
        Box<dyn EventSource>,
        Arc<dyn BrokerControl>,
        Arc<dyn QueueIntrospector>,
    ) = match transport {
        BrokerTransport::Redis | BrokerTransport::RedisTls | BrokerTransport::Sentinel => {
            let source = RedisEventSource::connect(&config.broker_url, DEFAULT_NAMESPACE)?;
            let control = RedisBrokerControl::connect(&config.broker_url, DEFAULT_NAMESPACE).await?;
            let introspector = RedisIntrospector::connect(&config.broker_url).await?;
            (Box::new(source), Arc::new(control), Arc::new(introspector))
        }
        BrokerTransport::Amqp | BrokerTransport::Amqps => {
            let source = AmqpEventSource::connect(&config.broker_url, DEFAULT_NAMESPACE).await?;
            let control = AmqpBrokerControl::connect(&config.broker_url, DEFAULT_NAMESPACE).await?;
            let introspector = AmqpIntrospector::connect(&config.broker_url).await?;
            (Box::new(source), Arc::new(control), Arc::new(introspector))
        }
        BrokerTransport::Memory => {
            let (source, tx) = InMemoryEventSource::new(1024);
            memory_sender_keepalive = Some(tx);
            let broker = Arc::new(InMemoryBroker::new());
            (Box::new(source), broker.clone(), broker)
        }
    };

    let probe = Arc::new(BrokerProbe::new(control, introspector, priority));
    let state = AppState::new(tracker.clone(), metrics.clone(), probe, config.clone());
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!(error = %err, "http server exited");
        }
    });

    let options = HandlerOptions {
        generic_hostname_task_sent_metric: config.generic_hostname_task_sent_metric,
        queue_time_gauge_enabled: true,
    };
    let receiver = EventReceiver::new(
        UnsizedSource(event_source),
        config.retry_interval_secs,
        local_utcoffset_hours(),
        options,
    );
    let outcome = receiver.run(tracker, metrics).await?;
    server.abort();
    Ok(outcome)
}

/// Adapts a boxed trait object to the `EventSource` bound `EventReceiver`
/// is generic over, so the production binary can pick its transport at
/// runtime while the receiver itself stays monomorphic over test doubles.
struct UnsizedSource(Box<dyn EventSource>);

#[async_trait::async_trait]
impl EventSource for UnsizedSource {
    async fn capture(&self, wakeup: bool) -> Result<qwatch_events::source::EventStream, qwatch_core::ExporterError> {
        self.0.capture(wakeup).await
    }

    fn display_uri(&self) -> String {
        self.0.display_uri()
    }
}
