//! The event receiver: owns the broker connection, reconnects on fault per
//! `retry_interval`, and drives every captured event through the handler
//! table (spec.md §4.1).

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use qwatch_core::ExporterError;
use qwatch_metrics::registry::MetricRegistry;
use qwatch_state::tracker::StateTracker;
use tracing::{error, info, warn};

use crate::handlers::{HandlerOptions, HandlerTable};
use crate::source::EventSource;

/// How the receiver's `run` loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverOutcome {
    /// An interrupt/terminate signal was observed; shutdown is clean.
    Signalled,
    /// `retry_interval == 0` and the broker connection failed; the caller
    /// should treat this as a fatal exit (spec.md §6 exit code 1).
    FatalBrokerFault,
}

pub struct EventReceiver<S: EventSource> {
    source: S,
    retry_interval_secs: u64,
    local_utcoffset_hours: f64,
    options: HandlerOptions,
}

impl<S: EventSource> EventReceiver<S> {
    pub fn new(
        source: S,
        retry_interval_secs: u64,
        local_utcoffset_hours: f64,
        options: HandlerOptions,
    ) -> Self {
        Self {
            source,
            retry_interval_secs,
            local_utcoffset_hours,
            options,
        }
    }

    /// Drive the event loop until a terminal signal or a fatal broker
    /// fault. `tracker` and `metrics` are shared with the HTTP scrape path
    /// (spec.md §5): the event loop is the tables' primary writer, but the
    /// scrape path's liveness scan also briefly takes the tracker lock.
    pub async fn run(
        &self,
        tracker: Arc<Mutex<StateTracker>>,
        metrics: Arc<MetricRegistry>,
    ) -> Result<ReceiverOutcome, ExporterError> {
        loop {
            info!(uri = %self.source.display_uri(), "opening broker event capture session");
            let mut stream = match self.source.capture(true).await {
                Ok(stream) => stream,
                Err(err) => {
                    error!(uri = %self.source.display_uri(), error = %err, "broker connect error");
                    if self.retry_interval_secs == 0 {
                        return Ok(ReceiverOutcome::FatalBrokerFault);
                    }
                    warn!(seconds = self.retry_interval_secs, "retrying broker connection");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(self.retry_interval_secs)) => continue,
                        _ = wait_for_shutdown_signal() => return Ok(ReceiverOutcome::Signalled),
                    }
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = wait_for_shutdown_signal() => {
                        info!("shutdown signal received; exiting event loop");
                        return Ok(ReceiverOutcome::Signalled);
                    }
                    event = stream.next() => {
                        match event {
                            Some(event) => {
                                let now = Utc::now();
                                let mut guard = tracker.lock();
                                HandlerTable::dispatch(
                                    &event,
                                    &mut guard,
                                    &metrics,
                                    self.options,
                                    now,
                                    self.local_utcoffset_hours,
                                );
                            }
                            None => {
                                warn!("broker event stream disconnected");
                                break;
                            }
                        }
                    }
                }
            }

            if self.retry_interval_secs == 0 {
                return Ok(ReceiverOutcome::FatalBrokerFault);
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.retry_interval_secs)) => {}
                _ = wait_for_shutdown_signal() => return Ok(ReceiverOutcome::Signalled),
            }
        }
    }
}

/// Resolves when an interrupt or terminate signal arrives. Never swallowed
/// by the retry path (spec.md §4.1, §5 "Cancellation").
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryEventSource;
    use qwatch_core::{Event, ExporterConfig};

    fn event(kind: &str) -> Event {
        Event {
            kind: kind.to_string(),
            hostname: Some("w@h".into()),
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

    #[tokio::test]
    async fn receiver_processes_events_until_stream_closes_and_retry_disabled() {
        let (source, tx) = InMemoryEventSource::new(8);
        tx.send(event("worker-online")).await.unwrap();
        drop(tx);

        let tracker = Arc::new(Mutex::new(StateTracker::new()));
        let metrics = Arc::new(
            MetricRegistry::new(&ExporterConfig {
                broker_url: "memory://".into(),
                ..ExporterConfig::default()
            })
            .unwrap(),
        );
        let receiver = EventReceiver::new(source, 0, 0.0, HandlerOptions::default());
        let outcome = receiver.run(tracker.clone(), metrics.clone()).await.unwrap();
        assert_eq!(outcome, ReceiverOutcome::FatalBrokerFault);
        assert!(tracker.lock().get_worker("h").is_some());
    }
}
