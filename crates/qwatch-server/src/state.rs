//! Shared application state handed to every axum handler.

use std::sync::Arc;

use parking_lot::Mutex;
use qwatch_broker::BrokerProbe;
use qwatch_core::ExporterConfig;
use qwatch_metrics::MetricRegistry;
use qwatch_state::tracker::StateTracker;

/// Cloneable handle shared across the HTTP server and the event loop
/// (spec.md §5): the tracker is guarded by a coarse mutex since both the
/// scrape path's liveness scan and the event loop mutate it, while the
/// metric registry and broker probe are internally synchronized or
/// stateless enough not to need an additional lock here.
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Mutex<StateTracker>>,
    pub metrics: Arc<MetricRegistry>,
    pub probe: Arc<BrokerProbe>,
    pub config: Arc<ExporterConfig>,
}

impl AppState {
    pub fn new(
        tracker: Arc<Mutex<StateTracker>>,
        metrics: Arc<MetricRegistry>,
        probe: Arc<BrokerProbe>,
        config: Arc<ExporterConfig>,
    ) -> Self {
        Self {
            tracker,
            metrics,
            probe,
            config,
        }
    }
}
