//! Scrape orchestrator (spec.md §4.7): run the liveness scan, run the
//! broker probe, then hand back encoded Prometheus text. Invoked
//! synchronously from `GET /metrics` — scrape duration is the sum of the
//! broker round-trips spent inside it, by design (spec.md §5).

use chrono::Utc;
use qwatch_core::ExporterError;
use qwatch_metrics::run_liveness_scan;

use crate::state::AppState;

pub async fn run_scrape(state: &AppState) -> Result<String, ExporterError> {
    {
        let mut tracker = state.tracker.lock();
        run_liveness_scan(
            &mut tracker,
            &state.metrics,
            Utc::now(),
            state.config.worker_timeout_secs,
            state.config.purge_offline_worker_metrics_secs,
        );
    }

    {
        let mut tracker = state.tracker.lock();
        state.probe.run(&mut tracker, &state.metrics).await?;
    }

    state.metrics.gather_text()
}
