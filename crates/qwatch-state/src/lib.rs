//! The worker/task/queue state tracker (spec component: State tracker).

pub mod tracker;

pub use tracker::{LivenessReport, RecordOutcome, StateTracker};
