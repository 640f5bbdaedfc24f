//! HTTP endpoint adapters and the scrape orchestrator (spec.md §4.7, §4.8).

pub mod routes;
pub mod scrape;
pub mod state;

pub use routes::build_router;
pub use scrape::run_scrape;
pub use state::AppState;
