//! Shared data model, configuration, and error types for the exporter.
//!
//! Every other crate in the workspace depends on this one; it performs no
//! I/O of its own.

pub mod config;
pub mod error;
pub mod model;

pub use config::{BrokerTransport, ExporterConfig, StaticLabels};
pub use error::ExporterError;
pub use model::{Event, Queue, Task, Worker};
