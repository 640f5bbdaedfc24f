//! Event ingestion: the broker-facing receiver and the handler table that
//! turns raw events into state-tracker mutations and metric updates.

pub mod handlers;
pub mod receiver;
pub mod source;

pub use handlers::HandlerTable;
pub use receiver::{EventReceiver, ReceiverOutcome};
pub use source::{EventSource, EventStream};
