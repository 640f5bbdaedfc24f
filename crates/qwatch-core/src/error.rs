use thiserror::Error;

/// Error taxonomy for the exporter core.
///
/// Variants line up with the error handling design: configuration errors are
/// fatal at startup, broker connect/IO errors drive the event receiver's
/// retry path, broker control errors surface through the scrape orchestrator,
/// and `Label` captures the "structural configuration error" case where a
/// configured label references a task attribute that doesn't exist.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker connect error ({uri}): {source}")]
    BrokerConnect {
        uri: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("broker control error: {0}")]
    BrokerControl(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("missing task attribute for label {label:?} on task {task_id}")]
    MissingLabel { label: String, task_id: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ExporterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn broker_control(msg: impl Into<String>) -> Self {
        Self::BrokerControl(msg.into())
    }
}
