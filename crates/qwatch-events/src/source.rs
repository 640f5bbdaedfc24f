//! The boundary between the out-of-scope broker client library (spec.md §1)
//! and the event receiver: a small trait the receiver drives, implemented
//! once for production brokers (outside this crate, by `qwatch-cli`'s
//! wiring) and once in-memory for tests.

use async_trait::async_trait;
use qwatch_core::{Event, ExporterError};
use tokio::sync::mpsc;

/// A capture session's event stream. Wraps a channel receiver rather than
/// `futures::Stream` directly so the receiver loop can `select!` against it
/// alongside signal futures without extra pinning ceremony.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Returns `None` once the producer side disconnects — the capture
    /// session ended (spec.md §4.1: "loss of connection is a recoverable
    /// fault").
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// A connection to the broker's event stream. `capture` opens one session;
/// returning `Err` signals a connect/IO fault that the receiver's retry
/// loop (spec.md §4.1) is responsible for handling.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a capture session. `wakeup` requests the broker ask all workers
    /// to broadcast their current state immediately, so heartbeats arrive
    /// promptly rather than waiting for their next natural interval
    /// (spec.md §4.1 "Wakeup"). Production sources pass this straight
    /// through to the broker client; the in-memory source ignores it.
    async fn capture(&self, wakeup: bool) -> Result<EventStream, ExporterError>;

    /// A stable identifier for logging (host/scheme only — never a full
    /// connection string that might embed credentials).
    fn display_uri(&self) -> String;
}

/// An in-process event source fed by a channel, used by local/dev runs and
/// by the scenario tests in `qwatch-server/tests`. Each `capture()` call
/// hands out a receiver wired to the same sender, i.e. events published
/// before the first capture are buffered rather than lost.
pub struct InMemoryEventSource {
    tx: mpsc::Sender<Event>,
    rx: parking_lot::Mutex<Option<mpsc::Receiver<Event>>>,
}

impl InMemoryEventSource {
    pub fn new(buffer: usize) -> (Self, mpsc::Sender<Event>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                tx: tx.clone(),
                rx: parking_lot::Mutex::new(Some(rx)),
            },
            tx,
        )
    }

    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn capture(&self, _wakeup: bool) -> Result<EventStream, ExporterError> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| ExporterError::Other("in-memory event source already captured".into()))?;
        Ok(EventStream::new(rx))
    }

    fn display_uri(&self) -> String {
        "memory://in-process".to_string()
    }
}
