use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use super::Event;

/// A flushed batch, shared by every subscriber it is delivered to.
pub type Batch = Arc<[Event]>;

/// Why a batch could not be handed to a subscriber.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("subscriber closed")]
    Closed,

    #[error("subscriber queue full")]
    Full,

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Label value for the delivery error counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full => "full",
            Self::Io(_) => "io",
            Self::Encode(_) => "encode",
        }
    }
}

/// Transport side of the broadcaster. Delivery must not block: a slow
/// subscriber reports [`DeliveryError::Full`] instead of stalling the
/// flush for everyone else.
pub trait Subscriber: Send + Sync {
    /// Returns the subscriber's name for logging.
    fn name(&self) -> &str;

    /// Hands one ordered batch to the transport.
    fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError>;
}

/// Forwards batches into a bounded tokio channel.
pub struct ChannelSubscriber {
    name: String,
    tx: mpsc::Sender<Batch>,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the receiving end of its channel.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Batch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

impl Subscriber for ChannelSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        self.tx.try_send(Arc::clone(batch)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Writes every batch as one JSON array line (NDJSON).
pub struct WriterSubscriber<W> {
    name: String,
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSubscriber<W> {
    pub fn new(name: impl Into<String>, writer: W) -> Self {
        Self {
            name: name.into(),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Subscriber for WriterSubscriber<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let line = serde_json::to_vec(&**batch)?;
        let mut writer = self.writer.lock();

        let result = writer
            .write_all(&line)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(DeliveryError::Closed),
            Err(e) => Err(DeliveryError::Io(e)),
        }
    }
}
