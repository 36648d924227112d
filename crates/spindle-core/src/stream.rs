//! Cross-thread delivery of generated tokens
//!
//! The generation thread must never wait on the consumer. Events go into an
//! unbounded channel drained by a dedicated delivery thread that invokes the
//! sink, so the consumer sees every event exactly once and in submission
//! order.

use crate::{CoreError, Result, RunError};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{trace, warn};

/// Fragment sent to the host when generation reaches end of sequence
pub const END_OF_TEXT: &str = "[end of text]";

/// One unit of streamed output
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text piece of one token
    Token(String),

    /// End of sequence was generated; no further events follow
    EndOfText,

    /// The run aborted; no further events follow
    Failed(RunError),
}

impl StreamEvent {
    /// UTF-8 fragment as seen across the host boundary
    pub fn text(&self) -> Option<&str> {
        match self {
            StreamEvent::Token(piece) => Some(piece),
            StreamEvent::EndOfText => Some(END_OF_TEXT),
            StreamEvent::Failed(_) => None,
        }
    }

    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

/// Consumer of streamed events, called on the delivery thread
pub trait TokenSink: Send + 'static {
    fn deliver(&mut self, event: StreamEvent);
}

impl<F> TokenSink for F
where
    F: FnMut(StreamEvent) + Send + 'static,
{
    fn deliver(&mut self, event: StreamEvent) {
        self(event)
    }
}

/// Ordered, non-blocking channel from a generation run to its sink
pub struct DeliveryChannel {
    sender: Option<UnboundedSender<StreamEvent>>,
    consumer: Option<JoinHandle<usize>>,
}

impl DeliveryChannel {
    /// Spawn the delivery thread feeding `sink`
    pub fn open<S: TokenSink>(mut sink: S) -> Result<Self> {
        let (sender, mut receiver) = unbounded_channel::<StreamEvent>();

        let consumer = std::thread::Builder::new()
            .name("spindle-delivery".to_string())
            .spawn(move || {
                let mut delivered = 0usize;
                while let Some(event) = receiver.blocking_recv() {
                    sink.deliver(event);
                    delivered += 1;
                }
                trace!(delivered, "delivery thread drained");
                delivered
            })
            .map_err(|err| CoreError::Io {
                code: "STREAM_SPAWN_FAILED",
                message: err.to_string(),
                path: None,
                suggestion: "The system may be out of threads; retry later".to_string(),
                source: err,
            })?;

        Ok(Self {
            sender: Some(sender),
            consumer: Some(consumer),
        })
    }

    /// Enqueue an event; never blocks.
    ///
    /// Returns `false` if the delivery thread is gone (the sink panicked).
    pub fn emit(&self, event: StreamEvent) -> bool {
        match &self.sender {
            Some(sender) => match sender.send(event) {
                Ok(()) => true,
                Err(_) => {
                    warn!("delivery thread stopped, dropping event");
                    false
                }
            },
            None => false,
        }
    }

    /// Stop accepting events, wait until the sink received every queued
    /// event, and return how many were delivered
    pub fn close(mut self) -> usize {
        self.finish()
    }

    fn finish(&mut self) -> usize {
        // Dropping the sender ends the consumer loop once the queue is empty.
        self.sender.take();
        match self.consumer.take() {
            Some(consumer) => consumer.join().unwrap_or_else(|_| {
                warn!("token sink panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for DeliveryChannel {
    fn drop(&mut self) {
        if self.consumer.is_some() {
            self.finish();
        }
    }
}
