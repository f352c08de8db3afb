//! # Events.
//!
//! Everything the pipeline wants to tell the embedding application flows
//! through one bounded channel: log lines, audit entries, processing
//! results. The queue worker can drain them for its own logging or ignore
//! them entirely.

use async_channel::{self as channel, Receiver, Sender, TrySendError};

/// Event channel.
#[derive(Debug, Clone)]
pub struct Events {
    receiver: Receiver<Event>,
    sender: Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

impl Events {
    /// Creates a new events channel.
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(1_000);
        Self { receiver, sender }
    }

    /// Emits an event into the channel.
    ///
    /// If the channel is full, the oldest event is dropped to make room.
    pub fn emit(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.receiver.try_recv();
                self.emit(event);
            }
            Err(TrySendError::Closed(_)) => {
                unreachable!("unable to emit event, channel disconnected");
            }
        }
    }

    /// Creates an emitter for the receiving side.
    pub fn get_emitter(&self) -> EventEmitter {
        EventEmitter(self.receiver.clone())
    }
}

/// A receiver of events from [`Events`].
#[derive(Debug, Clone)]
pub struct EventEmitter(Receiver<Event>);

impl EventEmitter {
    /// Async recv of an event. Returns `None` if all `Sender`s have been dropped.
    pub async fn recv(&self) -> Option<Event> {
        self.0.recv().await.ok()
    }

    /// Tries to receive an event without blocking.
    pub fn try_recv(&self) -> Option<Event> {
        self.0.try_recv().ok()
    }
}

/// The event queue's payload.
pub type Event = EventType;

/// Event emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    /// Informational log line, not meant for end users.
    Info(String),

    /// Warning log line, not meant for end users.
    Warning(String),

    /// Error log line. Something went wrong that an operator should see.
    Error(String),

    /// A pipeline run finished successfully.
    IncomingEmailProcessed {
        /// Row id of the processing record.
        record_id: i64,
    },

    /// A pipeline run ended in a classified error.
    IncomingEmailFailed {
        /// Row id of the processing record, if one was created.
        record_id: Option<i64>,
        /// Stable error kind token, see `ProcessingError::kind`.
        kind: &'static str,
    },

    /// A bounce was counted against a sender.
    BounceRegistered {
        /// Normalized sender address.
        addr: String,
        /// Accumulated windowed score after this bounce.
        score: i64,
    },

    /// A sender crossed the bounce threshold and lost mail delivery.
    ///
    /// This is the audit trail for the revocation; it is emitted exactly
    /// once per crossing.
    SenderMailRevoked {
        /// Normalized sender address.
        addr: String,
        /// Score at the moment of revocation.
        score: i64,
    },
}
