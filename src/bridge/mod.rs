//! # Session Bridge
//!
//! Mediates between one browser connection (downstream) and one realtime
//! service connection (upstream) for the lifetime of the browser connection.
//!
//! ## Browser Protocol:
//! - **Binary frame → server**: raw audio appended verbatim to the upstream
//!   input buffer (24kHz mono PCM16, agreed out of band)
//! - **Text frame → server**: `{"type": "start"}` or `{"type": "stop"}`
//! - **Server → browser**: `status`, `text_delta` and `done` JSON messages,
//!   plus binary frames carrying response audio unchanged
//!
//! The browser side is reached through the [`Downstream`] trait so the state
//! machine in [`session`] can be driven by the actix WebSocket actor in
//! production and by in-memory fakes in tests.

pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use session::{BridgeExit, BridgeReport, SessionBridge, CONNECTED_MESSAGE};

/// Control messages the browser may send as JSON text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Begin a new utterance: clears the upstream input buffer
    Start,
    /// End the utterance: commit the buffer and request a response
    Stop,
}

impl ControlMessage {
    /// Parse a text frame. Anything that is not a well-formed `start`/`stop`
    /// message yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// One unit received from the browser.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundUnit {
    AudioChunk(Vec<u8>),
    Control(ControlMessage),
}

/// One unit sent to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundUnit {
    Status {
        message: String,
    },
    TextDelta {
        delta: String,
    },
    /// Sent as a binary frame, never serialized
    #[serde(skip)]
    AudioDelta(Vec<u8>),
    Done,
}

/// Wire form of an [`OutboundUnit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl OutboundUnit {
    pub fn status(message: impl Into<String>) -> Self {
        OutboundUnit::Status {
            message: message.into(),
        }
    }

    pub fn into_frame(self) -> Result<Frame, serde_json::Error> {
        match self {
            OutboundUnit::AudioDelta(data) => Ok(Frame::Binary(data)),
            other => serde_json::to_string(&other).map(Frame::Text),
        }
    }
}

/// The browser half of a bridge session.
#[async_trait]
pub trait Downstream: Send {
    /// Wait for the next unit. `None` means the browser went away.
    async fn receive(&mut self) -> Option<InboundUnit>;

    /// Queue a unit for delivery without waiting for it to be written.
    /// Units are delivered in the order they were queued.
    fn send(&mut self, unit: OutboundUnit);

    /// Close the browser connection.
    fn close(&mut self);
}
