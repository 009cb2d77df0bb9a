//! # Upstream Realtime Session
//!
//! Contract between the session bridge and the hosted realtime AI service.
//! One [`UpstreamSession`] is one open duplex connection to the service, owned
//! exclusively by one bridge session.
//!
//! ## Operations:
//! - **append/clear/commit**: manage the service-side input audio buffer
//! - **create_response**: ask the service to answer the committed input
//! - **next_event**: pull the next event from the (single, non-restartable)
//!   inbound event sequence
//! - **close**: release the connection
//!
//! Every operation can fail with an [`UpstreamError`]. Nothing retries: a
//! failure ends the bridge session that owns the connection.

pub mod client;
pub mod messages;

use async_trait::async_trait;
use thiserror::Error;

pub use client::RealtimeClient;

/// Errors raised by an upstream realtime connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket transport error after the connection was established
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// An outgoing event could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service sent something the bridge cannot forward
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Events the bridge consumes from the upstream event sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Incremental response text
    TextDelta(String),
    /// Incremental response audio, already decoded to raw bytes
    AudioDelta(Vec<u8>),
    /// The response cycle finished
    ResponseCompleted,
    /// The service rejected a request but kept the session open
    ServiceError { code: String, message: String },
    /// Any other event kind, carried by name for logging only
    Other(String),
}

/// One open connection to the realtime service.
///
/// `next_event` must be cancel-safe: the bridge races it against session
/// cancellation and the stall timeout.
#[async_trait]
pub trait UpstreamSession: Send {
    async fn append_audio(&mut self, audio: &[u8]) -> UpstreamResult<()>;

    async fn clear_input_buffer(&mut self) -> UpstreamResult<()>;

    async fn commit_input_buffer(&mut self) -> UpstreamResult<()>;

    async fn create_response(&mut self) -> UpstreamResult<()>;

    /// Next event from the service, `Ok(None)` once the service has closed
    /// the stream.
    async fn next_event(&mut self) -> UpstreamResult<Option<UpstreamEvent>>;

    /// Close the connection. Failures are logged, not returned.
    async fn close(&mut self);
}
