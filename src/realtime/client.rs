//! WebSocket client for the hosted realtime service (Azure OpenAI deployment).
//!
//! ## Connection:
//! - URL: `wss://<endpoint>/openai/realtime?api-version=<v>&deployment=<d>`
//! - Auth: `api-key` header
//! - Right after the handshake a `session.update` is sent enabling audio and
//!   text output with turn detection switched off.

use super::messages::{event_kind, ClientEvent, ServerEvent, SessionConfig, TurnDetection};
use super::{UpstreamError, UpstreamEvent, UpstreamResult, UpstreamSession};
use crate::config::RealtimeSettings;

use async_trait::async_trait;
use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An open realtime session over a single WebSocket connection.
pub struct RealtimeClient {
    ws: WsStream,
    closed: bool,
}

impl RealtimeClient {
    /// Open a connection and configure the session.
    ///
    /// `settings` is the process-wide, read-only service configuration; it is
    /// passed in explicitly for every new bridge session.
    pub async fn connect(settings: &RealtimeSettings) -> UpstreamResult<Self> {
        let url = build_ws_url(settings)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;
        let api_key = HeaderValue::from_str(&settings.api_key)
            .map_err(|e| UpstreamError::ConnectionFailed(format!("Invalid API key header: {}", e)))?;
        request.headers_mut().insert("api-key", api_key);

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(e.to_string()))?;

        info!(host = url.host_str().unwrap_or(""), deployment = %settings.deployment, "Connected to realtime service");

        let mut client = Self { ws, closed: false };
        client
            .send(ClientEvent::SessionUpdate {
                session: session_config(settings),
            })
            .await?;

        Ok(client)
    }

    async fn send(&mut self, event: ClientEvent) -> UpstreamResult<()> {
        let payload = serde_json::to_string(&event)?;
        self.ws.send(Message::Text(payload)).await?;
        Ok(())
    }
}

/// Translate one decoded service event into what the bridge consumes.
fn translate(event: ServerEvent, raw: &str) -> UpstreamResult<UpstreamEvent> {
    match event {
        ServerEvent::TextDelta { delta } => Ok(UpstreamEvent::TextDelta(delta)),
        ServerEvent::AudioDelta { delta } => BASE64_STANDARD
            .decode(delta.as_bytes())
            .map(UpstreamEvent::AudioDelta)
            .map_err(|e| UpstreamError::Protocol(format!("Invalid audio delta: {}", e))),
        ServerEvent::ResponseCompleted => Ok(UpstreamEvent::ResponseCompleted),
        ServerEvent::Error { error } => Ok(UpstreamEvent::ServiceError {
            code: error.code.unwrap_or(error.error_type),
            message: error.message,
        }),
        ServerEvent::Unknown => Ok(UpstreamEvent::Other(event_kind(raw))),
    }
}

fn session_config(settings: &RealtimeSettings) -> SessionConfig {
    SessionConfig {
        modalities: vec!["audio".to_string(), "text".to_string()],
        turn_detection: TurnDetection::None,
        voice: settings.voice.clone(),
        instructions: settings.instructions.clone(),
    }
}

/// Build the realtime WebSocket URL from the configured HTTP(S) endpoint.
pub fn build_ws_url(settings: &RealtimeSettings) -> UpstreamResult<Url> {
    let mut url = Url::parse(&settings.endpoint)
        .map_err(|e| UpstreamError::ConnectionFailed(format!("Invalid endpoint: {}", e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(UpstreamError::ConnectionFailed(format!(
                "Unsupported endpoint scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| UpstreamError::ConnectionFailed("Cannot rewrite endpoint scheme".to_string()))?;

    let path = format!("{}/openai/realtime", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("api-version", &settings.api_version)
        .append_pair("deployment", &settings.deployment);

    Ok(url)
}

#[async_trait]
impl UpstreamSession for RealtimeClient {
    async fn append_audio(&mut self, audio: &[u8]) -> UpstreamResult<()> {
        trace!(bytes = audio.len(), "input_audio_buffer.append");
        self.send(ClientEvent::audio_append(audio)).await
    }

    async fn clear_input_buffer(&mut self) -> UpstreamResult<()> {
        debug!("input_audio_buffer.clear");
        self.send(ClientEvent::InputAudioBufferClear).await
    }

    async fn commit_input_buffer(&mut self) -> UpstreamResult<()> {
        debug!("input_audio_buffer.commit");
        self.send(ClientEvent::InputAudioBufferCommit).await
    }

    async fn create_response(&mut self) -> UpstreamResult<()> {
        debug!("response.create");
        self.send(ClientEvent::ResponseCreate).await
    }

    async fn next_event(&mut self) -> UpstreamResult<Option<UpstreamEvent>> {
        loop {
            let message = match self.ws.next().await {
                Some(message) => message?,
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    let event = match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => event,
                        Err(err) => {
                            // A known kind with an unexpected shape is skipped like an unknown one
                            warn!(kind = %event_kind(&text), "Undecodable realtime event: {}", err);
                            return Ok(Some(UpstreamEvent::Other(event_kind(&text))));
                        }
                    };
                    return translate(event, &text).map(Some);
                }
                Message::Binary(data) => {
                    debug!(bytes = data.len(), "Ignoring binary frame from realtime service");
                    return Ok(Some(UpstreamEvent::Other("binary".to_string())));
                }
                Message::Close(frame) => {
                    info!("Realtime service closed the connection: {:?}", frame);
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(err) = self.ws.close(None).await {
            debug!("Realtime connection close: {}", err);
        }
    }
}
