//! # Browser WebSocket Endpoint
//!
//! Browsers connect to `/ws`; each connection becomes one bridge session.
//!
//! ## Pieces:
//! - [`ClientSocket`]: the actix actor that owns the browser WebSocket. It
//!   turns incoming frames into [`InboundUnit`]s, writes outgoing frames, and
//!   runs the ping/timeout heartbeat.
//! - [`ActorDownstream`]: the bridge's view of that actor. Inbound units come
//!   through an mpsc channel, outbound units go to the actor as messages.
//! - [`bridge_websocket`]: the HTTP upgrade handler. It enforces the session
//!   cap, starts the actor, and spawns the task that connects upstream and
//!   runs the [`SessionBridge`].
//!
//! When the actor stops (browser closed, protocol error, heartbeat lost) it
//! cancels the session token, which unblocks the bridge wherever it waits.

use crate::bridge::{ControlMessage, Downstream, Frame, InboundUnit, OutboundUnit, SessionBridge};
use crate::config::BridgeConfig;
use crate::error::AppError;
use crate::realtime::RealtimeClient;
use crate::state::{AppState, SessionPermit};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one browser connection.
pub struct ClientSocket {
    session_id: String,

    /// Dropped when the actor stops, ending the bridge's inbound stream
    inbound: Option<mpsc::UnboundedSender<InboundUnit>>,

    cancel: CancellationToken,

    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl ClientSocket {
    pub fn new(
        session_id: String,
        inbound: mpsc::UnboundedSender<InboundUnit>,
        cancel: CancellationToken,
        bridge: &BridgeConfig,
    ) -> Self {
        Self {
            session_id,
            inbound: Some(inbound),
            cancel,
            last_heartbeat: Instant::now(),
            heartbeat_interval: bridge.heartbeat_interval(),
            client_timeout: bridge.client_timeout(),
        }
    }

    fn forward(&mut self, unit: InboundUnit, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .inbound
            .as_ref()
            .map(|tx| tx.send(unit).is_ok())
            .unwrap_or(false);

        if !delivered {
            // The bridge task is gone, nothing is left to serve this socket
            debug!(session_id = %self.session_id, "Bridge no longer receiving, closing socket");
            ctx.stop();
        }
    }
}

/// Map one browser frame to a bridge unit. Malformed or unknown text frames
/// yield `None` and never reach the bridge.
fn decode_frame(msg: &ws::Message) -> Option<InboundUnit> {
    match msg {
        ws::Message::Binary(data) => Some(InboundUnit::AudioChunk(data.to_vec())),
        ws::Message::Text(text) => ControlMessage::parse(text).map(InboundUnit::Control),
        _ => None,
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct SendFrame(Frame);

#[derive(Message)]
#[rtype(result = "()")]
struct CloseSocket;

impl Actor for ClientSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        self.inbound.take();
        self.cancel.cancel();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Binary(_) | ws::Message::Text(_) => match decode_frame(&msg) {
                Some(unit) => self.forward(unit, ctx),
                None => {
                    debug!(session_id = %self.session_id, "Ignoring malformed control message");
                }
            },
            ws::Message::Ping(data) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            ws::Message::Pong(_) => {
                self.last_heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            ws::Message::Nop => {}
        }
    }
}

impl Handler<SendFrame> for ClientSocket {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        match msg.0 {
            Frame::Text(text) => ctx.text(text),
            Frame::Binary(data) => ctx.binary(data),
        }
    }
}

impl Handler<CloseSocket> for ClientSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseSocket, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// The bridge's handle on a [`ClientSocket`].
pub struct ActorDownstream {
    session_id: String,
    inbound: mpsc::UnboundedReceiver<InboundUnit>,
    addr: Addr<ClientSocket>,
}

#[async_trait]
impl Downstream for ActorDownstream {
    async fn receive(&mut self) -> Option<InboundUnit> {
        self.inbound.recv().await
    }

    fn send(&mut self, unit: OutboundUnit) {
        match unit.into_frame() {
            // Mailbox order is preserved; sends to a stopped actor are dropped
            Ok(frame) => self.addr.do_send(SendFrame(frame)),
            Err(err) => warn!(session_id = %self.session_id, "Failed to encode outbound message: {}", err),
        }
    }

    fn close(&mut self) {
        self.addr.do_send(CloseSocket);
    }
}

/// WebSocket endpoint handler.
///
/// Rejects the upgrade with 503 when `performance.max_concurrent_sessions`
/// bridge sessions are already open.
pub async fn bridge_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let permit = app_state.try_acquire_session().ok_or_else(|| {
        let max = app_state.config.performance.max_concurrent_sessions;
        warn!(max_sessions = max, "Rejecting WebSocket connection, session limit reached");
        AppError::ServiceUnavailable(format!("Session limit reached ({} active)", max))
    })?;

    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let socket = ClientSocket::new(
        session_id.clone(),
        inbound_tx,
        cancel.clone(),
        &app_state.config.bridge,
    );

    let (addr, response) = ws::WsResponseBuilder::new(socket, &req, stream).start_with_addr()?;

    let downstream = ActorDownstream {
        session_id: session_id.clone(),
        inbound: inbound_rx,
        addr,
    };

    tokio::spawn(run_session(
        app_state.get_ref().clone(),
        session_id,
        downstream,
        cancel,
        permit,
    ));

    Ok(response)
}

/// Connect upstream, then run the bridge until the session ends.
///
/// Holds the session permit for the whole lifetime of the session.
async fn run_session(
    state: AppState,
    session_id: String,
    mut downstream: ActorDownstream,
    cancel: CancellationToken,
    _permit: SessionPermit,
) {
    let settings = &state.config.realtime;
    let connect_timeout = state.config.bridge.response_timeout();

    let connected = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(session_id = %session_id, "Browser left before upstream connected");
            return;
        }
        result = tokio::time::timeout(connect_timeout, RealtimeClient::connect(settings)) => result,
    };

    let upstream = match connected {
        Ok(Ok(client)) => client,
        Ok(Err(err)) => {
            error!(session_id = %session_id, "Failed to connect to realtime service: {}", err);
            fail_session(&state, &mut downstream, format!("Failed to connect to realtime service: {}", err));
            return;
        }
        Err(_elapsed) => {
            error!(session_id = %session_id, "Timed out connecting to realtime service");
            fail_session(&state, &mut downstream, "Timed out connecting to realtime service".to_string());
            return;
        }
    };

    let bridge = SessionBridge::new(
        session_id,
        upstream,
        downstream,
        cancel,
        state.config.bridge.response_timeout(),
        state.config.bridge.response_deadline(),
    );
    let report = bridge.run().await;
    state.record_session_report(&report);
}

fn fail_session(state: &AppState, downstream: &mut ActorDownstream, message: String) {
    state.record_upstream_failure();
    downstream.send(OutboundUnit::status(message));
    downstream.close();
}
