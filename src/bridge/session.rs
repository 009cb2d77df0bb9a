//! # Bridge Session State Machine
//!
//! One [`SessionBridge`] runs per browser connection, as a single task that
//! owns both halves of the session. Nothing else mutates its state, so the
//! two connections never race.
//!
//! ## States:
//! 1. **Idle**: no utterance open. Audio is still forwarded upstream.
//! 2. **Recording**: entered on `start` (after clearing the upstream buffer).
//!    Each audio chunk is appended upstream as it arrives.
//! 3. **Streaming**: entered on `stop` (after commit + create response).
//!    Upstream events are drained and relayed until completion, then the
//!    session returns to Idle.
//! 4. **Terminal**: either side closed or failed. Both connections are
//!    released.
//!
//! ## Scheduling:
//! While Idle/Recording the task waits on the browser; while Streaming it
//! waits on the service. Browser input that arrives during Streaming stays
//! queued and is handled, in order, after `done` has been sent. Every wait
//! also watches the session's cancellation token, which fires when the
//! browser disconnects.

use super::{ControlMessage, Downstream, InboundUnit, OutboundUnit};
use crate::realtime::{UpstreamEvent, UpstreamResult, UpstreamSession};

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// First message sent to the browser once the upstream session is ready.
pub const CONNECTED_MESSAGE: &str = "Connected to Azure";

/// Upper bound on waiting for the upstream close handshake.
const UPSTREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// State of the upstream input buffer as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    Recording,
}

/// Why a bridge session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeExit {
    /// The browser closed its connection
    ClientDisconnected,
    /// The session was cancelled from outside (browser gone, heartbeat lost)
    Cancelled,
    /// The service ended the event stream
    UpstreamClosed,
    /// An upstream call or the event stream failed
    UpstreamFailed(String),
    /// No upstream event arrived within the response timeout
    Stalled,
}

impl BridgeExit {
    /// Whether the browser is still there to be told why the session ended.
    fn client_reachable(&self) -> bool {
        !matches!(self, BridgeExit::ClientDisconnected | BridgeExit::Cancelled)
    }

    fn status_message(&self) -> Option<String> {
        match self {
            BridgeExit::ClientDisconnected | BridgeExit::Cancelled => None,
            BridgeExit::UpstreamClosed => Some("Realtime service closed the session".to_string()),
            BridgeExit::UpstreamFailed(reason) => Some(format!("Realtime service error: {}", reason)),
            BridgeExit::Stalled => Some("Realtime service stopped responding".to_string()),
        }
    }

    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            BridgeExit::UpstreamClosed | BridgeExit::UpstreamFailed(_) | BridgeExit::Stalled
        )
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeReport {
    pub exit: BridgeExit,
    pub audio_chunks_forwarded: u64,
    pub responses_completed: u64,
}

/// A single browser ↔ realtime service session.
pub struct SessionBridge<U, D> {
    session_id: String,
    upstream: U,
    downstream: D,
    cancel: CancellationToken,
    response_timeout: Duration,
    response_deadline: Duration,
    state: BufferState,
    closed: bool,
    audio_chunks_forwarded: u64,
    responses_completed: u64,
}

/// Run one upstream call, giving up as soon as the session is cancelled.
async fn guarded<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = UpstreamResult<T>>,
) -> Result<T, BridgeExit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BridgeExit::Cancelled),
        result = call => result.map_err(|e| BridgeExit::UpstreamFailed(e.to_string())),
    }
}

impl<U, D> SessionBridge<U, D>
where
    U: UpstreamSession,
    D: Downstream,
{
    pub fn new(
        session_id: String,
        upstream: U,
        downstream: D,
        cancel: CancellationToken,
        response_timeout: Duration,
        response_deadline: Duration,
    ) -> Self {
        Self {
            session_id,
            upstream,
            downstream,
            cancel,
            response_timeout,
            response_deadline,
            state: BufferState::Idle,
            closed: false,
            audio_chunks_forwarded: 0,
            responses_completed: 0,
        }
    }

    /// Drive the session until either side ends it, then release both
    /// connections.
    pub async fn run(mut self) -> BridgeReport {
        info!(session_id = %self.session_id, "Bridge session started");
        self.downstream.send(OutboundUnit::status(CONNECTED_MESSAGE));

        let exit = loop {
            let unit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break BridgeExit::Cancelled,
                unit = self.downstream.receive() => unit,
            };

            let Some(unit) = unit else {
                break BridgeExit::ClientDisconnected;
            };

            if let Err(exit) = self.handle_unit(unit).await {
                break exit;
            }
        };

        self.shutdown(&exit).await;

        info!(
            session_id = %self.session_id,
            exit = ?exit,
            audio_chunks = self.audio_chunks_forwarded,
            responses = self.responses_completed,
            "Bridge session ended"
        );

        BridgeReport {
            exit,
            audio_chunks_forwarded: self.audio_chunks_forwarded,
            responses_completed: self.responses_completed,
        }
    }

    async fn handle_unit(&mut self, unit: InboundUnit) -> Result<(), BridgeExit> {
        match unit {
            InboundUnit::AudioChunk(chunk) => {
                trace!(session_id = %self.session_id, bytes = chunk.len(), state = ?self.state, "Forwarding audio chunk");
                guarded(&self.cancel, self.upstream.append_audio(&chunk)).await?;
                self.audio_chunks_forwarded += 1;
            }
            InboundUnit::Control(ControlMessage::Start) => {
                debug!(session_id = %self.session_id, "start: clearing input buffer");
                guarded(&self.cancel, self.upstream.clear_input_buffer()).await?;
                self.state = BufferState::Recording;
            }
            InboundUnit::Control(ControlMessage::Stop) => {
                if self.state == BufferState::Idle {
                    // Committing whatever the service holds is still a valid request
                    debug!(session_id = %self.session_id, "stop without start");
                }
                guarded(&self.cancel, self.upstream.commit_input_buffer()).await?;
                guarded(&self.cancel, self.upstream.create_response()).await?;
                self.stream_response().await?;
                self.state = BufferState::Idle;
            }
        }

        Ok(())
    }

    /// Relay upstream events until the response completes.
    ///
    /// Each event must arrive within `response_timeout`, and the whole cycle
    /// must finish within `response_deadline` however busy the service is.
    async fn stream_response(&mut self) -> Result<(), BridgeExit> {
        debug!(session_id = %self.session_id, "Streaming response");

        let deadline = tokio::time::sleep_until(tokio::time::Instant::now() + self.response_deadline);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BridgeExit::Cancelled),
                _ = &mut deadline => {
                    warn!(session_id = %self.session_id, deadline_secs = self.response_deadline.as_secs(), "Response exceeded deadline");
                    return Err(BridgeExit::Stalled);
                }
                next = tokio::time::timeout(self.response_timeout, self.upstream.next_event()) => next,
            };

            let event = match next {
                Err(_elapsed) => {
                    warn!(session_id = %self.session_id, timeout_secs = self.response_timeout.as_secs(), "Response stalled");
                    return Err(BridgeExit::Stalled);
                }
                Ok(Err(err)) => return Err(BridgeExit::UpstreamFailed(err.to_string())),
                Ok(Ok(None)) => return Err(BridgeExit::UpstreamClosed),
                Ok(Ok(Some(event))) => event,
            };

            match event {
                UpstreamEvent::TextDelta(delta) => {
                    self.downstream.send(OutboundUnit::TextDelta { delta });
                }
                UpstreamEvent::AudioDelta(audio) => {
                    self.downstream.send(OutboundUnit::AudioDelta(audio));
                }
                UpstreamEvent::ResponseCompleted => {
                    self.downstream.send(OutboundUnit::Done);
                    self.responses_completed += 1;
                    debug!(session_id = %self.session_id, "Response completed");
                    return Ok(());
                }
                UpstreamEvent::ServiceError { code, message } => {
                    warn!(session_id = %self.session_id, code = %code, "Realtime service error: {}", message);
                    self.downstream
                        .send(OutboundUnit::status(format!("Service error ({}): {}", code, message)));
                }
                UpstreamEvent::Other(kind) => {
                    trace!(session_id = %self.session_id, kind = %kind, "Ignoring upstream event");
                }
            }
        }
    }

    async fn shutdown(&mut self, exit: &BridgeExit) {
        if self.closed {
            return;
        }
        self.closed = true;

        if exit.client_reachable() {
            if let Some(message) = exit.status_message() {
                self.downstream.send(OutboundUnit::status(message));
            }
        }

        if tokio::time::timeout(UPSTREAM_CLOSE_TIMEOUT, self.upstream.close())
            .await
            .is_err()
        {
            warn!(session_id = %self.session_id, "Upstream close timed out");
        }

        if exit.client_reachable() {
            self.downstream.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::UpstreamError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Append(Vec<u8>),
        Clear,
        Commit,
        CreateResponse,
        Close,
    }

    /// Scripted upstream: records every call, replays queued events.
    struct FakeUpstream {
        calls: Arc<Mutex<Vec<Call>>>,
        events: mpsc::UnboundedReceiver<UpstreamResult<UpstreamEvent>>,
        fail_create_response: bool,
        fail_append: bool,
    }

    #[async_trait]
    impl UpstreamSession for FakeUpstream {
        async fn append_audio(&mut self, audio: &[u8]) -> UpstreamResult<()> {
            self.calls.lock().unwrap().push(Call::Append(audio.to_vec()));
            if self.fail_append {
                return Err(UpstreamError::Protocol("connection reset".to_string()));
            }
            Ok(())
        }

        async fn clear_input_buffer(&mut self) -> UpstreamResult<()> {
            self.calls.lock().unwrap().push(Call::Clear);
            Ok(())
        }

        async fn commit_input_buffer(&mut self) -> UpstreamResult<()> {
            self.calls.lock().unwrap().push(Call::Commit);
            Ok(())
        }

        async fn create_response(&mut self) -> UpstreamResult<()> {
            self.calls.lock().unwrap().push(Call::CreateResponse);
            if self.fail_create_response {
                return Err(UpstreamError::Protocol("socket reset".to_string()));
            }
            Ok(())
        }

        async fn next_event(&mut self) -> UpstreamResult<Option<UpstreamEvent>> {
            match self.events.recv().await {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.calls.lock().unwrap().push(Call::Close);
        }
    }

    struct FakeDownstream {
        inbound: mpsc::UnboundedReceiver<InboundUnit>,
        outbound: mpsc::UnboundedSender<OutboundUnit>,
        closed: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Downstream for FakeDownstream {
        async fn receive(&mut self) -> Option<InboundUnit> {
            self.inbound.recv().await
        }

        fn send(&mut self, unit: OutboundUnit) {
            let _ = self.outbound.send(unit);
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct Harness {
        calls: Arc<Mutex<Vec<Call>>>,
        events: mpsc::UnboundedSender<UpstreamResult<UpstreamEvent>>,
        inbound: mpsc::UnboundedSender<InboundUnit>,
        outbound: mpsc::UnboundedReceiver<OutboundUnit>,
        downstream_closed: Arc<Mutex<bool>>,
        cancel: CancellationToken,
        bridge: Option<SessionBridge<FakeUpstream, FakeDownstream>>,
    }

    impl Harness {
        fn new(response_timeout: Duration) -> Self {
            Self::with_limits(response_timeout, Duration::from_secs(60))
        }

        fn with_limits(response_timeout: Duration, response_deadline: Duration) -> Self {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let downstream_closed = Arc::new(Mutex::new(false));
            let cancel = CancellationToken::new();

            let upstream = FakeUpstream {
                calls: calls.clone(),
                events: events_rx,
                fail_create_response: false,
                fail_append: false,
            };
            let downstream = FakeDownstream {
                inbound: inbound_rx,
                outbound: outbound_tx,
                closed: downstream_closed.clone(),
            };

            Self {
                calls,
                events: events_tx,
                inbound: inbound_tx,
                outbound: outbound_rx,
                downstream_closed,
                cancel: cancel.clone(),
                bridge: Some(SessionBridge::new(
                    "test-session".to_string(),
                    upstream,
                    downstream,
                    cancel,
                    response_timeout,
                    response_deadline,
                )),
            }
        }

        fn with_default_timeout() -> Self {
            Self::new(Duration::from_secs(5))
        }

        fn send(&self, unit: InboundUnit) {
            self.inbound.send(unit).unwrap();
        }

        fn emit(&self, event: UpstreamEvent) {
            self.events.send(Ok(event)).unwrap();
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn drain_outbound(&mut self) -> Vec<OutboundUnit> {
            let mut units = Vec::new();
            while let Ok(unit) = self.outbound.try_recv() {
                units.push(unit);
            }
            units
        }

        /// Close the browser side and run the bridge to completion.
        async fn finish(&mut self) -> BridgeReport {
            let (closed_tx, _) = mpsc::unbounded_channel();
            self.inbound = closed_tx;
            self.bridge.take().unwrap().run().await
        }
    }

    fn start() -> InboundUnit {
        InboundUnit::Control(ControlMessage::Start)
    }

    fn stop() -> InboundUnit {
        InboundUnit::Control(ControlMessage::Stop)
    }

    fn chunk(bytes: &[u8]) -> InboundUnit {
        InboundUnit::AudioChunk(bytes.to_vec())
    }

    fn connected() -> OutboundUnit {
        OutboundUnit::status(CONNECTED_MESSAGE)
    }

    #[test]
    fn test_new_session_starts_idle() {
        let harness = Harness::with_default_timeout();
        assert_eq!(harness.bridge.as_ref().unwrap().state, BufferState::Idle);
    }

    #[tokio::test]
    async fn test_audio_chunks_forwarded_in_order_without_merging() {
        let mut harness = Harness::with_default_timeout();
        harness.send(chunk(&[1]));
        harness.send(start());
        harness.send(chunk(&[2, 3]));
        harness.send(chunk(&[]));
        harness.send(chunk(&[4, 5, 6]));

        let report = harness.finish().await;

        assert_eq!(report.exit, BridgeExit::ClientDisconnected);
        assert_eq!(report.audio_chunks_forwarded, 4);
        assert_eq!(
            harness.calls(),
            vec![
                Call::Append(vec![1]),
                Call::Clear,
                Call::Append(vec![2, 3]),
                Call::Append(vec![]),
                Call::Append(vec![4, 5, 6]),
                Call::Close,
            ]
        );
        assert_eq!(harness.drain_outbound(), vec![connected()]);
    }

    #[tokio::test]
    async fn test_deltas_relayed_in_upstream_order() {
        let mut harness = Harness::with_default_timeout();
        harness.emit(UpstreamEvent::TextDelta("Hel".to_string()));
        harness.emit(UpstreamEvent::TextDelta("lo".to_string()));
        harness.emit(UpstreamEvent::AudioDelta(vec![9, 8, 7]));
        harness.emit(UpstreamEvent::ResponseCompleted);
        harness.send(start());
        harness.send(stop());

        let report = harness.finish().await;

        assert_eq!(report.responses_completed, 1);
        assert_eq!(
            harness.drain_outbound(),
            vec![
                connected(),
                OutboundUnit::TextDelta { delta: "Hel".to_string() },
                OutboundUnit::TextDelta { delta: "lo".to_string() },
                OutboundUnit::AudioDelta(vec![9, 8, 7]),
                OutboundUnit::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_events_produce_no_output() {
        let mut harness = Harness::with_default_timeout();
        harness.emit(UpstreamEvent::Other("response.rate_limited".to_string()));
        harness.emit(UpstreamEvent::TextDelta("a".to_string()));
        harness.emit(UpstreamEvent::Other("response.output_item.added".to_string()));
        harness.emit(UpstreamEvent::Other("response.rate_limited".to_string()));
        harness.emit(UpstreamEvent::ResponseCompleted);
        harness.send(stop());

        let report = harness.finish().await;

        assert_eq!(report.exit, BridgeExit::ClientDisconnected);
        assert_eq!(
            harness.drain_outbound(),
            vec![
                connected(),
                OutboundUnit::TextDelta { delta: "a".to_string() },
                OutboundUnit::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_while_idle_commits_and_survives() {
        let mut harness = Harness::with_default_timeout();
        harness.emit(UpstreamEvent::ServiceError {
            code: "input_audio_buffer_commit_empty".to_string(),
            message: "buffer too small".to_string(),
        });
        harness.emit(UpstreamEvent::ResponseCompleted);
        harness.send(stop());
        harness.send(start());

        let report = harness.finish().await;

        assert_eq!(report.exit, BridgeExit::ClientDisconnected);
        assert_eq!(
            harness.calls(),
            vec![Call::Commit, Call::CreateResponse, Call::Clear, Call::Close]
        );
        let outbound = harness.drain_outbound();
        assert_eq!(outbound.len(), 3);
        assert!(matches!(&outbound[1], OutboundUnit::Status { message } if message.contains("input_audio_buffer_commit_empty")));
        assert_eq!(outbound[2], OutboundUnit::Done);
    }

    #[tokio::test]
    async fn test_one_response_per_stop_and_one_done_per_cycle() {
        let mut harness = Harness::with_default_timeout();
        for cycle in 0..3u8 {
            harness.send(start());
            harness.send(chunk(&[cycle]));
            harness.send(stop());
            harness.emit(UpstreamEvent::TextDelta(format!("reply {}", cycle)));
            harness.emit(UpstreamEvent::ResponseCompleted);
        }

        let report = harness.finish().await;

        assert_eq!(report.responses_completed, 3);
        let calls = harness.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::CreateResponse).count(), 3);
        assert_eq!(calls.iter().filter(|c| **c == Call::Commit).count(), 3);
        let outbound = harness.drain_outbound();
        assert_eq!(outbound.iter().filter(|u| **u == OutboundUnit::Done).count(), 3);
    }

    #[tokio::test]
    async fn test_stop_during_streaming_is_queued_until_done() {
        let mut harness = Harness::with_default_timeout();
        harness.send(start());
        harness.send(stop());
        harness.send(stop());
        harness.emit(UpstreamEvent::TextDelta("first".to_string()));
        harness.emit(UpstreamEvent::ResponseCompleted);
        harness.emit(UpstreamEvent::TextDelta("second".to_string()));
        harness.emit(UpstreamEvent::ResponseCompleted);

        let report = harness.finish().await;

        assert_eq!(report.responses_completed, 2);
        assert_eq!(
            harness.calls(),
            vec![
                Call::Clear,
                Call::Commit,
                Call::CreateResponse,
                Call::Commit,
                Call::CreateResponse,
                Call::Close,
            ]
        );
        assert_eq!(
            harness.drain_outbound(),
            vec![
                connected(),
                OutboundUnit::TextDelta { delta: "first".to_string() },
                OutboundUnit::Done,
                OutboundUnit::TextDelta { delta: "second".to_string() },
                OutboundUnit::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_end_to_end_cycle_returns_to_idle() {
        let mut harness = Harness::with_default_timeout();
        let bridge = harness.bridge.take().unwrap();
        let task = tokio::spawn(bridge.run());

        assert_eq!(harness.outbound.recv().await, Some(connected()));

        harness.send(start());
        for i in 0..3u8 {
            harness.send(chunk(&[i, i, i]));
        }
        harness.send(stop());
        harness.emit(UpstreamEvent::TextDelta("Hello".to_string()));
        harness.emit(UpstreamEvent::TextDelta(" there".to_string()));
        harness.emit(UpstreamEvent::ResponseCompleted);

        assert_eq!(
            harness.outbound.recv().await,
            Some(OutboundUnit::TextDelta { delta: "Hello".to_string() })
        );
        assert_eq!(
            harness.outbound.recv().await,
            Some(OutboundUnit::TextDelta { delta: " there".to_string() })
        );
        assert_eq!(harness.outbound.recv().await, Some(OutboundUnit::Done));

        // Ready for the next utterance
        harness.send(start());
        harness.send(chunk(&[42]));

        let (closed_tx, _) = mpsc::unbounded_channel();
        harness.inbound = closed_tx;
        let report = task.await.unwrap();

        assert_eq!(report.exit, BridgeExit::ClientDisconnected);
        assert_eq!(report.audio_chunks_forwarded, 4);
        assert_eq!(
            harness.calls(),
            vec![
                Call::Clear,
                Call::Append(vec![0, 0, 0]),
                Call::Append(vec![1, 1, 1]),
                Call::Append(vec![2, 2, 2]),
                Call::Commit,
                Call::CreateResponse,
                Call::Clear,
                Call::Append(vec![42]),
                Call::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_while_streaming_closes_upstream() {
        let mut harness = Harness::with_default_timeout();
        let bridge = harness.bridge.take().unwrap();
        let task = tokio::spawn(bridge.run());

        harness.send(start());
        harness.send(stop());
        harness.emit(UpstreamEvent::TextDelta("partial".to_string()));

        assert_eq!(harness.outbound.recv().await, Some(connected()));
        assert_eq!(
            harness.outbound.recv().await,
            Some(OutboundUnit::TextDelta { delta: "partial".to_string() })
        );

        // Browser goes away while the response is still streaming
        harness.cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("bridge did not stop after cancellation")
            .unwrap();

        assert_eq!(report.exit, BridgeExit::Cancelled);
        assert_eq!(harness.calls().last(), Some(&Call::Close));
        assert!(harness.drain_outbound().is_empty());
        assert!(!*harness.downstream_closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_upstream_failure_sends_terminal_status() {
        let mut harness = Harness::with_default_timeout();
        harness.send(stop());
        harness.events
            .send(Err(UpstreamError::Protocol("Invalid audio delta".to_string())))
            .unwrap();
        let report = harness.bridge.take().unwrap().run().await;

        assert!(matches!(report.exit, BridgeExit::UpstreamFailed(_)));
        assert!(report.exit.is_upstream_failure());
        let outbound = harness.drain_outbound();
        assert_eq!(outbound.len(), 2);
        assert!(matches!(&outbound[1], OutboundUnit::Status { message } if message.starts_with("Realtime service error")));
        assert!(*harness.downstream_closed.lock().unwrap());
        assert_eq!(harness.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_failed_upstream_call_ends_session() {
        let mut harness = Harness::with_default_timeout();
        if let Some(bridge) = harness.bridge.as_mut() {
            bridge.upstream.fail_create_response = true;
        }
        harness.send(start());
        harness.send(stop());
        harness.send(start());

        let report = harness.bridge.take().unwrap().run().await;

        assert!(matches!(report.exit, BridgeExit::UpstreamFailed(ref reason) if reason.contains("socket reset")));
        // The queued start is never processed
        assert_eq!(
            harness.calls(),
            vec![Call::Clear, Call::Commit, Call::CreateResponse, Call::Close]
        );
    }

    #[tokio::test]
    async fn test_upstream_closing_mid_response_ends_session() {
        let mut harness = Harness::with_default_timeout();
        harness.send(stop());
        harness.emit(UpstreamEvent::TextDelta("cut".to_string()));
        let (closed_events, _) = mpsc::unbounded_channel();
        harness.events = closed_events;

        let report = harness.bridge.take().unwrap().run().await;

        assert_eq!(report.exit, BridgeExit::UpstreamClosed);
        let outbound = harness.drain_outbound();
        assert_eq!(outbound[1], OutboundUnit::TextDelta { delta: "cut".to_string() });
        assert!(matches!(&outbound[2], OutboundUnit::Status { .. }));
    }

    #[tokio::test]
    async fn test_stalled_response_ends_session() {
        let mut harness = Harness::new(Duration::from_millis(50));
        harness.send(start());
        harness.send(stop());

        let report = harness.bridge.take().unwrap().run().await;

        assert_eq!(report.exit, BridgeExit::Stalled);
        assert_eq!(report.responses_completed, 0);
        assert!(*harness.downstream_closed.lock().unwrap());
        assert_eq!(harness.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_busy_response_that_never_completes_hits_deadline() {
        let mut harness = Harness::with_limits(Duration::from_secs(5), Duration::from_millis(100));
        harness.send(start());
        harness.send(stop());

        // Keeps the per-event timeout satisfied without ever completing
        let events = harness.events.clone();
        let chatter = tokio::spawn(async move {
            loop {
                let event = UpstreamEvent::Other("rate_limits.updated".to_string());
                if events.send(Ok(event)).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let report = tokio::time::timeout(Duration::from_secs(2), harness.bridge.take().unwrap().run())
            .await
            .expect("deadline did not end the response");
        chatter.abort();

        assert_eq!(report.exit, BridgeExit::Stalled);
        assert_eq!(report.responses_completed, 0);
        assert!(*harness.downstream_closed.lock().unwrap());
        assert_eq!(harness.calls().last(), Some(&Call::Close));
    }

    #[tokio::test]
    async fn test_connection_lost_while_idle_is_detected_on_next_append() {
        let mut harness = Harness::with_default_timeout();
        // The service dropped the socket during a quiet stretch
        if let Some(bridge) = harness.bridge.as_mut() {
            bridge.upstream.fail_append = true;
        }
        harness.send(chunk(&[1, 2]));
        harness.send(start());

        let report = harness.bridge.take().unwrap().run().await;

        assert!(matches!(report.exit, BridgeExit::UpstreamFailed(ref reason) if reason.contains("connection reset")));
        assert_eq!(report.audio_chunks_forwarded, 0);
        assert_eq!(harness.calls(), vec![Call::Append(vec![1, 2]), Call::Close]);

        let outbound = harness.drain_outbound();
        assert_eq!(outbound[0], connected());
        assert!(matches!(&outbound[1], OutboundUnit::Status { .. }));
        assert!(*harness.downstream_closed.lock().unwrap());
    }
}
