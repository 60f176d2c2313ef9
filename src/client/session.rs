//! Top-level session lifecycle.
//!
//! `Idle → Connecting → Connected → (Error | Closed)`. Connecting covers
//! signaling, negotiation, and binding the framed transport; `Connected` is
//! reached only once the host's `hello` has been processed. The caller
//! drives the session with [`TerminalSession::process`] from its own loop
//! (all state lives on that one thread) and reads the grid through
//! [`TerminalSession::grid`] or snapshots.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::event::KeyEvent;

use super::backfill::BackfillController;
use super::channel::{FramedEvent, FramedTransport};
use super::grid::{GridSnapshot, GridStore};
use super::input::encode_key_event;
use super::ClientError;
use crate::config::ClientConfig;
use crate::protocol::{ClientFrame, HostFrame, Seq, SyncConfig};
use crate::telemetry::{self, TelemetrySink};
use crate::transport::webrtc::signaling::SignalingClient;
use crate::transport::webrtc::{self, NegotiationError, SecureTransportSummary};
use crate::transport::{CancelToken, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    GridUpdated,
    Status(String),
    InputAcked(Seq),
    Heartbeat { timestamp_ms: u64 },
}

pub struct TerminalSession {
    config: ClientConfig,
    channel: FramedTransport,
    store: GridStore,
    backfill: BackfillController,
    state: SessionState,
    telemetry: Arc<dyn TelemetrySink>,
    summary: Option<SecureTransportSummary>,
    // Owned exclusively here; dropping it tears the signaling socket down.
    signaling: Option<Arc<SignalingClient>>,
    subscription: Option<u64>,
    sync_config: Option<SyncConfig>,
    last_seq: Seq,
    input_seq: Seq,
    last_acked_input: Option<Seq>,
    last_heartbeat_ms: Option<u64>,
    pending_resize: Option<(u32, u32)>,
    last_resize_at: Option<Instant>,
    deferred: VecDeque<ClientFrame>,
    events: Vec<SessionEvent>,
}

impl TerminalSession {
    /// Full bring-up: broker join, WebRTC negotiation, framed transport.
    /// The returned session is `Connecting` until the host's `hello` lands.
    pub async fn connect(
        config: ClientConfig,
        cancel: CancelToken,
    ) -> Result<Self, NegotiationError> {
        let signaling = SignalingClient::connect(&config).await?;
        let connection = webrtc::connect(&config, signaling.clone(), cancel).await?;
        let mut session = Self::over_transport(connection.transport, config);
        session.summary = Some(connection.summary);
        session.signaling = Some(signaling);
        Ok(session)
    }

    /// Binds the session to an already-open transport. This is the seam test
    /// harnesses and alternate bring-up paths use.
    pub fn over_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let channel = FramedTransport::new(transport);
        if let Err(err) = channel.announce_ready() {
            tracing::warn!(target = "client::session", error = %err, "readiness sentinel failed");
        }
        let backfill = BackfillController::new(&config);
        Self {
            config,
            channel,
            store: GridStore::new(),
            backfill,
            state: SessionState::Connecting,
            telemetry: telemetry::noop(),
            summary: None,
            signaling: None,
            subscription: None,
            sync_config: None,
            last_seq: 0,
            input_seq: 0,
            last_acked_input: None,
            last_heartbeat_ms: None,
            pending_resize: None,
            last_resize_at: None,
            deferred: VecDeque::new(),
            events: Vec::new(),
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn secure_summary(&self) -> Option<&SecureTransportSummary> {
        self.summary.as_ref()
    }

    pub fn grid(&self) -> &GridStore {
        &self.store
    }

    pub fn snapshot(&self) -> GridSnapshot {
        self.store.snapshot()
    }

    pub fn subscription(&self) -> Option<u64> {
        self.subscription
    }

    pub fn sync_config(&self) -> Option<&SyncConfig> {
        self.sync_config.as_ref()
    }

    pub fn last_heartbeat_ms(&self) -> Option<u64> {
        self.last_heartbeat_ms
    }

    /// Highest sequence the host has guaranteed to have emitted.
    pub fn watermark(&self) -> Seq {
        self.last_seq
    }

    pub fn last_acked_input(&self) -> Option<Seq> {
        self.last_acked_input
    }

    /// Drives one pump iteration: flushes due resize/deferred frames, waits
    /// up to `timeout` for a transport event, applies it, and schedules
    /// backfill. Fatal errors transition the session before surfacing.
    pub fn process(&mut self, timeout: Duration) -> Result<Vec<SessionEvent>, ClientError> {
        if matches!(self.state, SessionState::Closed | SessionState::Error { .. }) {
            return Ok(std::mem::take(&mut self.events));
        }
        let result = self.pump(timeout);
        match result {
            Ok(()) => Ok(std::mem::take(&mut self.events)),
            Err(ClientError::Shutdown) => {
                self.transition(SessionState::Closed);
                Ok(std::mem::take(&mut self.events))
            }
            Err(ClientError::Transport(TransportError::ChannelClosed)) => {
                // Channel loss without a protocol error closes, not errors.
                let next = if self.state == SessionState::Connected {
                    SessionState::Closed
                } else {
                    SessionState::Error {
                        reason: "transport closed during connect".into(),
                    }
                };
                self.transition(next);
                Ok(std::mem::take(&mut self.events))
            }
            Err(err) => {
                self.transition(SessionState::Error {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn pump(&mut self, timeout: Duration) -> Result<(), ClientError> {
        self.flush_resize()?;
        self.flush_deferred()?;

        if let Some(event) = self.channel.recv(timeout)? {
            match event {
                FramedEvent::Frame(frame) => {
                    let started = Instant::now();
                    self.handle_host_frame(frame)?;
                    self.telemetry
                        .record_duration("client_handle_frame", started.elapsed());
                }
                FramedEvent::Status(status) => {
                    self.events.push(SessionEvent::Status(status));
                }
            }
        }

        self.poll_backfill()?;
        Ok(())
    }

    fn handle_host_frame(&mut self, frame: HostFrame) -> Result<(), ClientError> {
        self.telemetry.record_count("client_host_frames", 1);
        match frame {
            HostFrame::Heartbeat { timestamp_ms, .. } => {
                self.last_heartbeat_ms = Some(timestamp_ms);
                self.events.push(SessionEvent::Heartbeat { timestamp_ms });
            }
            HostFrame::Hello {
                subscription,
                max_seq,
                config,
            } => {
                tracing::debug!(
                    target = "client::session",
                    subscription,
                    max_seq,
                    "hello received; resetting grid"
                );
                self.store.reset();
                self.backfill.reset();
                self.deferred.clear();
                self.subscription = Some(subscription);
                self.sync_config = Some(config);
                self.last_seq = self.last_seq.max(max_seq);
                if self.state == SessionState::Connecting {
                    self.transition(SessionState::Connected);
                }
            }
            HostFrame::Grid {
                viewport_rows,
                cols,
                history_rows,
                base_row,
            } => {
                self.require_hello("grid")?;
                self.store.set_base_row(base_row);
                self.store
                    .set_grid_size(history_rows.max(viewport_rows), cols);
                self.store.set_viewport(base_row, viewport_rows);
                self.events.push(SessionEvent::GridUpdated);
            }
            HostFrame::Snapshot {
                subscription,
                watermark,
                has_more,
                updates,
                ..
            } => {
                self.require_hello("snapshot")?;
                if !self.subscription_matches(subscription, "snapshot") {
                    return Ok(());
                }
                self.store.apply_updates(&updates, true);
                self.last_seq = self.last_seq.max(watermark);
                if !has_more {
                    self.store.set_follow_tail(true);
                }
                self.events.push(SessionEvent::GridUpdated);
            }
            HostFrame::SnapshotComplete { subscription, .. } => {
                self.require_hello("snapshot_complete")?;
                if self.subscription_matches(subscription, "snapshot_complete") {
                    self.store.set_follow_tail(true);
                }
            }
            HostFrame::Delta {
                subscription,
                watermark,
                updates,
                ..
            } => {
                self.require_hello("delta")?;
                if !self.subscription_matches(subscription, "delta") {
                    return Ok(());
                }
                self.store.apply_updates(&updates, false);
                self.last_seq = self.last_seq.max(watermark);
                self.events.push(SessionEvent::GridUpdated);
            }
            HostFrame::HistoryBackfill {
                subscription,
                request_id,
                start_row,
                count,
                updates,
                more,
            } => {
                self.require_hello("history_backfill")?;
                if !self.subscription_matches(subscription, "history_backfill") {
                    return Ok(());
                }
                self.store.apply_updates(&updates, true);
                let poll_now = self.backfill.on_history_backfill(
                    &mut self.store,
                    request_id,
                    start_row,
                    count,
                    more,
                    Instant::now(),
                );
                self.events.push(SessionEvent::GridUpdated);
                if poll_now {
                    self.poll_backfill()?;
                }
            }
            HostFrame::InputAck { seq } => {
                self.last_acked_input = Some(seq);
                self.events.push(SessionEvent::InputAcked(seq));
            }
            HostFrame::Shutdown => return Err(ClientError::Shutdown),
        }
        Ok(())
    }

    fn require_hello(&self, frame: &'static str) -> Result<(), ClientError> {
        if self.subscription.is_none() {
            return Err(ClientError::ProtocolViolation(frame));
        }
        Ok(())
    }

    fn subscription_matches(&self, subscription: u64, frame: &'static str) -> bool {
        if self.subscription == Some(subscription) {
            true
        } else {
            tracing::warn!(
                target = "client::session",
                frame,
                subscription,
                current = ?self.subscription,
                "frame for foreign subscription ignored"
            );
            false
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(target = "client::session", from = ?self.state, to = ?next, "session state");
            self.state = next.clone();
            self.events.push(SessionEvent::StateChanged(next));
        }
    }

    /// Encodes a key event and sends it as input. Returns the input sequence
    /// when the event produced bytes.
    pub fn send_key(&mut self, key: &KeyEvent) -> Result<Option<Seq>, ClientError> {
        match encode_key_event(key) {
            Some(bytes) => self.send_input(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Sends raw input bytes. Input bypasses backpressure deferral so typing
    /// stays responsive.
    pub fn send_input(&mut self, data: &[u8]) -> Result<Seq, ClientError> {
        self.input_seq += 1;
        let seq = self.input_seq;
        self.telemetry.record_bytes("client_input_bytes", data.len());
        self.channel.send_frame(&ClientFrame::Input {
            seq,
            data: data.to_vec(),
        })?;
        Ok(seq)
    }

    /// Records a renderer size change; the resize frame goes out at most
    /// once per debounce interval.
    pub fn request_resize(&mut self, cols: u32, rows: u32) {
        self.pending_resize = Some((cols, rows));
    }

    /// Moves the viewport. Pure with respect to rows; the backfill
    /// controller reacts on the next `process` call.
    pub fn set_viewport(&mut self, top: u64, height: u32) {
        self.store.set_viewport(top, height);
        let (clamped_top, _) = self.store.viewport();
        self.backfill.note_viewport(clamped_top, Instant::now());
    }

    pub fn set_follow_tail(&mut self, on: bool) {
        self.store.set_follow_tail(on);
    }

    /// Closes the session and frees the transport and signaling resources.
    pub fn close(&mut self) {
        if !matches!(self.state, SessionState::Closed | SessionState::Error { .. }) {
            self.transition(SessionState::Closed);
        }
        self.signaling = None;
    }

    fn flush_resize(&mut self) -> Result<(), ClientError> {
        let Some((cols, rows)) = self.pending_resize else {
            return Ok(());
        };
        if let Some(last) = self.last_resize_at {
            if last.elapsed() < self.config.resize_debounce {
                return Ok(());
            }
        }
        self.pending_resize = None;
        self.last_resize_at = Some(Instant::now());
        self.dispatch(ClientFrame::Resize { cols, rows })
    }

    fn poll_backfill(&mut self) -> Result<(), ClientError> {
        let Some(subscription) = self.subscription else {
            return Ok(());
        };
        let frames = self
            .backfill
            .poll(&mut self.store, subscription, Instant::now());
        for frame in frames {
            self.dispatch(frame)?;
        }
        Ok(())
    }

    /// Sends a non-input frame, deferring it while the transport is above
    /// the high watermark.
    fn dispatch(&mut self, frame: ClientFrame) -> Result<(), ClientError> {
        if self.channel.buffered_amount() > self.config.high_watermark_bytes {
            tracing::trace!(target = "client::session", "deferring frame under backpressure");
            self.deferred.push_back(frame);
            return Ok(());
        }
        self.channel.send_frame(&frame)?;
        Ok(())
    }

    fn flush_deferred(&mut self) -> Result<(), ClientError> {
        if self.deferred.is_empty()
            || self.channel.buffered_amount() >= self.config.low_watermark_bytes
        {
            return Ok(());
        }
        while let Some(frame) = self.deferred.pop_front() {
            self.channel.send_frame(&frame)?;
            if self.channel.buffered_amount() > self.config.high_watermark_bytes {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Lane, Update, decode_client_frame, encode_host_frame, pack_cell};
    use crate::transport::mock::{MockTransport, TransportPair};

    fn hello() -> HostFrame {
        HostFrame::Hello {
            subscription: 1,
            max_seq: 0,
            config: SyncConfig {
                snapshot_budgets: vec![],
                delta_budget: 512,
                heartbeat_ms: 250,
                initial_snapshot_lines: 24,
            },
        }
    }

    fn grid_frame() -> HostFrame {
        HostFrame::Grid {
            viewport_rows: 24,
            cols: 80,
            history_rows: 1000,
            base_row: 0,
        }
    }

    fn send(server: &MockTransport, frame: HostFrame) {
        server
            .send_bytes(&encode_host_frame(&frame))
            .expect("send frame");
    }

    fn session_pair() -> (TerminalSession, MockTransport) {
        let pair = TransportPair::new();
        let config = ClientConfig::new("http://broker/sessions/s", "s");
        let session = TerminalSession::over_transport(Arc::new(pair.client), config);
        (session, pair.server)
    }

    fn drain(session: &mut TerminalSession) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let batch = session
                .process(Duration::from_millis(10))
                .expect("process");
            if batch.is_empty() {
                return events;
            }
            events.extend(batch);
        }
    }

    #[test]
    fn session_connects_after_hello() {
        let (mut session, server) = session_pair();
        assert_eq!(*session.state(), SessionState::Connecting);

        send(&server, hello());
        let events = drain(&mut session);
        assert!(events.contains(&SessionEvent::StateChanged(SessionState::Connected)));
        assert_eq!(session.subscription(), Some(1));
    }

    #[test]
    fn ready_sentinel_announced_on_bind() {
        let (_session, server) = session_pair();
        let message = server.recv(Duration::from_millis(100)).expect("recv");
        assert_eq!(message.payload.as_text(), Some("__ready__"));
    }

    #[test]
    fn delta_before_hello_is_a_protocol_violation() {
        let (mut session, server) = session_pair();
        send(
            &server,
            HostFrame::Delta {
                subscription: 1,
                watermark: 1,
                has_more: false,
                updates: vec![],
            },
        );
        let err = session
            .process(Duration::from_millis(100))
            .expect_err("must fail");
        assert!(matches!(err, ClientError::ProtocolViolation("delta")));
        assert!(matches!(session.state(), SessionState::Error { .. }));
    }

    #[test]
    fn snapshot_flow_populates_grid_and_follows_tail() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        send(&server, grid_frame());
        send(
            &server,
            HostFrame::Snapshot {
                subscription: 1,
                lane: Lane::Foreground,
                watermark: 5,
                has_more: false,
                updates: vec![Update::Row {
                    row: 0,
                    seq: 1,
                    cells: "hi".chars().map(|ch| pack_cell(ch, 0)).collect(),
                }],
            },
        );
        send(
            &server,
            HostFrame::SnapshotComplete {
                subscription: 1,
                lane: Lane::Foreground,
            },
        );
        drain(&mut session);
        assert_eq!(*session.state(), SessionState::Connected);
        assert!(session.grid().follow_tail());
        assert_eq!(session.grid().row_text(0), Some("hi".to_string()));
    }

    #[test]
    fn shutdown_closes_the_session() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        send(&server, HostFrame::Shutdown);
        drain(&mut session);
        assert_eq!(*session.state(), SessionState::Closed);
    }

    #[test]
    fn channel_loss_while_connected_closes_without_error() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        drain(&mut session);
        assert_eq!(*session.state(), SessionState::Connected);

        drop(server);
        session.process(Duration::from_millis(10)).expect("process");
        assert_eq!(*session.state(), SessionState::Closed);
    }

    #[test]
    fn input_carries_monotonic_sequences() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        drain(&mut session);

        let first = session.send_input(b"ls\r").expect("send");
        let second = session.send_input(b"pwd\r").expect("send");
        assert!(second > first);

        // Skip the readiness sentinel, then check both frames.
        let _ready = server.recv(Duration::from_millis(100)).expect("recv");
        let message = server.recv(Duration::from_millis(100)).expect("recv");
        let frame =
            decode_client_frame(message.payload.as_binary().expect("binary")).expect("frame");
        let ClientFrame::Input { seq, data } = frame else {
            panic!("expected input frame");
        };
        assert_eq!(seq, first);
        assert_eq!(data, b"ls\r");
    }

    #[test]
    fn input_ack_is_observed_not_blocking() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        drain(&mut session);
        let seq = session.send_input(b"x").expect("send");
        send(&server, HostFrame::InputAck { seq });
        let events = drain(&mut session);
        assert!(events.contains(&SessionEvent::InputAcked(seq)));
        assert_eq!(session.last_acked_input(), Some(seq));
    }

    #[test]
    fn resize_is_debounced() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        drain(&mut session);
        let _ready = server.recv(Duration::from_millis(100)).expect("recv");

        session.request_resize(100, 30);
        session.process(Duration::from_millis(5)).expect("process");
        session.request_resize(101, 31);
        session.request_resize(102, 32);
        session.process(Duration::from_millis(5)).expect("process");

        // Only the first resize went out inside the debounce window.
        let message = server.recv(Duration::from_millis(100)).expect("recv");
        let frame =
            decode_client_frame(message.payload.as_binary().expect("binary")).expect("frame");
        assert_eq!(frame, ClientFrame::Resize { cols: 100, rows: 30 });
        assert!(matches!(
            server.recv(Duration::from_millis(30)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn status_text_surfaces_as_event() {
        let (mut session, server) = session_pair();
        send(&server, hello());
        server.send_text("beach:status:degraded").expect("send");
        let events = drain(&mut session);
        assert!(events.contains(&SessionEvent::Status("degraded".to_string())));
    }
}
