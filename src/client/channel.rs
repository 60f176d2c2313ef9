//! Framed terminal transport: envelopes in, typed frames out.
//!
//! Inbound binary envelopes decode to host frames; a decode failure is fatal
//! for the session, so it surfaces as an error rather than being skipped.
//! Text payloads carry lifecycle sentinels (`__ready__`, `__offer_ready__`),
//! which are swallowed, and `beach:status:` messages, which surface as typed
//! status events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::ClientError;
use crate::protocol::{ClientFrame, HostFrame, decode_host_frame, encode_client_frame};
use crate::transport::{Transport, TransportError};

pub const READY_SENTINEL: &str = "__ready__";
pub const OFFER_READY_SENTINEL: &str = "__offer_ready__";
pub const STATUS_PREFIX: &str = "beach:status:";

#[derive(Debug, Clone, PartialEq)]
pub enum FramedEvent {
    Frame(HostFrame),
    Status(String),
}

pub struct FramedTransport {
    transport: Arc<dyn Transport>,
    ready_sent: AtomicBool,
}

impl FramedTransport {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            ready_sent: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn buffered_amount(&self) -> u64 {
        self.transport.buffered_amount()
    }

    /// Announces readiness for authoritative snapshots. Sent at most once no
    /// matter how often it is called.
    pub fn announce_ready(&self) -> Result<(), TransportError> {
        if self.ready_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.send_text(READY_SENTINEL)?;
        tracing::debug!(target = "client::channel", "readiness sentinel sent");
        Ok(())
    }

    pub fn send_frame(&self, frame: &ClientFrame) -> Result<u64, TransportError> {
        let bytes = encode_client_frame(frame);
        self.transport.send_bytes(&bytes)
    }

    /// Receives the next event. `Ok(None)` means the timeout elapsed or an
    /// ignorable text payload was consumed.
    pub fn recv(&self, timeout: Duration) -> Result<Option<FramedEvent>, ClientError> {
        let message = match self.transport.recv(timeout) {
            Ok(message) => message,
            Err(TransportError::Timeout) => return Ok(None),
            Err(err) => return Err(ClientError::Transport(err)),
        };
        match message.payload {
            crate::transport::Payload::Binary(bytes) => {
                let frame = decode_host_frame(&bytes)?;
                Ok(Some(FramedEvent::Frame(frame)))
            }
            crate::transport::Payload::Text(text) => {
                let trimmed = text.trim();
                if trimmed == READY_SENTINEL || trimmed == OFFER_READY_SENTINEL {
                    tracing::trace!(
                        target = "client::channel",
                        payload = trimmed,
                        "ignoring handshake sentinel"
                    );
                    return Ok(None);
                }
                if let Some(status) = trimmed.strip_prefix(STATUS_PREFIX) {
                    return Ok(Some(FramedEvent::Status(status.to_string())));
                }
                tracing::debug!(
                    target = "client::channel",
                    payload = %trimmed,
                    "unexpected text payload"
                );
                Ok(None)
            }
        }
    }
}
