//! Duplex transport abstraction and the binary message envelope.
//!
//! Every message on the wire is `[kind:u8][sequence:u64][length:u32][bytes]`
//! where kind 0 is UTF-8 text and kind 1 is an opaque binary payload.
//! Outbound sequence numbers count up per transport; inbound sequences are
//! surfaced exactly as received.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

pub mod mock;
pub mod secure;
pub mod webrtc;

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;
const ENVELOPE_HEADER_LEN: usize = 1 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_transport_id() -> TransportId {
    TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    Ipc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            Payload::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub sequence: u64,
    pub payload: Payload,
}

impl TransportMessage {
    pub fn text(sequence: u64, text: impl Into<String>) -> Self {
        Self {
            sequence,
            payload: Payload::Text(text.into()),
        }
    }

    pub fn binary(sequence: u64, bytes: Vec<u8>) -> Self {
        Self {
            sequence,
            payload: Payload::Binary(bytes),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope truncated")]
    Truncated,
    #[error("unknown payload kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("declared length {declared} exceeds remaining {available} bytes")]
    Length { declared: usize, available: usize },
    #[error("{0} bytes after envelope payload")]
    TrailingBytes(usize),
    #[error("text payload is not valid utf-8")]
    InvalidUtf8,
}

pub fn encode_message(message: &TransportMessage) -> Vec<u8> {
    let (kind, bytes): (u8, &[u8]) = match &message.payload {
        Payload::Text(text) => (KIND_TEXT, text.as_bytes()),
        Payload::Binary(bytes) => (KIND_BINARY, bytes),
    };
    let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + bytes.len());
    buf.push(kind);
    buf.extend_from_slice(&message.sequence.to_be_bytes());
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

pub fn decode_message(bytes: &[u8]) -> Result<TransportMessage, EnvelopeError> {
    if bytes.len() < ENVELOPE_HEADER_LEN {
        return Err(EnvelopeError::Truncated);
    }
    let kind = bytes[0];
    let sequence = u64::from_be_bytes(bytes[1..9].try_into().expect("8 bytes"));
    let length = u32::from_be_bytes(bytes[9..13].try_into().expect("4 bytes")) as usize;
    let body = &bytes[ENVELOPE_HEADER_LEN..];
    if length > body.len() {
        return Err(EnvelopeError::Length {
            declared: length,
            available: body.len(),
        });
    }
    if body.len() > length {
        return Err(EnvelopeError::TrailingBytes(body.len() - length));
    }
    let payload = match kind {
        KIND_TEXT => Payload::Text(
            String::from_utf8(body.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)?,
        ),
        KIND_BINARY => Payload::Binary(body.to_vec()),
        other => return Err(EnvelopeError::UnknownKind(other)),
    };
    Ok(TransportMessage { sequence, payload })
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport receive timed out")]
    Timeout,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Secure(#[from] secure::SecureChannelError),
    #[error("transport setup failed: {0}")]
    Setup(String),
}

/// A duplex channel carrying enveloped text and binary messages.
///
/// Implementations are synchronous from the caller's perspective; async
/// internals (the WebRTC data channel) pump into a queue drained by `recv`.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn id(&self) -> TransportId;
    fn send(&self, message: TransportMessage) -> Result<(), TransportError>;
    fn recv(&self, timeout: Duration) -> Result<TransportMessage, TransportError>;
    fn try_recv(&self) -> Result<Option<TransportMessage>, TransportError>;

    /// Bytes queued but not yet handed to the network. Used for backpressure;
    /// transports that cannot report it return zero.
    fn buffered_amount(&self) -> u64 {
        0
    }

    fn send_text(&self, text: &str) -> Result<u64, TransportError>;
    fn send_bytes(&self, bytes: &[u8]) -> Result<u64, TransportError>;
}

/// Cooperative cancellation shared by the negotiator and the orchestrator.
///
/// Long-running operations `select!` on [`CancelToken::cancelled`]; firing the
/// token makes every holder unwind through its cleanup path.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}
