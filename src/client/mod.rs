pub mod backfill;
pub mod channel;
pub mod grid;
pub mod input;
pub mod session;

pub use channel::{FramedEvent, FramedTransport};
pub use grid::{GridSnapshot, GridStore, Row};
pub use session::{SessionEvent, SessionState, TerminalSession};

use crate::protocol::WireError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] WireError),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("host requested shutdown")]
    Shutdown,
}
