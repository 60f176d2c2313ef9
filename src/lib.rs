//! Client core for a broker-mediated terminal sharing session.
//!
//! The crate joins a session broker, negotiates a WebRTC data channel with the
//! host (optionally sealed-signaling plus a Noise handshake when a passphrase
//! is set), and maintains a scrollback-aware mirror of the host terminal grid.
//! Presentation is left entirely to the caller: the [`client::TerminalSession`]
//! exposes grid snapshots, typed events, and input/resize entry points, and any
//! duplex [`transport::Transport`] (including the in-memory pair in
//! [`transport::mock`]) can stand in for the network.

pub mod client;
pub mod config;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use config::ClientConfig;
