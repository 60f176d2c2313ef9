//! In-memory transport pair for harnesses and tests.
//!
//! Both halves speak the real envelope format so tests exercise the same
//! encode/decode path as the network transports.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};

use super::{
    Transport, TransportError, TransportId, TransportKind, TransportMessage, decode_message,
    encode_message, next_transport_id,
};

pub struct MockTransport {
    id: TransportId,
    outbound_seq: AtomicU64,
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

pub struct TransportPair {
    pub client: MockTransport,
    pub server: MockTransport,
}

impl TransportPair {
    pub fn new() -> Self {
        let (client_tx, server_rx) = unbounded();
        let (server_tx, client_rx) = unbounded();
        Self {
            client: MockTransport::new(client_tx, client_rx),
            server: MockTransport::new(server_tx, server_rx),
        }
    }
}

impl Default for TransportPair {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            id: next_transport_id(),
            outbound_seq: AtomicU64::new(0),
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ipc
    }

    fn id(&self) -> TransportId {
        self.id
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        self.tx
            .send(encode_message(&message))
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn recv(&self, timeout: Duration) -> Result<TransportMessage, TransportError> {
        let receiver = self.rx.lock().expect("mock transport receiver poisoned");
        match receiver.recv_timeout(timeout) {
            Ok(bytes) => Ok(decode_message(&bytes)?),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ChannelClosed),
        }
    }

    fn try_recv(&self) -> Result<Option<TransportMessage>, TransportError> {
        let receiver = self.rx.lock().expect("mock transport receiver poisoned");
        match receiver.try_recv() {
            Ok(bytes) => Ok(Some(decode_message(&bytes)?)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::ChannelClosed),
        }
    }

    fn send_text(&self, text: &str) -> Result<u64, TransportError> {
        let sequence = self.outbound_seq.fetch_add(1, Ordering::Relaxed);
        self.send(TransportMessage::text(sequence, text))?;
        Ok(sequence)
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<u64, TransportError> {
        let sequence = self.outbound_seq.fetch_add(1, Ordering::Relaxed);
        self.send(TransportMessage::binary(sequence, bytes.to_vec()))?;
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_round_trips_both_directions() {
        let pair = TransportPair::new();
        let seq_a = pair.client.send_text("from client").expect("send");
        let seq_b = pair.server.send_bytes(&[1, 2, 3]).expect("send");

        let at_server = pair.server.recv(Duration::from_secs(1)).expect("recv");
        assert_eq!(at_server.sequence, seq_a);
        assert_eq!(at_server.payload.as_text(), Some("from client"));

        let at_client = pair.client.recv(Duration::from_secs(1)).expect("recv");
        assert_eq!(at_client.sequence, seq_b);
        assert_eq!(at_client.payload.as_binary(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn outbound_sequence_is_monotonic() {
        let pair = TransportPair::new();
        let first = pair.client.send_text("a").expect("send");
        let second = pair.client.send_text("b").expect("send");
        let third = pair.client.send_bytes(b"c").expect("send");
        assert!(first < second && second < third);
    }

    #[test]
    fn dropped_peer_surfaces_channel_closed() {
        let pair = TransportPair::new();
        let client = pair.client;
        drop(pair.server);
        assert!(matches!(
            client.recv(Duration::from_millis(10)),
            Err(TransportError::ChannelClosed)
        ));
    }
}
