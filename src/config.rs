use std::time::Duration;

/// An ICE server entry handed to the peer connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Connection options recognized by the client core.
///
/// Every knob has the documented default; callers normally set only
/// `signaling_url`, `session_id`, and possibly `passphrase`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Broker base URL for the session, e.g. `https://broker.example/sessions/<id>`.
    pub signaling_url: String,
    /// Session identifier on the broker; also the salt of the session key.
    pub session_id: String,
    /// Enables sealed signaling and the Noise handshake when present.
    pub passphrase: Option<String>,
    /// Optional hint for peer resolution.
    pub preferred_peer_id: Option<String>,
    pub poll_interval: Duration,
    pub answer_flush_delay: Duration,
    pub resend_interval: Duration,
    pub max_resend_attempts: u32,
    pub join_timeout: Duration,
    pub sdp_poll_timeout: Duration,
    pub noise_timeout: Duration,
    pub data_channel_timeout: Duration,
    pub ice_servers: Vec<IceServer>,
    /// Maximum outstanding backfill requests.
    pub max_inflight: usize,
    /// Upper bound on rows covered by a single backfill request.
    pub max_backfill_rows: u32,
    pub request_debounce: Duration,
    /// Rows fetched ahead of the viewport in the scroll direction.
    /// `None` means "one viewport height".
    pub prefetch_ahead: Option<u32>,
    /// After this long without a reply, an inflight backfill is dropped and
    /// its rows become eligible for re-request.
    pub backfill_response_timeout: Duration,
    pub resize_debounce: Duration,
    /// Outbound buffering above which non-input frames are deferred.
    pub high_watermark_bytes: u64,
    /// Deferred frames drain once buffering falls below this.
    pub low_watermark_bytes: u64,
    /// Policy knob for a data channel that closes before opening. The default
    /// fails the negotiation; callers that want a retry drive it themselves.
    pub retry_data_channel: bool,
}

impl ClientConfig {
    pub fn new(signaling_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            session_id: session_id.into(),
            passphrase: None,
            preferred_peer_id: None,
            poll_interval: Duration::from_millis(500),
            answer_flush_delay: Duration::from_millis(400),
            resend_interval: Duration::from_millis(1200),
            max_resend_attempts: 3,
            join_timeout: Duration::from_secs(15),
            sdp_poll_timeout: Duration::from_secs(20),
            noise_timeout: Duration::from_secs(20),
            data_channel_timeout: Duration::from_secs(20),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            max_inflight: 2,
            max_backfill_rows: 512,
            request_debounce: Duration::from_millis(50),
            prefetch_ahead: None,
            backfill_response_timeout: Duration::from_secs(5),
            resize_debounce: Duration::from_millis(80),
            high_watermark_bytes: 256 * 1024,
            low_watermark_bytes: 64 * 1024,
            retry_data_channel: false,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn secure_signaling(&self) -> bool {
        self.passphrase
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }
}
