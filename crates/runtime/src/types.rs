//! Host-side request/response descriptors crossing the sandbox boundary.
//!
//! Plain data, not `WireValue` — unlike bindings, fetch dispatch always
//! carries a full HTTP-shaped payload, so a dedicated struct reads better
//! than a tagged value.

/// The inbound HTTP-shaped request handed to a worker's fetch handler.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub cf: CfStub,
}

impl FetchRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            cf: CfStub::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Stub `request.cf` locality fields — this is a local emulator, not a
/// real edge network, so every request looks like it arrived at one place.
#[derive(Debug, Clone)]
pub struct CfStub {
    pub colo: String,
    pub country: String,
    pub city: String,
    pub timezone: String,
}

impl Default for CfStub {
    fn default() -> Self {
        Self {
            colo: "LOCAL".to_string(),
            country: "XX".to_string(),
            city: "Local".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// The HTTP-shaped response a worker's fetch handler resolved to.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One message handed to a queue consumer's batch handler.
#[derive(Debug, Clone)]
pub struct QueueMessageInit {
    pub id: String,
    pub body: Vec<u8>,
    pub timestamp_millis: i64,
    pub attempts: u32,
}

/// A batch of due messages dispatched to `addEventListener('queue', ...)`.
#[derive(Debug, Clone)]
pub struct QueueBatchInit {
    pub queue_name: String,
    pub messages: Vec<QueueMessageInit>,
}

/// Per-message outcomes the batch handler reported back, collected even if
/// the handler itself threw partway through (see `__dispatchQueue`).
#[derive(Debug, Clone, Default)]
pub struct QueueBatchResult {
    pub acked: Vec<String>,
    pub retried: Vec<(String, i64)>,
    /// `Some(message)` if the handler threw; every message not already
    /// acked or explicitly retried should be retried by the caller too.
    pub threw: Option<String>,
}
