//! The seam between call control and the SIP user agent.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// Something the user agent observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// A new inbound INVITE.
    IncomingCall {
        call_id: String,
        from_number: String,
        display_name: Option<String>,
        sdp: Option<String>,
    },
    /// Provisional response to our INVITE; 183 usually carries early media.
    Progress {
        call_id: String,
        code: u16,
        sdp: Option<String>,
    },
    /// Our INVITE was answered (2xx, ACK sent).
    Answered { call_id: String, sdp: Option<String> },
    /// Final failure response to our INVITE.
    Failed {
        call_id: String,
        code: u16,
        reason: String,
    },
    /// Remote BYE, or CANCEL of an unanswered inbound call.
    RemoteHangup { call_id: String, reason: String },
    /// NOTIFY outcome for a REFER we sent.
    TransferResult { call_id: String, success: bool },
    /// The WebSocket went away.
    TransportLost { reason: String },
    /// A registration refresh was refused.
    RegistrationLost { reason: String },
}

/// Operations the call and connection layers need from a signaling stack.
///
/// Requests that open a transaction return once it is sent (INVITE) or once
/// its final response arrives (everything else). Asynchronous outcomes are
/// reported as [`SignalEvent`]s on the channel the transport was built with.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the WebSocket.
    async fn open(&self) -> Result<(), ConnectionError>;
    async fn register(&self) -> Result<(), ConnectionError>;
    async fn unregister(&self) -> Result<(), ConnectionError>;
    /// Close the socket; in-flight transactions fail with `Closed`.
    async fn close(&self);

    async fn invite(&self, call_id: &str, target: &str, sdp: &str) -> Result<(), ConnectionError>;
    async fn cancel(&self, call_id: &str) -> Result<(), ConnectionError>;
    /// Answer an inbound call with a 200 OK carrying `sdp`.
    async fn accept(&self, call_id: &str, sdp: &str) -> Result<(), ConnectionError>;
    async fn reject(&self, call_id: &str, code: u16) -> Result<(), ConnectionError>;
    /// BYE within an established dialog.
    async fn bye(&self, call_id: &str) -> Result<(), ConnectionError>;
    async fn refer(&self, call_id: &str, target: &str) -> Result<(), ConnectionError>;
    async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), ConnectionError>;
}
