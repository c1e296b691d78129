//! Error taxonomy for the telephony control plane.
//!
//! The CLI and REST glue use `anyhow`; the core components return these so
//! callers can match on the failure class.

use thiserror::Error;

use crate::calling::CallStatus;

/// Signaling transport or registration failure.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("signaling connection not initialized")]
    NotInitialized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registration rejected: {code} {reason}")]
    Registration { code: u16, reason: String },

    #[error("{method} rejected: {code} {reason}")]
    Rejected {
        method: String,
        code: u16,
        reason: String,
    },

    #[error("no dialog for call {0}")]
    UnknownDialog(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("transport closed")]
    Closed,
}

/// Failures surfaced by the call control façade.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress ({0})")]
    CallInProgress(CallStatus),

    #[error("not registered with the signaling proxy")]
    NotRegistered,

    #[error("no active call")]
    NoActiveCall,

    #[error("cannot {op} while call is {status}")]
    InvalidState { op: &'static str, status: CallStatus },

    #[error("invalid call target: {0:?}")]
    InvalidTarget(String),

    #[error("invalid DTMF digit: {0:?}")]
    InvalidDtmf(char),

    #[error("call setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Signaling(#[from] ConnectionError),
}

/// Caller identification failure. Never propagated past the resolver.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("contact lookup failed: {0}")]
    Backend(String),

    #[error("contact lookup timed out")]
    Timeout,
}

/// Result of a single switch queue action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueActionError {
    #[error("interface is already a member of the queue")]
    AlreadyMember,

    #[error("interface is not a member of the queue")]
    NotMember,

    #[error("switch rejected action: {0}")]
    Rejected(String),

    #[error("switch transport error: {0}")]
    Transport(String),
}

/// Presence request or synchronization failure.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("unknown presence status: {0:?}")]
    UnknownStatus(String),

    #[error("break {0:?} requires a break id")]
    MissingBreakId(String),

    #[error("break name {0:?} is reserved")]
    ReservedBreakName(String),

    #[error("queue directory error: {0}")]
    Directory(String),

    #[error("presence store error: {0}")]
    Store(String),
}
