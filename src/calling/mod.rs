//! Call model and lifecycle reducer.
//!
//! A `Call` is only ever changed through [`reduce`], which merges a
//! [`CallPatch`] into the previous value. Status changes that would move the
//! call backwards through the lifecycle are dropped; every field the patch
//! does not mention is carried over unchanged.

pub mod call_log;
pub mod caller_id;
pub mod control;
pub mod media;
pub mod rtp;
pub mod sdp;
pub mod session;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Display text used when the caller cannot be identified.
pub const ANONYMOUS_CALLER: &str = "Anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Trying,
    Connecting,
    Ringing,
    Active,
    Terminated,
    Failed,
    Rejected,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Terminated | CallStatus::Failed | CallStatus::Rejected
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    pub fn can_advance_to(self, next: CallStatus, direction: Direction) -> bool {
        use CallStatus::*;
        match (self, next) {
            (Idle, Trying) => direction == Direction::Outbound,
            (Idle, Ringing) => direction == Direction::Inbound,
            (Trying, Connecting | Ringing | Active | Terminated | Failed) => true,
            (Connecting, Ringing | Active | Terminated | Failed) => true,
            (Ringing, Active | Terminated | Failed) => true,
            (Ringing, Rejected) => direction == Direction::Inbound,
            (Active, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Idle => "idle",
            CallStatus::Trying => "trying",
            CallStatus::Connecting => "connecting",
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Terminated => "terminated",
            CallStatus::Failed => "failed",
            CallStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// The single live call of an agent session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    /// SIP Call-ID of the dialog.
    pub id: String,
    pub direction: Direction,
    pub remote_number: String,
    pub display_name: Option<String>,
    pub status: CallStatus,
    pub is_muted: bool,
    pub is_held: bool,
    /// Directory contact this call was matched to. Never owns contact data.
    pub contact_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the call reaches `Active`; the duration clock starts here.
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
}

impl Call {
    pub fn outbound(id: impl Into<String>, number: impl Into<String>) -> Self {
        Self::new(id.into(), Direction::Outbound, number.into(), CallStatus::Trying)
    }

    pub fn inbound(
        id: impl Into<String>,
        number: impl Into<String>,
        display_name: Option<String>,
    ) -> Self {
        let mut call = Self::new(id.into(), Direction::Inbound, number.into(), CallStatus::Ringing);
        call.display_name = display_name;
        call
    }

    fn new(id: String, direction: Direction, remote_number: String, status: CallStatus) -> Self {
        Self {
            id,
            direction,
            remote_number,
            display_name: None,
            status,
            is_muted: false,
            is_held: false,
            contact_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Seconds since the call became active, frozen once it ends.
    pub fn duration_seconds(&self) -> i64 {
        self.duration_seconds_at(Utc::now())
    }

    pub fn duration_seconds_at(&self, now: DateTime<Utc>) -> i64 {
        match self.started_at {
            Some(start) => {
                let end = self.ended_at.unwrap_or(now);
                (end - start).num_seconds().max(0)
            }
            None => 0,
        }
    }

    /// Name to show for the remote party.
    pub fn display(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(ANONYMOUS_CALLER)
    }
}

/// Partial update to a call. `None` fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallPatch {
    pub status: Option<CallStatus>,
    pub is_muted: Option<bool>,
    pub is_held: Option<bool>,
    pub remote_number: Option<String>,
    pub display_name: Option<String>,
    pub contact_id: Option<String>,
    pub end_reason: Option<String>,
}

impl CallPatch {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn muted(muted: bool) -> Self {
        Self {
            is_muted: Some(muted),
            ..Self::default()
        }
    }

    pub fn held(held: bool) -> Self {
        Self {
            is_held: Some(held),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.end_reason = Some(reason.into());
        self
    }

    pub fn with_display(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }
}

/// Merge `patch` into `prev`, stamping lifecycle times with the current clock.
pub fn reduce(prev: &Call, patch: &CallPatch) -> Call {
    reduce_at(prev, patch, Utc::now())
}

pub fn reduce_at(prev: &Call, patch: &CallPatch, now: DateTime<Utc>) -> Call {
    let mut next = prev.clone();

    if let Some(status) = patch.status {
        if status != prev.status {
            if prev.status.can_advance_to(status, prev.direction) {
                next.status = status;
                if status == CallStatus::Active {
                    next.started_at = Some(now);
                }
                if status.is_terminal() {
                    next.ended_at = Some(now);
                }
            } else {
                tracing::debug!(
                    "Call {}: ignoring transition {} -> {}",
                    prev.id,
                    prev.status,
                    status
                );
            }
        }
    }

    if let Some(muted) = patch.is_muted {
        next.is_muted = muted;
    }
    if let Some(held) = patch.is_held {
        next.is_held = held;
    }
    if let Some(ref number) = patch.remote_number {
        next.remote_number = number.clone();
    }
    if let Some(ref name) = patch.display_name {
        next.display_name = Some(name.clone());
    }
    if let Some(ref contact) = patch.contact_id {
        next.contact_id = Some(contact.clone());
    }
    if next.end_reason.is_none() {
        next.end_reason = patch.end_reason.clone();
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reduce_preserves_unmentioned_flags() {
        let call = Call::outbound("c1", "5551234567");
        let call = reduce(&call, &CallPatch::muted(true));
        let call = reduce(&call, &CallPatch::held(true));
        let call = reduce(&call, &CallPatch::status(CallStatus::Ringing));

        assert_eq!(call.status, CallStatus::Ringing);
        assert!(call.is_muted);
        assert!(call.is_held);
        assert_eq!(call.remote_number, "5551234567");
    }

    #[test]
    fn test_call_serializes_timestamps() {
        let call = reduce(
            &Call::outbound("c1", "100"),
            &CallPatch::status(CallStatus::Active),
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["direction"], "outbound");
        assert!(json["started_at"].is_string());
        assert!(json["ended_at"].is_null());
    }

    #[test]
    fn test_reduce_ignores_backward_transition() {
        let call = Call::outbound("c1", "100");
        let call = reduce(&call, &CallPatch::status(CallStatus::Ringing));
        let call = reduce(&call, &CallPatch::status(CallStatus::Connecting));
        assert_eq!(call.status, CallStatus::Ringing);

        let call = reduce(&call, &CallPatch::status(CallStatus::Active));
        let call = reduce(&call, &CallPatch::status(CallStatus::Trying));
        assert_eq!(call.status, CallStatus::Active);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [CallStatus::Terminated, CallStatus::Failed, CallStatus::Rejected] {
            for next in [
                CallStatus::Idle,
                CallStatus::Trying,
                CallStatus::Ringing,
                CallStatus::Active,
                CallStatus::Terminated,
                CallStatus::Failed,
            ] {
                assert!(!terminal.can_advance_to(next, Direction::Inbound));
                assert!(!terminal.can_advance_to(next, Direction::Outbound));
            }
        }
    }

    #[test]
    fn test_reject_only_for_inbound() {
        assert!(CallStatus::Ringing.can_advance_to(CallStatus::Rejected, Direction::Inbound));
        assert!(!CallStatus::Ringing.can_advance_to(CallStatus::Rejected, Direction::Outbound));
    }

    #[test]
    fn test_duration_starts_at_active() {
        let t0 = Utc::now();
        let call = Call::outbound("c1", "100");
        let call = reduce_at(&call, &CallPatch::status(CallStatus::Ringing), t0);
        assert!(call.started_at.is_none());
        assert_eq!(call.duration_seconds_at(t0 + Duration::seconds(30)), 0);

        let call = reduce_at(&call, &CallPatch::status(CallStatus::Active), t0);
        assert_eq!(call.duration_seconds_at(t0 + Duration::seconds(42)), 42);

        let ended = reduce_at(
            &call,
            &CallPatch::status(CallStatus::Terminated),
            t0 + Duration::seconds(60),
        );
        assert_eq!(ended.duration_seconds_at(t0 + Duration::seconds(600)), 60);
    }

    #[test]
    fn test_first_end_reason_wins() {
        let call = Call::inbound("c1", "100", None);
        let call = reduce(
            &call,
            &CallPatch::status(CallStatus::Terminated).with_reason("remote hangup"),
        );
        let call = reduce(&call, &CallPatch::default().with_reason("local hangup"));
        assert_eq!(call.end_reason.as_deref(), Some("remote hangup"));
    }

    #[test]
    fn test_display_falls_back_to_anonymous() {
        let call = Call::inbound("c1", "5550000", None);
        assert_eq!(call.display(), ANONYMOUS_CALLER);
        let call = reduce(&call, &CallPatch::default().with_display("Ada Lovelace"));
        assert_eq!(call.display(), "Ada Lovelace");
    }
}
