//! Call session state machine: owns the single call record of a session.
//!
//! The record is replaced only by [`CallSession::begin`], which refuses while
//! a call is still live, and changed only through the reducer. Once a call
//! reaches a terminal status it stays readable for a short grace window, then
//! is cleared.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::CallError;
use crate::events::Broadcaster;

use super::{reduce, Call, CallPatch};

/// How long a finished call remains readable before it is cleared.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(1);

/// Broadcast to call listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Updated(Call),
    Cleared { call_id: String },
}

pub struct CallSession {
    current: Mutex<Option<Call>>,
    events: Broadcaster<CallEvent>,
    grace: Duration,
}

impl CallSession {
    pub fn new() -> Arc<Self> {
        Self::with_grace(DEFAULT_GRACE_WINDOW)
    }

    pub fn with_grace(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(None),
            events: Broadcaster::new(),
            grace,
        })
    }

    pub fn events(&self) -> &Broadcaster<CallEvent> {
        &self.events
    }

    /// The call record, including one that just ended and is in its grace window.
    pub fn current(&self) -> Option<Call> {
        self.lock().clone()
    }

    /// The call record only if it is in a non-terminal status.
    pub fn live(&self) -> Option<Call> {
        self.lock().as_ref().filter(|c| c.is_live()).cloned()
    }

    /// Install a new call. Fails without touching state if a call is live.
    pub fn begin(&self, call: Call) -> Result<Call, CallError> {
        {
            let mut guard = self.lock();
            if let Some(existing) = guard.as_ref().filter(|c| c.is_live()) {
                return Err(CallError::CallInProgress(existing.status));
            }
            *guard = Some(call.clone());
        }
        tracing::info!(
            "Call {} started ({:?} {}) status={}",
            call.id,
            call.direction,
            call.remote_number,
            call.status
        );
        self.events.emit(&CallEvent::Updated(call.clone()));
        Ok(call)
    }

    /// Merge `patch` into the call with `call_id`.
    ///
    /// Returns the resulting call, or `None` if no such call is held. Listeners
    /// are notified only when the record actually changed.
    pub fn apply(self: &Arc<Self>, call_id: &str, patch: &CallPatch) -> Option<Call> {
        let (prev, next) = {
            let mut guard = self.lock();
            let prev = match guard.as_ref() {
                Some(c) if c.id == call_id => c.clone(),
                _ => return None,
            };
            let next = reduce(&prev, patch);
            *guard = Some(next.clone());
            (prev, next)
        };

        if next == prev {
            return Some(next);
        }

        if next.status != prev.status {
            tracing::info!("Call {}: {} -> {}", call_id, prev.status, next.status);
        }
        self.events.emit(&CallEvent::Updated(next.clone()));

        if next.status.is_terminal() && !prev.status.is_terminal() {
            self.schedule_clear(call_id.to_string());
        }
        Some(next)
    }

    fn schedule_clear(self: &Arc<Self>, call_id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::downgrade(self);
        let grace = self.grace;
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(session) = session.upgrade() {
                session.clear_if(&call_id);
            }
        });
    }

    /// Clear the record if it still holds the finished call `call_id`.
    pub fn clear_if(&self, call_id: &str) -> bool {
        let cleared = {
            let mut guard = self.lock();
            match guard.as_ref() {
                Some(c) if c.id == call_id && !c.is_live() => {
                    *guard = None;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            tracing::debug!("Call {} cleared after grace window", call_id);
            self.events.emit(&CallEvent::Cleared {
                call_id: call_id.to_string(),
            });
        }
        cleared
    }

    /// Drop the record and all listeners. Used at logout.
    pub fn reset(&self) {
        *self.lock() = None;
        self.events.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Call>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::CallStatus;

    fn recorder(session: &CallSession) -> Arc<Mutex<Vec<CallEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        session
            .events()
            .subscribe(move |e: &CallEvent| s.lock().unwrap().push(e.clone()));
        seen
    }

    #[tokio::test]
    async fn test_second_call_refused_while_live() {
        let session = CallSession::new();
        session.begin(Call::outbound("a", "100")).unwrap();
        session.apply("a", &CallPatch::status(CallStatus::Active));

        let err = session.begin(Call::outbound("b", "200")).unwrap_err();
        assert!(matches!(err, CallError::CallInProgress(CallStatus::Active)));

        let current = session.current().unwrap();
        assert_eq!(current.id, "a");
        assert_eq!(current.status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_apply_ignores_unknown_call() {
        let session = CallSession::new();
        session.begin(Call::outbound("a", "100")).unwrap();
        assert!(session
            .apply("zzz", &CallPatch::status(CallStatus::Active))
            .is_none());
        assert_eq!(session.current().unwrap().status, CallStatus::Trying);
    }

    #[tokio::test]
    async fn test_unchanged_patch_is_not_broadcast() {
        let session = CallSession::new();
        session.begin(Call::outbound("a", "100")).unwrap();
        let seen = recorder(&session);

        session.apply("a", &CallPatch::muted(false));
        session.apply("a", &CallPatch::status(CallStatus::Trying));
        assert!(seen.lock().unwrap().is_empty());

        session.apply("a", &CallPatch::muted(true));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_call_cleared_after_grace_window() {
        let session = CallSession::new();
        session.begin(Call::inbound("a", "100", None)).unwrap();
        session.apply("a", &CallPatch::status(CallStatus::Rejected));
        let seen = recorder(&session);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.current().unwrap().status, CallStatus::Rejected);
        assert!(session.live().is_none());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(session.current().is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![CallEvent::Cleared {
                call_id: "a".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_call_during_grace_survives_stale_timer() {
        let session = CallSession::new();
        session.begin(Call::outbound("a", "100")).unwrap();
        session.apply("a", &CallPatch::status(CallStatus::Failed));

        session.begin(Call::outbound("b", "200")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.current().unwrap().id, "b");
    }
}
