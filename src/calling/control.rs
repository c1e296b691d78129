//! Call control façade.
//!
//! The only entry point the UI (or CLI console) uses to place and manage
//! calls, and the consumer of [`SignalEvent`]s from the user agent. Every
//! operation checks the single-call invariant synchronously against the
//! [`CallSession`] before anything async happens.

use std::sync::{Arc, Mutex};

use super::call_log::{record_detached, CallLogEntry, CallLogger};
use super::caller_id::{identify_in_background, CallerIdResolver};
use super::media::MediaController;
use super::session::CallSession;
use super::{Call, CallPatch, CallStatus, Direction};
use crate::error::CallError;
use crate::signaling::{ConnectionManager, SignalEvent, SignalingTransport};

/// SIP response used to turn away a second inbound call.
const BUSY_HERE: u16 = 486;
const DECLINE: u16 = 603;

/// Normalize a dial target.
///
/// Phone numbers lose their punctuation (`(555) 123-4567` → `5551234567`);
/// SIP URIs and `user@host` targets pass through untouched.
pub fn normalize_target(raw: &str) -> Result<String, CallError> {
    let trimmed = raw.trim();
    if trimmed.starts_with("sip:") || trimmed.contains('@') {
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CallError::InvalidTarget(raw.to_string()));
        }
        return Ok(trimmed.to_string());
    }

    let cleaned: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '*' || c == '#') {
        return Err(CallError::InvalidTarget(raw.to_string()));
    }
    Ok(cleaned)
}

fn is_dtmf(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D')
}

pub struct CallControl {
    session: Arc<CallSession>,
    media: Arc<MediaController>,
    connection: Arc<ConnectionManager>,
    resolver: Arc<dyn CallerIdResolver>,
    call_log: Arc<dyn CallLogger>,
    /// Offer of the ringing inbound call, kept until it is answered.
    pending_offer: Mutex<Option<(String, Option<String>)>>,
}

impl CallControl {
    pub fn new(
        session: Arc<CallSession>,
        media: Arc<MediaController>,
        connection: Arc<ConnectionManager>,
        resolver: Arc<dyn CallerIdResolver>,
        call_log: Arc<dyn CallLogger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            media,
            connection,
            resolver,
            call_log,
            pending_offer: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &Arc<CallSession> {
        &self.session
    }

    /// Current call, including one in its post-termination grace window.
    pub fn status(&self) -> Option<Call> {
        self.session.current()
    }

    fn transport(&self) -> Result<Arc<dyn SignalingTransport>, CallError> {
        if !self.connection.is_registered() {
            return Err(CallError::NotRegistered);
        }
        self.connection.transport().ok_or(CallError::NotRegistered)
    }

    fn live_call(&self) -> Result<Call, CallError> {
        self.session.live().ok_or(CallError::NoActiveCall)
    }

    fn require(&self, op: &'static str, allowed: &[CallStatus]) -> Result<Call, CallError> {
        let call = self.live_call()?;
        if !allowed.contains(&call.status) {
            return Err(CallError::InvalidState {
                op,
                status: call.status,
            });
        }
        Ok(call)
    }

    /// Apply `patch` and run the end-of-call bookkeeping on the transition
    /// into a terminal status.
    fn update(&self, call_id: &str, patch: CallPatch) -> Option<Call> {
        let was_live = self
            .session
            .current()
            .filter(|c| c.id == call_id)
            .map(|c| c.is_live())?;
        let call = self.session.apply(call_id, &patch)?;
        if was_live && !call.is_live() {
            self.finish(&call);
        }
        Some(call)
    }

    fn finish(&self, call: &Call) {
        self.media.release(&call.id);
        {
            let mut offer = self.pending_offer.lock().unwrap_or_else(|e| e.into_inner());
            if offer.as_ref().is_some_and(|(id, _)| *id == call.id) {
                *offer = None;
            }
        }
        tracing::info!(
            "Call {} ended: {} ({}s, {})",
            call.id,
            call.status,
            call.duration_seconds(),
            call.end_reason.as_deref().unwrap_or("no reason")
        );
        record_detached(self.call_log.clone(), CallLogEntry::end(call));
    }

    /// Place an outbound call.
    pub async fn dial(&self, target: &str) -> Result<Call, CallError> {
        let number = normalize_target(target)?;
        let transport = self.transport()?;
        let call = self
            .session
            .begin(Call::outbound(uuid::Uuid::new_v4().to_string(), number.clone()))?;
        record_detached(self.call_log.clone(), CallLogEntry::start(&call));

        self.media.begin(&call.id);
        let setup = async {
            self.media
                .open_channel()
                .await
                .map_err(|e| CallError::Setup(format!("{:#}", e)))?;
            let offer = self.media.local_offer();
            transport.invite(&call.id, &number, &offer).await?;
            Ok::<_, CallError>(())
        };

        if let Err(e) = setup.await {
            tracing::warn!("Call {} setup failed: {}", call.id, e);
            self.update(&call.id, CallPatch::status(CallStatus::Failed).with_reason(e.to_string()));
            return Err(e);
        }
        Ok(self.session.current().unwrap_or(call))
    }

    /// Answer the ringing inbound call.
    pub async fn answer(&self) -> Result<Call, CallError> {
        let call = self.require("answer", &[CallStatus::Ringing])?;
        if call.direction != Direction::Inbound {
            return Err(CallError::InvalidState {
                op: "answer",
                status: call.status,
            });
        }
        let transport = self.transport()?;
        let offer = {
            let pending = self.pending_offer.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .as_ref()
                .filter(|(id, _)| *id == call.id)
                .and_then(|(_, sdp)| sdp.clone())
        };

        let setup = async {
            self.media
                .open_channel()
                .await
                .map_err(|e| CallError::Setup(format!("{:#}", e)))?;
            let local = match offer.as_deref() {
                Some(remote) => self
                    .media
                    .answer_offer(remote)
                    .map_err(|e| CallError::Setup(format!("{:#}", e)))?,
                None => self.media.local_offer(),
            };
            transport.accept(&call.id, &local).await?;
            Ok::<_, CallError>(())
        };

        if let Err(e) = setup.await {
            tracing::warn!("Answering call {} failed: {}", call.id, e);
            if let Err(e) = transport.reject(&call.id, 500).await {
                tracing::debug!("Could not release failed call {}: {}", call.id, e);
            }
            self.update(&call.id, CallPatch::status(CallStatus::Failed).with_reason(e.to_string()));
            return Err(e);
        }

        let active = self
            .update(&call.id, CallPatch::status(CallStatus::Active))
            .unwrap_or(call);
        if let Err(e) = self.media.on_active(&active.id, None) {
            tracing::warn!("Media for call {} not started: {:#}", active.id, e);
        }
        Ok(active)
    }

    /// Decline the ringing inbound call.
    pub async fn reject(&self) -> Result<Call, CallError> {
        let call = self.require("reject", &[CallStatus::Ringing])?;
        if call.direction != Direction::Inbound {
            return Err(CallError::InvalidState {
                op: "reject",
                status: call.status,
            });
        }
        if let Some(transport) = self.connection.transport() {
            if let Err(e) = transport.reject(&call.id, DECLINE).await {
                tracing::warn!("Reject of call {} not sent: {}", call.id, e);
            }
        }
        // A declined inbound call ends in Rejected, not Terminated.
        Ok(self
            .update(
                &call.id,
                CallPatch::status(CallStatus::Rejected).with_reason("rejected by agent"),
            )
            .unwrap_or(call))
    }

    /// Hang up: cancel (or decline) before the call is answered, BYE after.
    ///
    /// The call always ends locally, even if the signaling request fails.
    pub async fn end(&self) -> Result<Call, CallError> {
        let call = self.live_call()?;
        let transport = self.connection.transport();

        let (reason, sent) = match (call.status, call.direction) {
            (CallStatus::Active, _) => {
                let sent = match &transport {
                    Some(t) => t.bye(&call.id).await,
                    None => Ok(()),
                };
                ("local hangup", sent)
            }
            (_, Direction::Inbound) => {
                let sent = match &transport {
                    Some(t) => t.reject(&call.id, DECLINE).await,
                    None => Ok(()),
                };
                ("declined", sent)
            }
            (_, Direction::Outbound) => {
                let sent = match &transport {
                    Some(t) => t.cancel(&call.id).await,
                    None => Ok(()),
                };
                ("cancelled", sent)
            }
        };
        if let Err(e) = sent {
            tracing::warn!("Hangup signaling for call {} failed: {}", call.id, e);
        }

        Ok(self
            .update(&call.id, CallPatch::status(CallStatus::Terminated).with_reason(reason))
            .unwrap_or(call))
    }

    pub fn set_muted(&self, muted: bool) -> Result<Call, CallError> {
        let call = self.live_call()?;
        let enabled = self.media.set_muted(muted);
        tracing::debug!("Call {} muted={} (track enabled={})", call.id, muted, enabled);
        Ok(self.update(&call.id, CallPatch::muted(muted)).unwrap_or(call))
    }

    pub fn toggle_mute(&self) -> Result<Call, CallError> {
        let muted = self.live_call()?.is_muted;
        self.set_muted(!muted)
    }

    pub fn set_held(&self, held: bool) -> Result<Call, CallError> {
        let call = self.require("hold", &[CallStatus::Active])?;
        let enabled = self.media.set_held(held);
        tracing::debug!("Call {} held={} (track enabled={})", call.id, held, enabled);
        Ok(self.update(&call.id, CallPatch::held(held)).unwrap_or(call))
    }

    pub fn toggle_hold(&self) -> Result<Call, CallError> {
        let held = self.live_call()?.is_held;
        self.set_held(!held)
    }

    /// Blind transfer. Once the proxy accepts the REFER our leg is released.
    pub async fn transfer(&self, target: &str) -> Result<Call, CallError> {
        let call = self.require("transfer", &[CallStatus::Active])?;
        let target = normalize_target(target)?;
        let transport = self.transport()?;

        transport.refer(&call.id, &target).await?;
        tracing::info!("Call {} transferred to {}", call.id, target);
        if let Err(e) = transport.bye(&call.id).await {
            tracing::debug!("BYE after transfer of {} failed: {}", call.id, e);
        }
        Ok(self
            .update(
                &call.id,
                CallPatch::status(CallStatus::Terminated)
                    .with_reason(format!("transferred to {}", target)),
            )
            .unwrap_or(call))
    }

    /// Send DTMF digits in-dialog.
    pub async fn send_dtmf(&self, digits: &str) -> Result<(), CallError> {
        let call = self.require("send DTMF", &[CallStatus::Active])?;
        if let Some(bad) = digits.chars().find(|c| !is_dtmf(*c)) {
            return Err(CallError::InvalidDtmf(bad));
        }
        let transport = self.transport()?;
        for digit in digits.chars() {
            transport.send_dtmf(&call.id, digit).await?;
        }
        Ok(())
    }

    /// React to something the user agent observed.
    pub async fn handle_signal(&self, event: SignalEvent) {
        match event {
            SignalEvent::IncomingCall {
                call_id,
                from_number,
                display_name,
                sdp,
            } => self.on_incoming(call_id, from_number, display_name, sdp).await,

            SignalEvent::Progress { call_id, code, sdp } => {
                let status = if code == 180 {
                    CallStatus::Ringing
                } else {
                    CallStatus::Connecting
                };
                if self.update(&call_id, CallPatch::status(status)).is_none() {
                    return;
                }
                if let Some(sdp) = sdp {
                    if let Err(e) = self.media.apply_early_media(&call_id, &sdp) {
                        tracing::warn!("Early media for {} ignored: {:#}", call_id, e);
                    }
                }
            }

            SignalEvent::Answered { call_id, sdp } => {
                let live = self.session.live().is_some_and(|c| c.id == call_id);
                if !live {
                    // Answered after we gave up on it (CANCEL raced the 200).
                    if let Some(transport) = self.connection.transport() {
                        if let Err(e) = transport.bye(&call_id).await {
                            tracing::debug!("BYE for stale answer {} failed: {}", call_id, e);
                        }
                    }
                    return;
                }
                self.update(&call_id, CallPatch::status(CallStatus::Active));
                if let Err(e) = self.media.on_active(&call_id, sdp.as_deref()) {
                    tracing::warn!("Media for call {} not started: {:#}", call_id, e);
                }
            }

            SignalEvent::Failed {
                call_id,
                code,
                reason,
            } => {
                self.update(
                    &call_id,
                    CallPatch::status(CallStatus::Failed).with_reason(format!("{} {}", code, reason)),
                );
            }

            SignalEvent::RemoteHangup { call_id, reason } => {
                self.update(&call_id, CallPatch::status(CallStatus::Terminated).with_reason(reason));
            }

            SignalEvent::TransferResult { call_id, success } => {
                tracing::info!("Transfer of {} completed (success={})", call_id, success);
            }

            SignalEvent::TransportLost { .. } | SignalEvent::RegistrationLost { .. } => {}
        }
    }

    async fn on_incoming(
        &self,
        call_id: String,
        from_number: String,
        display_name: Option<String>,
        sdp: Option<String>,
    ) {
        let call = Call::inbound(call_id.clone(), from_number.clone(), display_name);
        let call = match self.session.begin(call) {
            Ok(call) => call,
            Err(e) => {
                tracing::info!("Incoming call {} from {} refused: {}", call_id, from_number, e);
                if let Some(transport) = self.connection.transport() {
                    if let Err(e) = transport.reject(&call_id, BUSY_HERE).await {
                        tracing::warn!("Busy reply for {} not sent: {}", call_id, e);
                    }
                }
                return;
            }
        };

        *self.pending_offer.lock().unwrap_or_else(|e| e.into_inner()) = Some((call.id.clone(), sdp));
        self.media.begin(&call.id);
        record_detached(self.call_log.clone(), CallLogEntry::start(&call));

        let session = self.session.clone();
        identify_in_background(self.resolver.clone(), from_number, move |identity| {
            if let Some(contact) = identity {
                session.apply(
                    &call.id,
                    &CallPatch::default()
                        .with_display(contact.display_name)
                        .with_contact(contact.id),
                );
            }
        });
    }
}
