//! SIP-over-WebSocket user agent
//!
//! Implements [`SignalingTransport`] against a SIP proxy reachable over a
//! WebSocket: registration with digest authentication and periodic refresh,
//! outbound INVITE/CANCEL/BYE/REFER/INFO, and the UAS side of inbound calls.
//! Everything the call layer needs to react to is pushed as a
//! [`SignalEvent`] on the channel given to [`SipWsTransport::new`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::digest::{self, Challenge};
use super::sip::{self, NameAddr, SipMessage};
use super::transport::{SignalEvent, SignalingTransport};
use super::websocket::{self, Frame, SocketReader, SocketWriter};
use crate::error::ConnectionError;

/// Requested registration lifetime in seconds.
pub const REGISTER_EXPIRES: u32 = 600;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// 64 × T1, the RFC 3261 non-INVITE transaction timeout.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(32);

const USER_AGENT: &str = concat!("agent-desk/", env!("CARGO_PKG_VERSION"));
const ALLOW: &str = "INVITE, ACK, CANCEL, BYE, REFER, NOTIFY, INFO, OPTIONS";

/// SIP device credentials for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipAccount {
    pub ws_url: String,
    /// SIP domain, also used as the registrar URI.
    pub domain: String,
    pub username: String,
    /// Digest user when it differs from `username`.
    pub auth_username: Option<String>,
    pub password: String,
    pub display_name: Option<String>,
}

impl SipAccount {
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    fn auth_user(&self) -> &str {
        self.auth_username.as_deref().unwrap_or(&self.username)
    }

    /// Request-URI for a dial target: bare numbers are placed in our domain.
    pub fn target_uri(&self, target: &str) -> String {
        if target.starts_with("sip:") || target.starts_with("sips:") {
            target.to_string()
        } else if target.contains('@') {
            format!("sip:{}", target)
        } else {
            format!("sip:{}@{}", target, self.domain)
        }
    }
}

struct Dialog {
    outbound: bool,
    local_tag: String,
    remote_tag: Option<String>,
    /// name-addr without tag, used in From (outbound) or To (inbound)
    local_uri: String,
    remote_uri: String,
    remote_target: String,
    route_set: Vec<String>,
    local_cseq: u32,
    /// Outbound: the INVITE we sent. Inbound: the INVITE we received.
    invite: SipMessage,
    local_sdp: Option<String>,
    confirmed: bool,
    auth_attempted: bool,
}

struct UaState {
    dialogs: HashMap<String, Dialog>,
    pending: HashMap<String, oneshot::Sender<SipMessage>>,
    reg_call_id: String,
    reg_tag: String,
    reg_cseq: u32,
    registered: bool,
}

struct UaInner {
    account: SipAccount,
    events: mpsc::UnboundedSender<SignalEvent>,
    contact_host: String,
    via_transport: &'static str,
    state: Mutex<UaState>,
    writer: tokio::sync::Mutex<Option<SocketWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// The production [`SignalingTransport`].
pub struct SipWsTransport {
    inner: Arc<UaInner>,
}

fn pending_key(branch: &str, method: &str) -> String {
    format!("{}:{}", branch, method)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn record_routes(msg: &SipMessage) -> Vec<String> {
    msg.header_all("Record-Route")
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn contact_uri(msg: &SipMessage) -> Option<String> {
    NameAddr::parse(msg.header("Contact")?).map(|na| na.uri)
}

impl SipWsTransport {
    pub fn new(account: SipAccount, events: mpsc::UnboundedSender<SignalEvent>) -> Self {
        let via_transport = if account.ws_url.starts_with("wss") || account.ws_url.starts_with("https") {
            "WSS"
        } else {
            "WS"
        };
        let host = uuid::Uuid::new_v4().simple().to_string();
        Self {
            inner: Arc::new(UaInner {
                account,
                events,
                contact_host: format!("{}.invalid", &host[..12]),
                via_transport,
                state: Mutex::new(UaState {
                    dialogs: HashMap::new(),
                    pending: HashMap::new(),
                    reg_call_id: uuid::Uuid::new_v4().to_string(),
                    reg_tag: sip::new_tag(),
                    reg_cseq: 0,
                    registered: false,
                }),
                writer: tokio::sync::Mutex::new(None),
                reader_task: Mutex::new(None),
                refresh_task: Mutex::new(None),
            }),
        }
    }
}

impl Drop for SipWsTransport {
    fn drop(&mut self) {
        self.inner.abort_tasks();
    }
}

impl UaInner {
    fn state(&self) -> MutexGuard<'_, UaState> {
        lock(&self.state)
    }

    fn emit(&self, event: SignalEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Signal event dropped: no receiver");
        }
    }

    fn abort_tasks(&self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
    }

    fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {};branch={};rport",
            self.via_transport, self.contact_host, branch
        )
    }

    fn contact(&self) -> String {
        format!(
            "<sip:{}@{};transport=ws>",
            self.account.username, self.contact_host
        )
    }

    fn local_name_addr(&self) -> String {
        NameAddr {
            display_name: self.account.display_name.clone(),
            uri: self.account.aor(),
        }
        .to_string()
    }

    async fn send(&self, msg: &SipMessage) -> Result<(), ConnectionError> {
        let text = msg.to_string();
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnectionError::Closed)?;
        writer
            .send_text(&text)
            .await
            .map_err(|e| ConnectionError::Transport(format!("{:#}", e)))
    }

    /// Send a request and wait for its final response.
    async fn wait_response(&self, req: &SipMessage) -> Result<SipMessage, ConnectionError> {
        let branch = req.branch().unwrap_or_default().to_string();
        let method = req.method().unwrap_or_default().to_string();
        let key = pending_key(&branch, &method);
        let (tx, rx) = oneshot::channel();
        self.state().pending.insert(key.clone(), tx);

        if let Err(e) = self.send(req).await {
            self.state().pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(TRANSACTION_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.state().pending.remove(&key);
                Err(ConnectionError::Timeout("final response"))
            }
        }
    }

    /// [`wait_response`](Self::wait_response), answering one digest challenge.
    async fn transact(&self, mut req: SipMessage) -> Result<SipMessage, ConnectionError> {
        let mut resp = self.wait_response(&req).await?;
        let mut nc = 1;
        loop {
            let code = resp.status().unwrap_or_default();
            if code != 401 && code != 407 {
                return Ok(resp);
            }
            let already_sent = req.header("Authorization").is_some()
                || req.header("Proxy-Authorization").is_some();
            let challenge_header = if code == 401 { "WWW-Authenticate" } else { "Proxy-Authenticate" };
            let stale = resp.header(challenge_header).is_some_and(digest::is_stale);
            if already_sent && !stale {
                return Ok(resp);
            }
            let Some(retry) = self.authorize(&req, &resp, nc) else {
                return Ok(resp);
            };
            nc += 1;
            req = retry;
            resp = self.wait_response(&req).await?;
        }
    }

    /// Re-issue `req` with credentials for the challenge in `resp`, under a
    /// fresh branch and the next CSeq.
    fn authorize(&self, req: &SipMessage, resp: &SipMessage, nc: u32) -> Option<SipMessage> {
        let (challenge_header, auth_header) = match resp.status()? {
            401 => ("WWW-Authenticate", "Authorization"),
            _ => ("Proxy-Authenticate", "Proxy-Authorization"),
        };
        let challenge = Challenge::parse(resp.header(challenge_header)?)?;
        let method = req.method()?.to_string();
        let uri = req.uri()?.to_string();
        let cseq = self.next_cseq(req.call_id()?);

        let mut retry = req.clone();
        retry.set_header("Via", &self.via(&sip::new_branch()));
        retry.set_header("CSeq", &format!("{} {}", cseq, method));
        retry.remove_header("Authorization");
        retry.remove_header("Proxy-Authorization");
        retry.add_header(
            auth_header,
            &challenge.authorize(
                self.account.auth_user(),
                &self.account.password,
                &method,
                &uri,
                nc,
            ),
        );
        Some(retry)
    }

    fn next_cseq(&self, call_id: &str) -> u32 {
        let mut state = self.state();
        if let Some(dialog) = state.dialogs.get_mut(call_id) {
            dialog.local_cseq += 1;
            return dialog.local_cseq;
        }
        state.reg_cseq += 1;
        state.reg_cseq
    }

    fn build_register(&self, expires: u32) -> SipMessage {
        let (call_id, tag, cseq) = {
            let mut state = self.state();
            state.reg_cseq += 1;
            (state.reg_call_id.clone(), state.reg_tag.clone(), state.reg_cseq)
        };
        let aor = self.account.aor();
        let mut req = SipMessage::request("REGISTER", format!("sip:{}", self.account.domain));
        req.add_header("Via", &self.via(&sip::new_branch()));
        req.add_header("Max-Forwards", "70");
        req.add_header("From", &format!("{};tag={}", self.local_name_addr(), tag));
        req.add_header("To", &format!("<{}>", aor));
        req.add_header("Call-ID", &call_id);
        req.add_header("CSeq", &format!("{} REGISTER", cseq));
        req.add_header("Contact", &format!("{};expires={}", self.contact(), expires));
        req.add_header("Expires", &expires.to_string());
        req.add_header("Allow", ALLOW);
        req.add_header("User-Agent", USER_AGENT);
        req
    }

    async fn register_once(&self) -> Result<u32, ConnectionError> {
        let resp = self.transact(self.build_register(REGISTER_EXPIRES)).await?;
        let code = resp.status().unwrap_or_default();
        if !(200..300).contains(&code) {
            self.state().registered = false;
            return Err(ConnectionError::Registration {
                code,
                reason: resp.reason().to_string(),
            });
        }
        self.state().registered = true;

        let granted = resp
            .header_all("Contact")
            .find_map(|c| sip::header_param(c, "expires").and_then(|v| v.parse().ok()))
            .or_else(|| resp.header("Expires").and_then(|v| v.parse().ok()))
            .unwrap_or(REGISTER_EXPIRES);
        tracing::info!("Registered {} (expires {}s)", self.account.aor(), granted);
        Ok(granted)
    }

    fn schedule_refresh(self: &Arc<Self>, expires: u32) {
        // Refresh at 90% of the granted lifetime.
        let delay = Duration::from_secs(u64::from(expires.max(10)) * 9 / 10);
        let ua = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(ua) = ua.upgrade() else { return };
            match ua.register_once().await {
                Ok(expires) => ua.schedule_refresh(expires),
                Err(e) => {
                    tracing::warn!("Registration refresh failed: {}", e);
                    ua.emit(SignalEvent::RegistrationLost {
                        reason: e.to_string(),
                    });
                }
            }
        });
        if let Some(old) = lock(&self.refresh_task).replace(task) {
            old.abort();
        }
    }

    fn in_dialog_request(&self, call_id: &str, dialog: &Dialog, method: &str, cseq: u32) -> SipMessage {
        let mut req = SipMessage::request(method, dialog.remote_target.clone());
        req.add_header("Via", &self.via(&sip::new_branch()));
        req.add_header("Max-Forwards", "70");
        for route in &dialog.route_set {
            req.add_header("Route", route);
        }
        req.add_header("From", &format!("{};tag={}", dialog.local_uri, dialog.local_tag));
        match &dialog.remote_tag {
            Some(tag) => req.add_header("To", &format!("{};tag={}", dialog.remote_uri, tag)),
            None => req.add_header("To", &dialog.remote_uri),
        }
        req.add_header("Call-ID", call_id);
        req.add_header("CSeq", &format!("{} {}", cseq, method));
        if matches!(method, "INVITE" | "REFER") {
            req.add_header("Contact", &self.contact());
        }
        req.add_header("User-Agent", USER_AGENT);
        req
    }

    /// ACK for a non-2xx final response: same branch and route as the INVITE.
    fn ack_for_failure(invite: &SipMessage, resp: &SipMessage) -> SipMessage {
        let mut ack = SipMessage::request("ACK", invite.uri().unwrap_or_default().to_string());
        if let Some(via) = invite.header("Via") {
            ack.add_header("Via", via);
        }
        ack.add_header("Max-Forwards", "70");
        for route in invite.header_all("Route") {
            ack.add_header("Route", route);
        }
        for name in ["From", "To", "Call-ID"] {
            let source = if name == "To" { resp } else { invite };
            if let Some(v) = source.header(name) {
                ack.add_header(name, v);
            }
        }
        let cseq = invite.cseq().map(|(n, _)| n).unwrap_or(1);
        ack.add_header("CSeq", &format!("{} ACK", cseq));
        ack
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        let msg = match SipMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping unparseable SIP message: {:#}", e);
                return;
            }
        };

        if msg.is_request() {
            if let Err(e) = self.handle_request(msg).await {
                tracing::warn!("Failed to answer SIP request: {}", e);
            }
            return;
        }

        let Some((_, method)) = msg.cseq() else {
            tracing::debug!("Response without CSeq dropped");
            return;
        };
        if method == "INVITE" {
            if let Err(e) = self.handle_invite_response(msg).await {
                tracing::warn!("Failed to handle INVITE response: {}", e);
            }
            return;
        }
        if msg.status().unwrap_or_default() < 200 {
            return;
        }
        let key = pending_key(msg.branch().unwrap_or_default(), method);
        let waiter = self.state().pending.remove(&key);
        match waiter {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => tracing::debug!("Stray response for {}", key),
        }
    }

    async fn handle_invite_response(self: &Arc<Self>, resp: SipMessage) -> Result<(), ConnectionError> {
        let call_id = resp.call_id().unwrap_or_default().to_string();
        let code = resp.status().unwrap_or_default();
        let sdp = (!resp.body.trim().is_empty()).then(|| resp.body.clone());

        let (to_send, event) = {
            let mut state = self.state();
            let Some(dialog) = state.dialogs.get_mut(&call_id).filter(|d| d.outbound) else {
                tracing::debug!("INVITE response for unknown call {}", call_id);
                return Ok(());
            };

            match code {
                100 => (None, None),
                101..=199 => {
                    if let Some(tag) = resp.to_tag() {
                        dialog.remote_tag = Some(tag.to_string());
                    }
                    (
                        None,
                        Some(SignalEvent::Progress {
                            call_id: call_id.clone(),
                            code,
                            sdp,
                        }),
                    )
                }
                200..=299 => {
                    let first = !dialog.confirmed;
                    dialog.confirmed = true;
                    dialog.remote_tag = resp.to_tag().map(str::to_string);
                    if let Some(target) = contact_uri(&resp) {
                        dialog.remote_target = target;
                    }
                    if first {
                        dialog.route_set = record_routes(&resp).into_iter().rev().collect();
                    }
                    let cseq = dialog.invite.cseq().map(|(n, _)| n).unwrap_or(1);
                    let mut ack = self.in_dialog_request(&call_id, dialog, "ACK", cseq);
                    ack.remove_header("User-Agent");
                    let event = first.then(|| SignalEvent::Answered {
                        call_id: call_id.clone(),
                        sdp,
                    });
                    (Some(ack), event)
                }
                401 | 407 if !dialog.auth_attempted => {
                    dialog.auth_attempted = true;
                    let ack = Self::ack_for_failure(&dialog.invite, &resp);
                    (Some(ack), None)
                }
                _ => {
                    let ack = Self::ack_for_failure(&dialog.invite, &resp);
                    state.dialogs.remove(&call_id);
                    (
                        Some(ack),
                        Some(SignalEvent::Failed {
                            call_id: call_id.clone(),
                            code,
                            reason: resp.reason().to_string(),
                        }),
                    )
                }
            }
        };

        if let Some(msg) = to_send {
            self.send(&msg).await?;
        }
        if let Some(event) = event {
            self.emit(event);
        }
        if code == 401 || code == 407 {
            self.retry_invite_with_credentials(&call_id, &resp).await?;
        }
        Ok(())
    }

    async fn retry_invite_with_credentials(&self, call_id: &str, challenge: &SipMessage) -> Result<(), ConnectionError> {
        let invite = {
            let state = self.state();
            match state.dialogs.get(call_id) {
                Some(d) => d.invite.clone(),
                None => return Ok(()),
            }
        };
        let retry = self
            .authorize(&invite, challenge, 1)
            .ok_or_else(|| ConnectionError::Transport("unusable auth challenge".into()))?;
        if let Some(dialog) = self.state().dialogs.get_mut(call_id) {
            dialog.invite = retry.clone();
        }
        self.send(&retry).await
    }

    async fn respond(&self, req: &SipMessage, code: u16, to_tag: Option<&str>) -> Result<(), ConnectionError> {
        let mut resp = SipMessage::response_to(req, code, sip::reason_phrase(code), to_tag);
        resp.add_header("User-Agent", USER_AGENT);
        if code == 200 && req.method() == Some("OPTIONS") {
            resp.add_header("Allow", ALLOW);
            resp.add_header("Accept", "application/sdp");
        }
        self.send(&resp).await
    }

    async fn handle_request(self: &Arc<Self>, req: SipMessage) -> Result<(), ConnectionError> {
        let method = req.method().unwrap_or_default().to_string();
        let call_id = req.call_id().unwrap_or_default().to_string();

        match method.as_str() {
            "INVITE" => self.handle_invite(req, call_id).await,
            "ACK" => {
                tracing::debug!("ACK for {}", call_id);
                Ok(())
            }
            "BYE" => {
                let dialog = self.state().dialogs.remove(&call_id);
                match dialog {
                    Some(dialog) => {
                        self.respond(&req, 200, Some(&dialog.local_tag)).await?;
                        self.emit(SignalEvent::RemoteHangup {
                            call_id,
                            reason: "remote hangup".into(),
                        });
                        Ok(())
                    }
                    None => self.respond(&req, 481, None).await,
                }
            }
            "CANCEL" => {
                let dialog = self.take_unanswered_inbound(&call_id);
                match dialog {
                    Some(dialog) => {
                        self.respond(&req, 200, None).await?;
                        self.respond(&dialog.invite, 487, Some(&dialog.local_tag)).await?;
                        self.emit(SignalEvent::RemoteHangup {
                            call_id,
                            reason: "cancelled".into(),
                        });
                        Ok(())
                    }
                    None => self.respond(&req, 481, None).await,
                }
            }
            "NOTIFY" => {
                self.respond(&req, 200, None).await?;
                let is_refer = req
                    .header("Event")
                    .is_some_and(|e| e.trim().to_ascii_lowercase().starts_with("refer"));
                if is_refer {
                    // sipfrag body: "SIP/2.0 200 OK"
                    let code = req
                        .body
                        .split_whitespace()
                        .nth(1)
                        .and_then(|c| c.parse::<u16>().ok())
                        .unwrap_or(0);
                    if code >= 200 {
                        self.emit(SignalEvent::TransferResult {
                            call_id,
                            success: code < 300,
                        });
                    }
                }
                Ok(())
            }
            "OPTIONS" | "INFO" => self.respond(&req, 200, None).await,
            _ => self.respond(&req, 501, None).await,
        }
    }

    async fn handle_invite(self: &Arc<Self>, req: SipMessage, call_id: String) -> Result<(), ConnectionError> {
        enum Existing {
            New,
            Retransmission,
            Reinvite { local_tag: String, sdp: Option<String> },
        }

        let existing = {
            let state = self.state();
            match state.dialogs.get(&call_id) {
                None => Existing::New,
                Some(d) if d.confirmed && req.to_tag().is_some() => Existing::Reinvite {
                    local_tag: d.local_tag.clone(),
                    sdp: d.local_sdp.clone(),
                },
                Some(_) => Existing::Retransmission,
            }
        };

        match existing {
            Existing::Retransmission => Ok(()),
            Existing::Reinvite { local_tag, sdp } => {
                // Session refresh or remote hold: keep our description.
                let mut resp = SipMessage::response_to(&req, 200, "OK", Some(&local_tag));
                resp.add_header("Contact", &self.contact());
                if let Some(sdp) = sdp {
                    resp.set_body("application/sdp", sdp);
                }
                self.send(&resp).await
            }
            Existing::New => {
                let from = req.header("From").and_then(NameAddr::parse);
                let from_number = from
                    .as_ref()
                    .and_then(|f| f.user())
                    .unwrap_or("anonymous")
                    .to_string();
                let display_name = from.as_ref().and_then(|f| f.display_name.clone());
                let local_tag = sip::new_tag();
                let dialog = Dialog {
                    outbound: false,
                    local_tag: local_tag.clone(),
                    remote_tag: req.from_tag().map(str::to_string),
                    local_uri: req
                        .header("To")
                        .and_then(NameAddr::parse)
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| format!("<{}>", self.account.aor())),
                    remote_uri: from.as_ref().map(|f| f.to_string()).unwrap_or_default(),
                    remote_target: contact_uri(&req).unwrap_or_default(),
                    route_set: record_routes(&req),
                    local_cseq: 0,
                    invite: req.clone(),
                    local_sdp: None,
                    confirmed: false,
                    auth_attempted: false,
                };
                self.state().dialogs.insert(call_id.clone(), dialog);

                self.respond(&req, 180, Some(&local_tag)).await?;
                let sdp = (!req.body.trim().is_empty()).then(|| req.body.clone());
                self.emit(SignalEvent::IncomingCall {
                    call_id,
                    from_number,
                    display_name,
                    sdp,
                });
                Ok(())
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut reader: SocketReader) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        let reason = loop {
            tokio::select! {
                frame = reader.recv_frame() => match frame {
                    Ok(Some(Frame::Text(text))) => self.handle_text(&text).await,
                    Ok(Some(Frame::Ping(data))) => {
                        if let Some(w) = self.writer.lock().await.as_mut() {
                            if let Err(e) = w.pong(data).await {
                                break format!("{:#}", e);
                            }
                        }
                    }
                    Ok(None) => break "closed by proxy".to_string(),
                    Err(e) => break format!("{:#}", e),
                },
                _ = keepalive.tick() => {
                    if let Some(w) = self.writer.lock().await.as_mut() {
                        if let Err(e) = w.ping().await {
                            break format!("{:#}", e);
                        }
                    }
                }
            }
        };

        self.writer.lock().await.take();
        let calls: Vec<String> = {
            let mut state = self.state();
            state.pending.clear();
            state.registered = false;
            state.dialogs.drain().map(|(id, _)| id).collect()
        };
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
        for call_id in calls {
            self.emit(SignalEvent::RemoteHangup {
                call_id,
                reason: "signaling lost".into(),
            });
        }
        self.emit(SignalEvent::TransportLost { reason });
    }

    fn take_unanswered_inbound(&self, call_id: &str) -> Option<Dialog> {
        let mut state = self.state();
        let unanswered = state
            .dialogs
            .get(call_id)
            .is_some_and(|d| !d.outbound && !d.confirmed);
        if unanswered {
            state.dialogs.remove(call_id)
        } else {
            None
        }
    }

    fn dialog_request(&self, call_id: &str, method: &str) -> Result<SipMessage, ConnectionError> {
        let mut state = self.state();
        let dialog = state
            .dialogs
            .get_mut(call_id)
            .filter(|d| d.confirmed)
            .ok_or_else(|| ConnectionError::UnknownDialog(call_id.to_string()))?;
        dialog.local_cseq += 1;
        let cseq = dialog.local_cseq;
        Ok(self.in_dialog_request(call_id, dialog, method, cseq))
    }

    async fn transact_ok(&self, req: SipMessage) -> Result<(), ConnectionError> {
        let method = req.method().unwrap_or_default().to_string();
        let resp = self.transact(req).await?;
        let code = resp.status().unwrap_or_default();
        if (200..300).contains(&code) {
            Ok(())
        } else {
            Err(ConnectionError::Rejected {
                method,
                code,
                reason: resp.reason().to_string(),
            })
        }
    }
}

#[async_trait]
impl SignalingTransport for SipWsTransport {
    async fn open(&self) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if let Some(task) = lock(&inner.reader_task).take() {
            task.abort();
        }
        let (writer, reader) = websocket::connect(&inner.account.ws_url)
            .await
            .map_err(|e| ConnectionError::Transport(format!("{:#}", e)))?;
        *inner.writer.lock().await = Some(writer);
        let task = tokio::spawn(inner.clone().run_reader(reader));
        *lock(&inner.reader_task) = Some(task);
        Ok(())
    }

    async fn register(&self) -> Result<(), ConnectionError> {
        let expires = self.inner.register_once().await?;
        self.inner.schedule_refresh(expires);
        Ok(())
    }

    async fn unregister(&self) -> Result<(), ConnectionError> {
        if let Some(task) = lock(&self.inner.refresh_task).take() {
            task.abort();
        }
        if !self.inner.state().registered {
            return Ok(());
        }
        let resp = self.inner.transact(self.inner.build_register(0)).await?;
        self.inner.state().registered = false;
        match resp.status() {
            Some(200..=299) => {
                tracing::info!("Unregistered {}", self.inner.account.aor());
                Ok(())
            }
            _ => Err(ConnectionError::Registration {
                code: resp.status().unwrap_or_default(),
                reason: resp.reason().to_string(),
            }),
        }
    }

    async fn close(&self) {
        self.inner.abort_tasks();
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            writer.close().await;
        }
        let mut state = self.inner.state();
        state.pending.clear();
        state.dialogs.clear();
        state.registered = false;
    }

    async fn invite(&self, call_id: &str, target: &str, sdp: &str) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let target_uri = inner.account.target_uri(target);
        let mut dialog = Dialog {
            outbound: true,
            local_tag: sip::new_tag(),
            remote_tag: None,
            local_uri: inner.local_name_addr(),
            remote_uri: format!("<{}>", target_uri),
            remote_target: target_uri,
            route_set: Vec::new(),
            local_cseq: 1,
            invite: SipMessage::request("INVITE", ""),
            local_sdp: Some(sdp.to_string()),
            confirmed: false,
            auth_attempted: false,
        };
        let mut req = inner.in_dialog_request(call_id, &dialog, "INVITE", 1);
        req.add_header("Allow", ALLOW);
        req.add_header("Supported", "replaces");
        req.set_body("application/sdp", sdp);
        dialog.invite = req.clone();

        {
            let mut state = inner.state();
            if state.dialogs.contains_key(call_id) {
                return Err(ConnectionError::Transport(format!("duplicate Call-ID {}", call_id)));
            }
            state.dialogs.insert(call_id.to_string(), dialog);
        }

        if let Err(e) = inner.send(&req).await {
            inner.state().dialogs.remove(call_id);
            return Err(e);
        }
        Ok(())
    }

    async fn cancel(&self, call_id: &str) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let invite = {
            let state = inner.state();
            let dialog = state
                .dialogs
                .get(call_id)
                .filter(|d| d.outbound && !d.confirmed)
                .ok_or_else(|| ConnectionError::UnknownDialog(call_id.to_string()))?;
            dialog.invite.clone()
        };

        let mut cancel = SipMessage::request("CANCEL", invite.uri().unwrap_or_default().to_string());
        if let Some(via) = invite.header("Via") {
            cancel.add_header("Via", via);
        }
        cancel.add_header("Max-Forwards", "70");
        for route in invite.header_all("Route") {
            cancel.add_header("Route", route);
        }
        for name in ["From", "To", "Call-ID"] {
            if let Some(v) = invite.header(name) {
                cancel.add_header(name, v);
            }
        }
        let cseq = invite.cseq().map(|(n, _)| n).unwrap_or(1);
        cancel.add_header("CSeq", &format!("{} CANCEL", cseq));
        cancel.add_header("User-Agent", USER_AGENT);

        // The 487 to the INVITE removes the dialog.
        let resp = inner.wait_response(&cancel).await?;
        match resp.status() {
            Some(200..=299) => Ok(()),
            code => Err(ConnectionError::Rejected {
                method: "CANCEL".into(),
                code: code.unwrap_or_default(),
                reason: resp.reason().to_string(),
            }),
        }
    }

    async fn accept(&self, call_id: &str, sdp: &str) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let resp = {
            let mut state = inner.state();
            let dialog = state
                .dialogs
                .get_mut(call_id)
                .filter(|d| !d.outbound && !d.confirmed)
                .ok_or_else(|| ConnectionError::UnknownDialog(call_id.to_string()))?;
            let mut resp = SipMessage::response_to(&dialog.invite, 200, "OK", Some(&dialog.local_tag));
            for rr in dialog.invite.header_all("Record-Route") {
                resp.add_header("Record-Route", rr);
            }
            resp.add_header("Contact", &inner.contact());
            resp.add_header("Allow", ALLOW);
            resp.add_header("User-Agent", USER_AGENT);
            resp.set_body("application/sdp", sdp);
            dialog.confirmed = true;
            dialog.local_sdp = Some(sdp.to_string());
            resp
        };
        inner.send(&resp).await
    }

    async fn reject(&self, call_id: &str, code: u16) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let dialog = inner
            .take_unanswered_inbound(call_id)
            .ok_or_else(|| ConnectionError::UnknownDialog(call_id.to_string()))?;
        inner.respond(&dialog.invite, code, Some(&dialog.local_tag)).await
    }

    async fn bye(&self, call_id: &str) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let req = inner.dialog_request(call_id, "BYE")?;
        inner.state().dialogs.remove(call_id);
        match inner.transact(req).await {
            Ok(resp) if resp.status() != Some(200) => {
                tracing::debug!("BYE answered {} {}", resp.status().unwrap_or_default(), resp.reason());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn refer(&self, call_id: &str, target: &str) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let mut req = inner.dialog_request(call_id, "REFER")?;
        req.add_header("Refer-To", &format!("<{}>", inner.account.target_uri(target)));
        req.add_header("Referred-By", &format!("<{}>", inner.account.aor()));
        inner.transact_ok(req).await
    }

    async fn send_dtmf(&self, call_id: &str, digit: char) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let mut req = inner.dialog_request(call_id, "INFO")?;
        req.set_body(
            "application/dtmf-relay",
            format!("Signal={}\r\nDuration=160\r\n", digit),
        );
        inner.transact_ok(req).await
    }
}
