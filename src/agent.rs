//! Agent session: one logged-in agent's telephony control plane.
//!
//! Owns the signaling connection, the call façade and the presence
//! synchronizer for the lifetime of a login, and routes user agent events to
//! whichever of them reacts to it.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{self, ApiClient, ContactDirectory, RestCallLog, RestPresenceStore, RestQueueDirectory, TelephonyConfig};
use crate::auth::{SessionAuth, StoredToken, TokenStore};
use crate::calling::call_log::CallLogger;
use crate::calling::caller_id::CallerIdResolver;
use crate::calling::control::CallControl;
use crate::calling::media::{LoggingSink, MediaController, PlaybackSink};
use crate::calling::session::CallSession;
use crate::config::Config;
use crate::error::PresenceError;
use crate::presence::{
    BreakDefinition, PresenceStatus, PresenceStore, QueueControl, QueueDirectory, QueuePresenceSync, SyncReport,
};
use crate::signaling::ua::SipWsTransport;
use crate::signaling::{ConnectionManager, SignalEvent, SignalingTransport};
use crate::switch::AmiClient;

/// Everything an agent session is built from.
pub struct SessionParts {
    pub agent_id: String,
    pub auth: Arc<SessionAuth>,
    pub transport: Arc<dyn SignalingTransport>,
    pub events: mpsc::UnboundedReceiver<SignalEvent>,
    pub resolver: Arc<dyn CallerIdResolver>,
    pub call_log: Arc<dyn CallLogger>,
    pub directory: Arc<dyn QueueDirectory>,
    pub queue_control: Arc<dyn QueueControl>,
    pub store: Arc<dyn PresenceStore>,
    pub sink: Arc<dyn PlaybackSink>,
    pub breaks: Vec<BreakDefinition>,
}

pub struct AgentSession {
    auth: Arc<SessionAuth>,
    connection: Arc<ConnectionManager>,
    calls: Arc<CallControl>,
    presence: QueuePresenceSync,
    breaks: Vec<BreakDefinition>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    /// Fetch the telephony config and wire the session against the backend.
    /// Nothing is connected until [`AgentSession::start`].
    pub async fn login(config: &Config) -> Result<Arc<Self>> {
        let client = ApiClient::from_config(config)?;
        let agent_id = config.agent_id()?.to_string();
        let token: StoredToken = config
            .get_session_token()
            .context("No session token. Run 'agent-desk login' first.")?;
        let switch = config
            .switch
            .clone()
            .context("No switch endpoint configured (add a [switch] section to the config file)")?;

        let telephony = TelephonyConfig::fetch(&client).await?;
        tracing::info!("Telephony config received for {}", telephony.account().aor());

        let breaks = match api::agent_status::list_breaks(&client).await {
            Ok(breaks) => breaks,
            Err(e) => {
                tracing::warn!("Break catalog unavailable: {:#}", e);
                Vec::new()
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = Arc::new(SipWsTransport::new(telephony.account(), events_tx));

        Ok(Self::assemble(SessionParts {
            agent_id,
            auth: Arc::new(SessionAuth::new(Some(token))),
            transport,
            events,
            resolver: Arc::new(ContactDirectory::new(client.clone())),
            call_log: Arc::new(RestCallLog::new(client.clone())),
            directory: Arc::new(RestQueueDirectory::new(client.clone())),
            queue_control: Arc::new(AmiClient::new(switch)),
            store: Arc::new(RestPresenceStore::new(client)),
            sink: Arc::new(LoggingSink),
            breaks,
        }))
    }

    pub fn assemble(parts: SessionParts) -> Arc<Self> {
        let connection = ConnectionManager::new(parts.auth.clone());
        connection.initialize(parts.transport);

        let calls = CallControl::new(
            CallSession::new(),
            MediaController::new(parts.sink),
            connection.clone(),
            parts.resolver,
            parts.call_log,
        );
        let presence = QueuePresenceSync::new(parts.agent_id, parts.directory, parts.queue_control, parts.store);
        let dispatcher = spawn_dispatcher(parts.events, connection.clone(), calls.clone());

        Arc::new(Self {
            auth: parts.auth,
            connection,
            calls,
            presence,
            breaks: parts.breaks,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Connect and register, then put the agent off-queue on every queue.
    ///
    /// A failed first connect is not fatal: the connection manager keeps
    /// retrying in the background.
    pub async fn start(&self) {
        if let Err(e) = self.connection.connect().await {
            tracing::warn!("Signaling not connected yet: {}", e);
        }
        match self.presence.apply(PresenceStatus::OffQueue).await {
            Ok(report) if report.is_partial() => {
                tracing::warn!("{} queue(s) not set off-queue at login", report.failures.len());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Initial presence not applied: {}", e),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn calls(&self) -> &Arc<CallControl> {
        &self.calls
    }

    pub fn presence(&self) -> &QueuePresenceSync {
        &self.presence
    }

    pub fn breaks(&self) -> &[BreakDefinition] {
        &self.breaks
    }

    /// Resolve a status name typed by the agent, filling in the break id from
    /// the catalog when the name matches a configured break.
    pub fn resolve_status(&self, name: &str, break_id: Option<u32>) -> Result<PresenceStatus, PresenceError> {
        let break_id = break_id.or_else(|| {
            self.breaks
                .iter()
                .find(|b| b.name.eq_ignore_ascii_case(name.trim()))
                .map(|b| b.id)
        });
        PresenceStatus::parse(name, break_id)
    }

    pub async fn set_presence(&self, name: &str, break_id: Option<u32>) -> Result<SyncReport, PresenceError> {
        let status = self.resolve_status(name, break_id)?;
        self.presence.apply(status).await
    }

    /// End the session. Nothing here can fail the logout; every step is
    /// attempted and problems are only logged.
    pub async fn logout(&self) {
        tracing::info!("Logging out agent {}", self.presence.presence().agent_id);
        self.auth.revoke();

        if self.calls.session().live().is_some() {
            if let Err(e) = self.calls.end().await {
                tracing::warn!("Call not ended cleanly at logout: {}", e);
            }
        }

        self.connection.cleanup().await;

        let failures = self.presence.teardown().await;
        if !failures.is_empty() {
            tracing::warn!("{} queue(s) not left at logout", failures.len());
        }

        if let Some(handle) = self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.calls.session().reset();
    }
}

/// Route user agent events: connection-level losses go to the connection
/// manager, everything else to the call façade.
fn spawn_dispatcher(
    mut events: mpsc::UnboundedReceiver<SignalEvent>,
    connection: Arc<ConnectionManager>,
    calls: Arc<CallControl>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!("Signal event: {:?}", event);
            match event {
                SignalEvent::TransportLost { reason } => connection.on_transport_lost(&reason),
                SignalEvent::RegistrationLost { reason } => connection.on_registration_lost(&reason),
                other => calls.handle_signal(other).await,
            }
        }
        tracing::debug!("Signal event channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use crate::calling::call_log::NoCallLog;
    use crate::calling::caller_id::NoDirectory;
    use crate::calling::CallStatus;
    use crate::error::ConnectionError;
    use crate::presence::sync::tests::FakeBackend;
    use crate::signaling::ConnectionState;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Loopback {
        sent: Mutex<Vec<String>>,
    }

    impl Loopback {
        fn log(&self, entry: &str) {
            self.sent.lock().unwrap().push(entry.to_string());
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SignalingTransport for Loopback {
        async fn open(&self) -> Result<(), ConnectionError> {
            self.log("open");
            Ok(())
        }
        async fn register(&self) -> Result<(), ConnectionError> {
            self.log("register");
            Ok(())
        }
        async fn unregister(&self) -> Result<(), ConnectionError> {
            self.log("unregister");
            Ok(())
        }
        async fn close(&self) {
            self.log("close");
        }
        async fn invite(&self, _: &str, _: &str, _: &str) -> Result<(), ConnectionError> {
            self.log("invite");
            Ok(())
        }
        async fn cancel(&self, _: &str) -> Result<(), ConnectionError> {
            self.log("cancel");
            Ok(())
        }
        async fn accept(&self, _: &str, _: &str) -> Result<(), ConnectionError> {
            self.log("accept");
            Ok(())
        }
        async fn reject(&self, _: &str, code: u16) -> Result<(), ConnectionError> {
            self.log(&format!("reject {}", code));
            Ok(())
        }
        async fn bye(&self, _: &str) -> Result<(), ConnectionError> {
            self.log("bye");
            Ok(())
        }
        async fn refer(&self, _: &str, _: &str) -> Result<(), ConnectionError> {
            self.log("refer");
            Ok(())
        }
        async fn send_dtmf(&self, _: &str, _: char) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    struct Fixture {
        agent: Arc<AgentSession>,
        transport: Arc<Loopback>,
        backend: Arc<FakeBackend>,
        events: mpsc::UnboundedSender<SignalEvent>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(Loopback::default());
        let backend = FakeBackend::with_queues(&["sales", "support"]);
        let (events_tx, events) = mpsc::unbounded_channel();
        let agent = AgentSession::assemble(SessionParts {
            agent_id: "agent-7".into(),
            auth: Arc::new(SessionAuth::new(Some(StoredToken::new("t".into(), None)))),
            transport: transport.clone(),
            events,
            resolver: Arc::new(NoDirectory),
            call_log: Arc::new(NoCallLog),
            directory: backend.clone(),
            queue_control: backend.clone(),
            store: backend.clone(),
            sink: Arc::new(LoggingSink),
            breaks: vec![BreakDefinition {
                id: 3,
                name: "Lunch".into(),
            }],
        });
        Fixture {
            agent,
            transport,
            backend,
            events: events_tx,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_start_registers_and_goes_off_queue() {
        let f = fixture();
        f.agent.start().await;

        assert_eq!(f.agent.connection().state(), ConnectionState::Registered);
        assert_eq!(f.agent.presence().presence().status, PresenceStatus::OffQueue);
        let switch = f.backend.switch.lock().unwrap().clone();
        assert_eq!(switch.get("sales"), Some(&(true, Some("Off-Queue".to_string()))));
        assert_eq!(switch.len(), 2);
    }

    #[tokio::test]
    async fn test_break_id_resolved_from_catalog() {
        let f = fixture();
        f.agent.start().await;

        let report = f.agent.set_presence("lunch", None).await.unwrap();
        assert!(!report.is_partial());
        assert_eq!(
            f.agent.presence().presence().status,
            PresenceStatus::Break {
                id: 3,
                name: "lunch".into()
            }
        );
        assert!(matches!(
            f.agent.resolve_status("Coffee", None),
            Err(PresenceError::MissingBreakId(_))
        ));
    }

    #[tokio::test]
    async fn test_events_routed_to_call_control() {
        let f = fixture();
        f.agent.start().await;

        f.events
            .send(SignalEvent::IncomingCall {
                call_id: "in-1".into(),
                from_number: "5550100".into(),
                display_name: None,
                sdp: None,
            })
            .unwrap();
        settle().await;

        let call = f.agent.calls().status().unwrap();
        assert_eq!(call.id, "in-1");
        assert_eq!(call.status, CallStatus::Ringing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_routed_to_connection() {
        let f = fixture();
        f.agent.start().await;

        f.events
            .send(SignalEvent::TransportLost {
                reason: "socket closed".into(),
            })
            .unwrap();
        settle().await;
        assert_eq!(f.agent.connection().state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(f.agent.connection().state(), ConnectionState::Registered);
    }

    #[tokio::test]
    async fn test_logout_ends_call_and_leaves_queues() {
        let f = fixture();
        f.agent.start().await;
        f.agent.calls().dial("5550100").await.unwrap();

        f.agent.logout().await;

        let sent = f.transport.sent();
        assert!(sent.contains(&"cancel".to_string()));
        assert!(sent.contains(&"unregister".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("close"));
        assert!(!f.agent.auth.is_authenticated());
        assert!(f.backend.switch.lock().unwrap().is_empty());
        assert!(f.backend.rows.lock().unwrap().is_empty());
        assert_eq!(f.agent.connection().state(), ConnectionState::Disconnected);
        assert!(f.agent.calls().status().is_none());
    }
}
