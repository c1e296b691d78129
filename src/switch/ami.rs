//! Manager-interface client implementing [`QueueControl`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::QueueActionError;
use crate::presence::QueueControl;

pub const DEFAULT_PORT: u16 = 5038;
const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub secret: String,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// One `Key: Value` block. Keys are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block(HashMap<String, String>);

impl Block {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    fn is_success(&self) -> bool {
        self.get("Response")
            .is_some_and(|r| r.eq_ignore_ascii_case("Success"))
    }
}

/// Read one block, skipping leading blank lines. `None` at EOF.
pub async fn read_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Block>> {
    let mut fields = HashMap::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.context("Manager read failed")?;
        if n == 0 {
            return Ok((!fields.is_empty()).then_some(Block(fields)));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if fields.is_empty() {
                continue;
            }
            return Ok(Some(Block(fields)));
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
}

pub fn format_action(action: &str, action_id: &str, fields: &[(&str, &str)]) -> String {
    let mut out = format!("Action: {}\r\nActionID: {}\r\n", action, action_id);
    for (key, value) in fields {
        out.push_str(&format!("{}: {}\r\n", key, value));
    }
    out.push_str("\r\n");
    out
}

/// Map a switch error message to the queue action outcome.
pub fn classify(message: &str) -> QueueActionError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("already there") {
        QueueActionError::AlreadyMember
    } else if lower.contains("not there") || lower.contains("interface not found") {
        QueueActionError::NotMember
    } else {
        QueueActionError::Rejected(message.to_string())
    }
}

/// An authenticated manager session over any byte stream.
pub struct AmiSession<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AmiSession<S> {
    /// Read the banner and log in.
    pub async fn login(stream: S, username: &str, secret: &str, action_id: &str) -> Result<Self> {
        let mut stream = BufReader::new(stream);
        let mut banner = String::new();
        stream
            .read_line(&mut banner)
            .await
            .context("Manager banner not received")?;
        tracing::debug!("Manager banner: {}", banner.trim());

        let mut session = Self { stream };
        let resp = session
            .action("Login", action_id, &[("Username", username), ("Secret", secret)])
            .await?;
        if !resp.is_success() {
            bail!(
                "Manager login refused: {}",
                resp.get("Message").unwrap_or("no message")
            );
        }
        Ok(session)
    }

    /// Send an action and return the response carrying its ActionID.
    /// Unsolicited events read in between are dropped.
    pub async fn action(&mut self, action: &str, action_id: &str, fields: &[(&str, &str)]) -> Result<Block> {
        let text = format_action(action, action_id, fields);
        self.stream
            .get_mut()
            .write_all(text.as_bytes())
            .await
            .context("Manager write failed")?;

        loop {
            let block = read_block(&mut self.stream)
                .await?
                .context("Manager connection closed")?;
            if block.get("Response").is_some() && block.get("ActionID") == Some(action_id) {
                return Ok(block);
            }
            tracing::trace!("Manager block skipped: {:?}", block);
        }
    }
}

pub struct AmiClient {
    config: AmiConfig,
    session: tokio::sync::Mutex<Option<AmiSession<TcpStream>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl AmiClient {
    pub fn new(config: AmiConfig) -> Self {
        Self::with_timeout(config, ACTION_TIMEOUT)
    }

    /// Bounds both the connect-and-login step and each action.
    pub fn with_timeout(config: AmiConfig, timeout: Duration) -> Self {
        Self {
            config,
            session: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    fn action_id(&self) -> String {
        format!("agent-desk-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn connect(&self) -> Result<AmiSession<TcpStream>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        tracing::info!("Connecting to switch manager at {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        AmiSession::login(stream, &self.config.username, &self.config.secret, &self.action_id()).await
    }

    /// Run one action, connecting first if needed. The session is dropped on
    /// any transport error so the next action reconnects.
    async fn run(&self, action: &str, fields: &[(&str, &str)]) -> Result<(), QueueActionError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let session = match tokio::time::timeout(self.timeout, self.connect()).await {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => return Err(QueueActionError::Transport(format!("{:#}", e))),
                Err(_) => {
                    return Err(QueueActionError::Transport(format!(
                        "Manager login at {}:{} timed out",
                        self.config.host, self.config.port
                    )))
                }
            };
            *guard = Some(session);
        }
        let Some(session) = guard.as_mut() else {
            return Err(QueueActionError::Transport("no manager session".into()));
        };

        let action_id = self.action_id();
        let outcome = tokio::time::timeout(self.timeout, session.action(action, &action_id, fields)).await;
        let block = match outcome {
            Ok(Ok(block)) => block,
            Ok(Err(e)) => {
                *guard = None;
                return Err(QueueActionError::Transport(format!("{:#}", e)));
            }
            Err(_) => {
                *guard = None;
                return Err(QueueActionError::Transport(format!("{} timed out", action)));
            }
        };

        if block.is_success() {
            tracing::debug!("{} ok ({:?})", action, fields.first());
            Ok(())
        } else {
            Err(classify(block.get("Message").unwrap_or("no message")))
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl QueueControl for AmiClient {
    async fn add_member(
        &self,
        queue: &str,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<(), QueueActionError> {
        let mut fields = vec![
            ("Queue", queue),
            ("Interface", interface),
            ("Paused", yes_no(paused)),
        ];
        if let Some(reason) = reason {
            fields.push(("Reason", reason));
        }
        self.run("QueueAdd", &fields).await
    }

    async fn remove_member(&self, queue: &str, interface: &str) -> Result<(), QueueActionError> {
        self.run("QueueRemove", &[("Queue", queue), ("Interface", interface)])
            .await
    }

    async fn pause_member(
        &self,
        queue: &str,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<(), QueueActionError> {
        let mut fields = vec![
            ("Queue", queue),
            ("Interface", interface),
            ("Paused", yes_no(paused)),
        ];
        if let Some(reason) = reason {
            fields.push(("Reason", reason));
        }
        self.run("QueuePause", &fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_block_skips_blank_lines() {
        let data = b"\r\n\r\nResponse: Error\r\nActionID: 7\r\nMessage: Unable to add interface: Already there\r\n\r\nEvent: Foo\r\n";
        let mut reader = BufReader::new(&data[..]);

        let block = read_block(&mut reader).await.unwrap().unwrap();
        assert_eq!(block.get("response"), Some("Error"));
        assert_eq!(block.get("ACTIONID"), Some("7"));

        // Trailing block without terminator is still returned at EOF.
        let tail = read_block(&mut reader).await.unwrap().unwrap();
        assert_eq!(tail.get("Event"), Some("Foo"));
        assert!(read_block(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_classify_switch_messages() {
        assert_eq!(
            classify("Unable to add interface: Already there"),
            QueueActionError::AlreadyMember
        );
        assert_eq!(
            classify("Unable to remove interface: Not there"),
            QueueActionError::NotMember
        );
        assert_eq!(classify("Interface not found"), QueueActionError::NotMember);
        assert_eq!(
            classify("Unable to add interface to queue: No such queue"),
            QueueActionError::Rejected("Unable to add interface to queue: No such queue".into())
        );
    }

    #[test]
    fn test_format_action() {
        assert_eq!(
            format_action("QueueRemove", "a-1", &[("Queue", "sales"), ("Interface", "PJSIP/1001")]),
            "Action: QueueRemove\r\nActionID: a-1\r\nQueue: sales\r\nInterface: PJSIP/1001\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_login_and_action_skip_events() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Asterisk Call Manager/5.0.1\r\n")
            .write(format_action("Login", "l1", &[("Username", "desk"), ("Secret", "pw")]).as_bytes())
            .read(b"Response: Success\r\nActionID: l1\r\nMessage: Authentication accepted\r\n\r\n")
            .write(format_action("QueuePause", "q1", &[("Queue", "sales"), ("Interface", "PJSIP/1001"), ("Paused", "true")]).as_bytes())
            .read(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n")
            .read(b"Response: Error\r\nActionID: q1\r\nMessage: Interface not found\r\n\r\n")
            .build();

        let mut session = AmiSession::login(mock, "desk", "pw", "l1").await.unwrap();
        let block = session
            .action(
                "QueuePause",
                "q1",
                &[("Queue", "sales"), ("Interface", "PJSIP/1001"), ("Paused", "true")],
            )
            .await
            .unwrap();
        assert!(!block.is_success());
        assert_eq!(classify(block.get("Message").unwrap()), QueueActionError::NotMember);
    }

    #[tokio::test]
    async fn test_login_refused() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Asterisk Call Manager/5.0.1\r\n")
            .write(format_action("Login", "l1", &[("Username", "desk"), ("Secret", "bad")]).as_bytes())
            .read(b"Response: Error\r\nActionID: l1\r\nMessage: Authentication failed\r\n\r\n")
            .build();

        let err = AmiSession::login(mock, "desk", "bad", "l1").await.err().unwrap();
        assert!(format!("{:#}", err).contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_silent_manager_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            // Accept and never send a banner.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = AmiClient::with_timeout(
            AmiConfig {
                host: "127.0.0.1".into(),
                port,
                username: "desk".into(),
                secret: "pw".into(),
            },
            Duration::from_millis(200),
        );
        let result = client.add_member("sales", "PJSIP/1001", false, None).await;
        assert!(matches!(result, Err(QueueActionError::Transport(_))));
        assert!(client.session.lock().await.is_none());
        server.abort();
    }
}
