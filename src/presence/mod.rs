//! Agent presence and switch queue membership.
//!
//! An agent is Ready, on a named break, or off-queue. Every queue the agent
//! belongs to mirrors that: Ready means unpaused with no reason, anything else
//! means paused with the status label as the reason.

pub mod sync;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PresenceError, QueueActionError};

pub use sync::{QueuePresenceSync, SyncReport};

/// Pause reason used while the agent is off-queue.
pub const OFF_QUEUE_LABEL: &str = "Off-Queue";
pub const READY_LABEL: &str = "Ready";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceStatus {
    Ready,
    Break { id: u32, name: String },
    OffQueue,
}

fn is_off_queue_name(name: &str) -> bool {
    let folded: String = name
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    folded == "offqueue"
}

impl PresenceStatus {
    /// Interpret a status name as typed by the agent or stored by the backend.
    ///
    /// A name that spells "Off-Queue" is the off-queue status, never a break;
    /// asking for it with a break id is refused.
    pub fn parse(name: &str, break_id: Option<u32>) -> Result<Self, PresenceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PresenceError::UnknownStatus(name.to_string()));
        }
        if name.eq_ignore_ascii_case(READY_LABEL) {
            return Ok(PresenceStatus::Ready);
        }
        if is_off_queue_name(name) {
            return match break_id {
                Some(_) => Err(PresenceError::ReservedBreakName(name.to_string())),
                None => Ok(PresenceStatus::OffQueue),
            };
        }
        match break_id {
            Some(id) => Ok(PresenceStatus::Break {
                id,
                name: name.to_string(),
            }),
            None => Err(PresenceError::MissingBreakId(name.to_string())),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            PresenceStatus::Ready => READY_LABEL,
            PresenceStatus::Break { name, .. } => name,
            PresenceStatus::OffQueue => OFF_QUEUE_LABEL,
        }
    }

    pub fn is_paused(&self) -> bool {
        !matches!(self, PresenceStatus::Ready)
    }

    pub fn pause_reason(&self) -> Option<&str> {
        self.is_paused().then(|| self.label())
    }

    pub fn break_id(&self) -> Option<u32> {
        match self {
            PresenceStatus::Break { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Presence of the logged-in agent. Starts off-queue at every login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPresence {
    pub agent_id: String,
    pub status: PresenceStatus,
}

impl AgentPresence {
    pub fn at_login(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: PresenceStatus::OffQueue,
        }
    }
}

/// Directory row for one (queue, interface) membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMembership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub queue_name: String,
    pub interface: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_reason: Option<String>,
}

impl QueueMembership {
    pub fn new(queue_name: &str, interface: &str, status: &PresenceStatus) -> Self {
        Self {
            id: None,
            queue_name: queue_name.to_string(),
            interface: interface.to_string(),
            paused: status.is_paused(),
            pause_reason: status.pause_reason().map(str::to_string),
        }
    }

    /// Whether the row already mirrors `status`.
    pub fn mirrors(&self, status: &PresenceStatus) -> bool {
        self.paused == status.is_paused() && self.pause_reason.as_deref() == status.pause_reason()
    }
}

/// An agent's device interface and the queues it serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQueues {
    pub interface: String,
    pub queues: Vec<String>,
}

/// Persisted agent status as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub current_status: String,
    #[serde(default)]
    pub break_id: Option<u32>,
}

impl StatusRecord {
    pub fn from_status(status: &PresenceStatus) -> Self {
        Self {
            current_status: status.label().to_string(),
            break_id: status.break_id(),
        }
    }
}

/// Administrator-defined break.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BreakDefinition {
    pub id: u32,
    pub name: String,
}

/// Backend directory of queues and membership rows.
#[async_trait]
pub trait QueueDirectory: Send + Sync {
    async fn agent_queues(&self, agent_id: &str) -> Result<AgentQueues, PresenceError>;
    async fn memberships(&self, interface: &str) -> Result<Vec<QueueMembership>, PresenceError>;
    async fn create_membership(&self, row: &QueueMembership) -> Result<QueueMembership, PresenceError>;
    async fn update_membership(&self, row: &QueueMembership) -> Result<(), PresenceError>;
    async fn delete_membership(&self, row: &QueueMembership) -> Result<(), PresenceError>;
}

/// Switch-side queue actions, keyed by (queue, interface).
#[async_trait]
pub trait QueueControl: Send + Sync {
    async fn add_member(
        &self,
        queue: &str,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<(), QueueActionError>;
    async fn remove_member(&self, queue: &str, interface: &str) -> Result<(), QueueActionError>;
    async fn pause_member(
        &self,
        queue: &str,
        interface: &str,
        paused: bool,
        reason: Option<&str>,
    ) -> Result<(), QueueActionError>;
}

/// Where the agent's declared status is recorded.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn save(&self, status: &PresenceStatus) -> Result<(), PresenceError>;
    async fn load(&self) -> Result<StatusRecord, PresenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statuses() {
        assert_eq!(PresenceStatus::parse("ready", None).unwrap(), PresenceStatus::Ready);
        assert_eq!(PresenceStatus::parse("Off-Queue", None).unwrap(), PresenceStatus::OffQueue);
        assert_eq!(PresenceStatus::parse("off queue", None).unwrap(), PresenceStatus::OffQueue);
        assert_eq!(
            PresenceStatus::parse(" Lunch ", Some(3)).unwrap(),
            PresenceStatus::Break {
                id: 3,
                name: "Lunch".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_ambiguous_input() {
        assert!(matches!(
            PresenceStatus::parse("Lunch", None),
            Err(PresenceError::MissingBreakId(_))
        ));
        assert!(matches!(
            PresenceStatus::parse("OFF-QUEUE", Some(9)),
            Err(PresenceError::ReservedBreakName(_))
        ));
        assert!(matches!(
            PresenceStatus::parse("  ", None),
            Err(PresenceError::UnknownStatus(_))
        ));
    }

    #[test]
    fn test_pause_reason_follows_status() {
        assert_eq!(PresenceStatus::Ready.pause_reason(), None);
        assert_eq!(PresenceStatus::OffQueue.pause_reason(), Some(OFF_QUEUE_LABEL));
        let lunch = PresenceStatus::Break {
            id: 3,
            name: "Lunch".into(),
        };
        assert_eq!(lunch.pause_reason(), Some("Lunch"));

        let row = QueueMembership::new("sales", "PJSIP/1001", &lunch);
        assert!(row.paused);
        assert!(row.mirrors(&lunch));
        assert!(!row.mirrors(&PresenceStatus::Ready));
        assert!(!row.mirrors(&PresenceStatus::OffQueue));
    }

    #[test]
    fn test_membership_wire_format() {
        let row: QueueMembership = serde_json::from_str(
            r#"{"id":"m1","queueName":"support","interface":"PJSIP/1001","paused":true,"pauseReason":"Lunch"}"#,
        )
        .unwrap();
        assert_eq!(row.queue_name, "support");
        assert_eq!(row.pause_reason.as_deref(), Some("Lunch"));

        let json = serde_json::to_value(QueueMembership::new("sales", "PJSIP/1001", &PresenceStatus::Ready)).unwrap();
        assert_eq!(json["pauseReason"], serde_json::Value::Null);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn test_login_defaults_to_off_queue() {
        assert_eq!(AgentPresence::at_login("a1").status, PresenceStatus::OffQueue);
    }
}
