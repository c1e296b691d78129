//! Queue directory: the agent's queues and the membership rows

use anyhow::Context;
use async_trait::async_trait;

use super::client::ApiClient;
use crate::error::PresenceError;
use crate::presence::{AgentQueues, QueueDirectory, QueueMembership};

const MEMBERS: &str = "/api/queue-members";

pub struct RestQueueDirectory {
    client: ApiClient,
}

impl RestQueueDirectory {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

fn directory_error(e: anyhow::Error) -> PresenceError {
    PresenceError::Directory(format!("{:#}", e))
}

fn row_path(row: &QueueMembership) -> Result<String, PresenceError> {
    let id = row.id.as_deref().ok_or_else(|| {
        PresenceError::Directory(format!("membership row for {} has no id", row.queue_name))
    })?;
    Ok(format!("{}/{}", MEMBERS, super::segment(id)))
}

#[async_trait]
impl QueueDirectory for RestQueueDirectory {
    async fn agent_queues(&self, agent_id: &str) -> Result<AgentQueues, PresenceError> {
        let path = format!("/api/agents/{}/queues", super::segment(agent_id));
        let resp = self.client.get(&path).await.map_err(directory_error)?;
        resp.json()
            .await
            .context("Failed to parse agent queues")
            .map_err(directory_error)
    }

    async fn memberships(&self, interface: &str) -> Result<Vec<QueueMembership>, PresenceError> {
        let path = format!("{}?interface={}", MEMBERS, super::encode(interface));
        let resp = self.client.get(&path).await.map_err(directory_error)?;
        resp.json()
            .await
            .context("Failed to parse queue members")
            .map_err(directory_error)
    }

    async fn create_membership(&self, row: &QueueMembership) -> Result<QueueMembership, PresenceError> {
        let resp = self.client.post(MEMBERS, row).await.map_err(directory_error)?;
        resp.json()
            .await
            .context("Failed to parse created queue member")
            .map_err(directory_error)
    }

    async fn update_membership(&self, row: &QueueMembership) -> Result<(), PresenceError> {
        let path = row_path(row)?;
        self.client.put(&path, row).await.map_err(directory_error)?;
        Ok(())
    }

    async fn delete_membership(&self, row: &QueueMembership) -> Result<(), PresenceError> {
        let path = row_path(row)?;
        self.client.delete(&path).await.map_err(directory_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;

    #[test]
    fn test_row_path_requires_id() {
        let mut row = QueueMembership::new("sales", "PJSIP/1001", &PresenceStatus::Ready);
        assert!(matches!(row_path(&row), Err(PresenceError::Directory(_))));

        row.id = Some("m 1".into());
        assert_eq!(row_path(&row).unwrap(), "/api/queue-members/m%201");
    }

    #[test]
    fn test_parse_agent_queues() {
        let agent: AgentQueues =
            serde_json::from_str(r#"{"interface":"PJSIP/1001","queues":["sales","support"]}"#).unwrap();
        assert_eq!(agent.queues.len(), 2);
    }
}
