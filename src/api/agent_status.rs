//! Agent status persistence and the break catalog

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use super::client::ApiClient;
use crate::error::PresenceError;
use crate::presence::{BreakDefinition, PresenceStatus, PresenceStore, StatusRecord};

const STATUS: &str = "/api/agent/status";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate<'a> {
    status: &'a str,
    break_id: Option<u32>,
}

impl<'a> StatusUpdate<'a> {
    fn from_status(status: &'a PresenceStatus) -> Self {
        Self {
            status: status.label(),
            break_id: status.break_id(),
        }
    }
}

pub struct RestPresenceStore {
    client: ApiClient,
}

impl RestPresenceStore {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

fn store_error(e: anyhow::Error) -> PresenceError {
    PresenceError::Store(format!("{:#}", e))
}

#[async_trait]
impl PresenceStore for RestPresenceStore {
    async fn save(&self, status: &PresenceStatus) -> Result<(), PresenceError> {
        self.client
            .put(STATUS, &StatusUpdate::from_status(status))
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn load(&self) -> Result<StatusRecord, PresenceError> {
        let resp = self.client.get(STATUS).await.map_err(store_error)?;
        resp.json()
            .await
            .context("Failed to parse agent status")
            .map_err(store_error)
    }
}

/// Breaks the agent may take, as configured by an administrator.
pub async fn list_breaks(client: &ApiClient) -> Result<Vec<BreakDefinition>> {
    let resp = client.get("/api/agent/breaks").await?;
    resp.json().await.context("Failed to parse break list")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_body() {
        let lunch = PresenceStatus::Break {
            id: 3,
            name: "Lunch".into(),
        };
        let body = serde_json::to_value(StatusUpdate::from_status(&lunch)).unwrap();
        assert_eq!(body, serde_json::json!({"status": "Lunch", "breakId": 3}));

        let body = serde_json::to_value(StatusUpdate::from_status(&PresenceStatus::OffQueue)).unwrap();
        assert_eq!(body, serde_json::json!({"status": "Off-Queue", "breakId": null}));
    }

    #[test]
    fn test_parse_status_record() {
        let record: StatusRecord =
            serde_json::from_str(r#"{"current_status":"Lunch","break_id":3}"#).unwrap();
        assert_eq!(record.break_id, Some(3));
        let record: StatusRecord = serde_json::from_str(r#"{"current_status":"Ready"}"#).unwrap();
        assert_eq!(record.break_id, None);
    }
}
