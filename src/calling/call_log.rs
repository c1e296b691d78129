//! Fire-and-forget call logging.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Call, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallLogKind {
    Start,
    End,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallLogEntry {
    pub kind: CallLogKind,
    pub call_id: String,
    pub direction: Direction,
    pub number: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl CallLogEntry {
    pub fn start(call: &Call) -> Self {
        Self {
            kind: CallLogKind::Start,
            call_id: call.id.clone(),
            direction: call.direction,
            number: call.remote_number.clone(),
            timestamp: call.created_at,
            status: None,
            duration_seconds: None,
        }
    }

    pub fn end(call: &Call) -> Self {
        Self {
            kind: CallLogKind::End,
            call_id: call.id.clone(),
            direction: call.direction,
            number: call.remote_number.clone(),
            timestamp: call.ended_at.unwrap_or_else(Utc::now),
            status: Some(call.status.to_string()),
            duration_seconds: Some(call.duration_seconds()),
        }
    }
}

#[async_trait]
pub trait CallLogger: Send + Sync {
    async fn record(&self, entry: CallLogEntry) -> anyhow::Result<()>;
}

/// Record `entry` on a background task; failures are only logged.
pub fn record_detached(logger: Arc<dyn CallLogger>, entry: CallLogEntry) {
    tokio::spawn(async move {
        let call_id = entry.call_id.clone();
        if let Err(e) = logger.record(entry).await {
            tracing::warn!("Call log for {} not recorded: {:#}", call_id, e);
        }
    });
}

/// Logger that discards entries.
pub struct NoCallLog;

#[async_trait]
impl CallLogger for NoCallLog {
    async fn record(&self, entry: CallLogEntry) -> anyhow::Result<()> {
        tracing::debug!("Call log ({:?}) for {} discarded", entry.kind, entry.call_id);
        Ok(())
    }
}
