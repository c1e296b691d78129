//! Call log upload

use async_trait::async_trait;

use super::client::ApiClient;
use crate::calling::call_log::{CallLogEntry, CallLogger};

pub struct RestCallLog {
    client: ApiClient,
}

impl RestCallLog {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CallLogger for RestCallLog {
    async fn record(&self, entry: CallLogEntry) -> anyhow::Result<()> {
        self.client.post("/api/call-logs", &entry).await?;
        tracing::debug!("Call log ({:?}) for {} recorded", entry.kind, entry.call_id);
        Ok(())
    }
}
