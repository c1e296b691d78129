//! Caller identification for inbound calls.
//!
//! Lookups run in the background and can only enrich the call's display
//! fields. A miss, an error or a timeout all degrade to an anonymous caller;
//! none of them can delay answering or rejecting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::LookupError;

/// Upper bound on how long a lookup may take before it is abandoned.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Directory identity for a phone number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContactIdentity {
    pub id: String,
    #[serde(rename = "displayName", alias = "name")]
    pub display_name: String,
}

#[async_trait]
pub trait CallerIdResolver: Send + Sync {
    async fn lookup(&self, phone_number: &str) -> Result<Option<ContactIdentity>, LookupError>;
}

/// Run `resolver` with a timeout, folding every failure into `None`.
pub async fn identify(resolver: &dyn CallerIdResolver, phone_number: &str) -> Option<ContactIdentity> {
    match tokio::time::timeout(LOOKUP_TIMEOUT, resolver.lookup(phone_number)).await {
        Ok(Ok(identity)) => {
            if identity.is_none() {
                tracing::debug!("No directory match for {}", phone_number);
            }
            identity
        }
        Ok(Err(e)) => {
            tracing::warn!("Caller lookup for {} failed: {}", phone_number, e);
            None
        }
        Err(_) => {
            tracing::warn!("Caller lookup for {} failed: {}", phone_number, LookupError::Timeout);
            None
        }
    }
}

/// Spawn a lookup and hand the outcome to `on_result` when it completes.
pub fn identify_in_background<F>(resolver: Arc<dyn CallerIdResolver>, phone_number: String, on_result: F)
where
    F: FnOnce(Option<ContactIdentity>) + Send + 'static,
{
    tokio::spawn(async move {
        let identity = identify(resolver.as_ref(), &phone_number).await;
        on_result(identity);
    });
}

/// Resolver used when no directory is configured.
pub struct NoDirectory;

#[async_trait]
impl CallerIdResolver for NoDirectory {
    async fn lookup(&self, _phone_number: &str) -> Result<Option<ContactIdentity>, LookupError> {
        Ok(None)
    }
}
