//! Contact lookup by phone number

use async_trait::async_trait;
use reqwest::{Method, StatusCode};

use super::client::ApiClient;
use crate::calling::caller_id::{CallerIdResolver, ContactIdentity};
use crate::error::LookupError;

pub struct ContactDirectory {
    client: ApiClient,
}

impl ContactDirectory {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

fn lookup_path(phone_number: &str) -> String {
    format!("/api/contacts/lookup?phone={}", super::encode(phone_number))
}

#[async_trait]
impl CallerIdResolver for ContactDirectory {
    async fn lookup(&self, phone_number: &str) -> Result<Option<ContactIdentity>, LookupError> {
        let resp = self
            .client
            .send_unchecked(Method::GET, &lookup_path(phone_number))
            .await
            .map_err(|e| LookupError::Backend(format!("{:#}", e)))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => resp
                .json::<ContactIdentity>()
                .await
                .map(Some)
                .map_err(|e| LookupError::Backend(e.to_string())),
            status => Err(LookupError::Backend(format!("HTTP {}", status.as_u16()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_path_encodes_number() {
        assert_eq!(
            lookup_path("+1 555 0100"),
            "/api/contacts/lookup?phone=%2B1+555+0100"
        );
    }

    #[test]
    fn test_identity_accepts_either_name_field() {
        let a: ContactIdentity = serde_json::from_str(r#"{"id":"c1","displayName":"Ada"}"#).unwrap();
        let b: ContactIdentity = serde_json::from_str(r#"{"id":"c1","name":"Ada"}"#).unwrap();
        assert_eq!(a, b);
    }
}
