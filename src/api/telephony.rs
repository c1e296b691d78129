//! Per-login telephony configuration

use anyhow::{Context, Result};
use serde::Deserialize;

use super::client::ApiClient;
use crate::signaling::ua::SipAccount;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    urls: Urls,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn urls(&self) -> Vec<&str> {
        match &self.urls {
            Urls::One(url) => vec![url.as_str()],
            Urls::Many(urls) => urls.iter().map(String::as_str).collect(),
        }
    }
}

/// Signaling endpoint and device credentials issued to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelephonyConfig {
    pub ws_url: String,
    pub domain: String,
    pub username: String,
    #[serde(default)]
    pub auth_username: Option<String>,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl TelephonyConfig {
    pub async fn fetch(client: &ApiClient) -> Result<Self> {
        let resp = client.get("/api/telephony/config").await?;
        resp.json()
            .await
            .context("Failed to parse telephony config response")
    }

    pub fn account(&self) -> SipAccount {
        SipAccount {
            ws_url: self.ws_url.clone(),
            domain: self.domain.clone(),
            username: self.username.clone(),
            auth_username: self.auth_username.clone(),
            password: self.password.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_response() {
        let config: TelephonyConfig = serde_json::from_str(
            r#"{
                "wsUrl": "wss://pbx.example.com:8089/ws",
                "domain": "pbx.example.com",
                "username": "1001",
                "password": "secret",
                "displayName": "Agent 1001",
                "iceServers": [
                    {"urls": "stun:stun.example.com:3478"},
                    {"urls": ["turn:turn.example.com"], "username": "u", "credential": "c"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.ice_servers[0].urls(), vec!["stun:stun.example.com:3478"]);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("u"));

        let account = config.account();
        assert_eq!(account.aor(), "sip:1001@pbx.example.com");
        assert_eq!(account.auth_username, None);
        assert_eq!(account.display_name.as_deref(), Some("Agent 1001"));
    }
}
