//! Authenticated HTTP client for the contact-center backend
//!
//! Wraps reqwest::Client with bearer token injection and uniform status checks.

use anyhow::{bail, Context, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;

use crate::auth::TokenStore;
use crate::config::Config;

/// Client for the backend REST API. Holds its own copy of the session token
/// so teardown calls still work after the session is marked logged out.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Build a client from the local config, refusing a missing or expired token.
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config
            .api_base_url
            .as_deref()
            .context("No API base URL configured. Run 'agent-desk login --api-url <URL>'.")?;
        let token = config
            .get_session_token()
            .context("No session token. Run 'agent-desk login' first.")?;
        if token.is_expired() {
            bail!("Session token expired. Run 'agent-desk login'.");
        }
        Ok(Self::new(base_url, token.token))
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> (String, RequestBuilder) {
        let url = self.url(path);
        tracing::debug!("API {} {}", method, url);
        let builder = self.http.request(method, &url).bearer_auth(&self.token);
        (url, builder)
    }

    /// Send without status checking; for endpoints where a 404 is an answer.
    pub async fn send_unchecked(&self, method: Method, path: &str) -> Result<reqwest::Response> {
        let (url, builder) = self.request(method.clone(), path);
        builder
            .send()
            .await
            .with_context(|| format!("API {} {} failed", method, url))
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let (url, builder) = self.request(Method::GET, path);
        let resp = builder
            .send()
            .await
            .with_context(|| format!("API GET {} failed", url))?;
        check_response(resp, &url).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let (url, builder) = self.request(Method::POST, path);
        let resp = builder
            .json(body)
            .send()
            .await
            .with_context(|| format!("API POST {} failed", url))?;
        check_response(resp, &url).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let (url, builder) = self.request(Method::PUT, path);
        let resp = builder
            .json(body)
            .send()
            .await
            .with_context(|| format!("API PUT {} failed", url))?;
        check_response(resp, &url).await
    }

    pub async fn delete(&self, path: &str) -> Result<reqwest::Response> {
        let (url, builder) = self.request(Method::DELETE, path);
        let resp = builder
            .send()
            .await
            .with_context(|| format!("API DELETE {} failed", url))?;
        check_response(resp, &url).await
    }
}

/// Check HTTP response status code and return a clear error on failure.
pub(crate) async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'agent-desk login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
