use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("refresh response carried no access token")]
    MissingToken,
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    refresh_url: Url,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// The refresh endpoint has returned the new bearer credential under two
/// different field names across deployments; both are accepted.
#[derive(Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl AuthClient {
    pub fn new(refresh_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            refresh_url: Url::parse(refresh_url)?,
        })
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Api { status, body });
        }
        let payload: RefreshResponse = response.json().await?;
        payload
            .access
            .or(payload.access_token)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)
    }
}
