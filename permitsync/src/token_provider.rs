use std::sync::Mutex;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use permitsync_core::AuthClient;
use serde::Deserialize;

const REFRESH_SKEW_SECS: i64 = 300;

/// Holds the current bearer credential for every submit/listing call.
/// The mutex guards only the read and the swap; the refresh exchange itself
/// runs outside it, so concurrent submitters may race to refresh and the
/// last writer wins.
pub struct TokenProvider {
    auth: AuthClient,
    refresh_token: String,
    current: Mutex<String>,
    refresh_skew_secs: i64,
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<f64>,
}

impl TokenProvider {
    pub fn new(
        auth: AuthClient,
        initial_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            auth,
            refresh_token: refresh_token.into(),
            current: Mutex::new(initial_token.into()),
            refresh_skew_secs: REFRESH_SKEW_SECS,
        }
    }

    /// Refreshes proactively when the expiry claim is within the skew window
    /// or the token cannot be decoded. When the refresh itself fails the
    /// stale token is returned; the caller will see a rejection and handle
    /// it through its own refresh-and-retry path.
    pub async fn get_valid(&self) -> String {
        let current = self.current_token();
        if !self.needs_refresh(&current) {
            return current;
        }
        match self.force_refresh().await {
            Some(token) => token,
            None => current,
        }
    }

    /// Unconditional exchange. None on failure.
    pub async fn force_refresh(&self) -> Option<String> {
        match self.auth.refresh(&self.refresh_token).await {
            Ok(token) => {
                *self.lock() = token.clone();
                Some(token)
            }
            Err(err) => {
                eprintln!("[permitsync] credential refresh failed: {err}");
                None
            }
        }
    }

    pub fn current_token(&self) -> String {
        self.lock().clone()
    }

    fn needs_refresh(&self, token: &str) -> bool {
        match decode_expiry(token) {
            Some(expires_at) => now_unix() >= expires_at - self.refresh_skew_secs,
            // an undecodable token is treated as already expired
            None => true,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn decode_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    claims.exp.map(|exp| exp as i64)
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.signature")
    }

    fn auth_client(server: &MockServer) -> AuthClient {
        AuthClient::new(&format!("{}/api/auth/refresh/", server.uri())).unwrap()
    }

    #[tokio::test]
    async fn unexpired_token_is_returned_without_refresh() {
        let server = MockServer::start().await;
        let token = make_jwt(now_unix() + 3600);
        let provider = TokenProvider::new(auth_client(&server), token.clone(), "refresh-1");

        assert_eq!(provider.get_valid().await, token);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_within_the_skew_window_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh/"))
            .and(body_string_contains("refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "fresh"})))
            .mount(&server)
            .await;

        let nearly_expired = make_jwt(now_unix() + 60);
        let provider = TokenProvider::new(auth_client(&server), nearly_expired, "refresh-1");

        assert_eq!(provider.get_valid().await, "fresh");
        assert_eq!(provider.current_token(), "fresh");
    }

    #[tokio::test]
    async fn undecodable_token_triggers_a_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "fresh"})))
            .mount(&server)
            .await;

        let provider = TokenProvider::new(auth_client(&server), "not-a-jwt", "refresh-1");
        assert_eq!(provider.get_valid().await, "fresh");
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_the_stale_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let stale = make_jwt(now_unix() - 10);
        let provider = TokenProvider::new(auth_client(&server), stale.clone(), "refresh-1");

        assert_eq!(provider.get_valid().await, stale);
        assert!(provider.force_refresh().await.is_none());
    }
}
