use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    error::{GraphloadError, Result},
    http::{Credentials, HttpResponse, Method, OutgoingRequest, Payload, Transport, TransportError},
    settings::Settings,
};

pub const TOKEN_PATH: &str = "/requesttoken";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    results: Option<TokenResults>,
}

#[derive(Debug, Deserialize)]
struct TokenResults {
    token: String,
}

/// Owns the bearer token for a run.
///
/// The token is requested on first use and reused afterwards. The mutex is
/// held across the request so concurrent callers never trigger a second
/// fetch.
pub struct TokenProvider {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    cached: Mutex<Option<String>>,
}

impl TokenProvider {
    pub fn new(settings: Arc<Settings>, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            transport,
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            debug!("Reusing cached token");
            return Ok(token.clone());
        }

        let token = self.request_token().await?;
        info!("Obtained token for graph '{}'", self.settings.graph_name);
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Revokes the cached token. Does nothing when no token was fetched.
    pub async fn delete_token(&self) -> Result<()> {
        let mut cached = self.cached.lock().await;

        let Some(token) = cached.as_ref() else {
            debug!("No token cached, nothing to delete");
            return Ok(());
        };

        let mut body = json!({ "token": token });
        if let Some(secret) = &self.settings.secret {
            body["secret"] = json!(secret);
        }

        let response = self
            .send(Method::Delete, body)
            .await
            .map_err(|e| GraphloadError::Auth(format!("Could not revoke token: {}", e)))?;

        if !response.is_success() {
            return Err(GraphloadError::Auth(format!(
                "Server refused to revoke token ({}): {}",
                response.status, response.body
            )));
        }

        info!("Revoked token for graph '{}'", self.settings.graph_name);
        *cached = None;
        Ok(())
    }

    async fn request_token(&self) -> Result<String> {
        let body = match &self.settings.secret {
            Some(secret) => {
                let mut body = json!({ "secret": secret });
                if let Some(lifetime) = self.settings.token_lifetime {
                    body["lifetime"] = json!(lifetime.to_string());
                }
                body
            }
            None => json!({ "graph": self.settings.graph_name }),
        };

        let url = self.settings.url(TOKEN_PATH);
        let response = self
            .send(Method::Post, body)
            .await
            .map_err(|e| GraphloadError::Auth(format!("Could not reach {}: {}", url, e)))?;

        if !response.is_success() {
            return Err(GraphloadError::Auth(format!(
                "Server rejected credentials ({}): {}",
                response.status, response.body
            )));
        }

        parse_token(&response.body)
    }

    async fn send(
        &self,
        method: Method,
        body: serde_json::Value,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let request = OutgoingRequest {
            method,
            url: self.settings.url(TOKEN_PATH),
            query: Vec::new(),
            credentials: Some(Credentials::Basic {
                user: self.settings.admin_user_name.clone(),
                password: self.settings.admin_password.clone(),
            }),
            content_type: Some("application/json".to_string()),
            body: Payload::Bytes(body.to_string().into_bytes()),
        };

        self.transport.send(request).await
    }
}

fn parse_token(body: &str) -> Result<String> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| GraphloadError::Auth(format!("Unreadable token response: {}", e)))?;

    if response.error {
        return Err(GraphloadError::Auth(
            response
                .message
                .unwrap_or_else(|| "server reported an error".to_string()),
        ));
    }

    response
        .results
        .map(|results| results.token)
        .or(response.token)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| GraphloadError::Auth("Token response did not contain a token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeTransport;
    use crate::settings::sample_settings;

    fn provider(transport: Arc<FakeTransport>) -> Arc<TokenProvider> {
        Arc::new(TokenProvider::new(Arc::new(sample_settings()), transport))
    }

    #[tokio::test]
    async fn test_get_token_fetches_once() {
        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = provider(transport.clone());

        for _ in 0..5 {
            assert_eq!(tokens.get_token().await.unwrap(), "tok-123");
        }

        assert_eq!(transport.count_to(TOKEN_PATH), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = provider(transport.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = Arc::clone(&tokens);
                tokio::spawn(async move { tokens.get_token().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "tok-123");
        }

        assert_eq!(transport.count_to(TOKEN_PATH), 1);
    }

    #[tokio::test]
    async fn test_token_request_uses_admin_credentials() {
        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = provider(transport.clone());
        tokens.get_token().await.unwrap();

        let requests = transport.requests();
        let request = &requests[0];
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.url, "http://graph.local:9000/requesttoken");
        assert_eq!(
            request.credentials,
            Some(Credentials::Basic {
                user: "admin".to_string(),
                password: "admin-pw".to_string()
            })
        );
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body, json!({ "graph": "OrgGraph" }));
    }

    #[tokio::test]
    async fn test_secret_is_sent_when_configured() {
        let mut settings = sample_settings();
        settings.secret = Some("s3cr3t".to_string());
        settings.token_lifetime = Some(3600);

        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = TokenProvider::new(Arc::new(settings), transport.clone());
        tokens.get_token().await.unwrap();

        let requests = transport.requests();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body, json!({ "secret": "s3cr3t", "lifetime": "3600" }));
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(HttpResponse {
                status: 401,
                body: "bad credentials".to_string(),
            })
        }));
        let tokens = provider(transport);

        let err = tokens.get_token().await.unwrap_err();
        assert!(matches!(err, GraphloadError::Auth(ref msg) if msg.contains("bad credentials")));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Err(TransportError("connection refused".to_string()))
        }));
        let tokens = provider(transport);

        assert!(matches!(
            tokens.get_token().await,
            Err(GraphloadError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_without_token_is_noop() {
        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = provider(transport.clone());

        tokens.delete_token().await.unwrap();
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_delete_clears_cache() {
        let transport = Arc::new(FakeTransport::server(200, "ok"));
        let tokens = provider(transport.clone());

        tokens.get_token().await.unwrap();
        tokens.delete_token().await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[1].method, Method::Delete);
        let body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(body, json!({ "token": "tok-123" }));

        tokens.get_token().await.unwrap();
        assert_eq!(
            transport
                .requests()
                .iter()
                .filter(|r| r.method == Method::Post)
                .count(),
            2
        );
    }

    #[test]
    fn test_parse_token_shapes() {
        assert_eq!(
            parse_token(r#"{"error":false,"results":{"token":"abc"}}"#).unwrap(),
            "abc"
        );
        assert_eq!(parse_token(r#"{"token":"xyz"}"#).unwrap(), "xyz");
        assert!(parse_token(r#"{"error":true,"message":"Graph not found"}"#).is_err());
        assert!(parse_token(r#"{"error":false}"#).is_err());
        assert!(parse_token("not json").is_err());
    }
}
