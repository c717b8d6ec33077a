//! Actor resolution.
//!
//! Resolves the caller of a request by trying, in order:
//! - a signed bearer token (`Authorization: Bearer <jwt>`, HS256)
//! - a remote session introspection call, forwarding the request headers
//! - the anonymous identity, which always succeeds
//!
//! A strategy never rejects a request. It either resolves an identity or is
//! inconclusive, and the next strategy gets a chance. Access decisions are
//! left to the metadata store.

use crate::models::actor::ActorIdentity;
use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderName,
    header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a single strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ActorIdentity),
    Inconclusive,
}

#[async_trait]
pub trait ActorStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, headers: &HeaderMap) -> Resolution;
}

/// Ordered, first-match-wins chain of strategies with an anonymous terminal.
pub struct ActorResolver {
    strategies: Vec<Box<dyn ActorStrategy>>,
}

impl ActorResolver {
    pub fn new(strategies: Vec<Box<dyn ActorStrategy>>) -> Self {
        Self { strategies }
    }

    /// Token strategy always; remote-session strategy when `auth_url` is set.
    pub fn from_settings(jwt_secret: &str, auth_url: Option<&str>, timeout: Duration) -> Self {
        let mut strategies: Vec<Box<dyn ActorStrategy>> =
            vec![Box::new(BearerTokenStrategy::new(jwt_secret))];
        if let Some(url) = auth_url {
            strategies.push(Box::new(RemoteSessionStrategy::new(url, timeout)));
        }
        Self::new(strategies)
    }

    /// Never fails.
    pub async fn resolve(&self, headers: &HeaderMap) -> ActorIdentity {
        for strategy in &self.strategies {
            match strategy.resolve(headers).await {
                Resolution::Resolved(actor) => {
                    debug!(
                        strategy = strategy.name(),
                        user_id = actor.user_id.as_deref().unwrap_or("-"),
                        role = actor.primary_role(),
                        "resolved actor"
                    );
                    return actor;
                }
                Resolution::Inconclusive => {
                    debug!(strategy = strategy.name(), "strategy inconclusive");
                }
            }
        }
        ActorIdentity::anonymous()
    }
}

/// Verified claims of a bearer token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Verifies HS256 bearer tokens with a pre-shared secret.
pub struct BearerTokenStrategy {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl BearerTokenStrategy {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = 0;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[async_trait]
impl ActorStrategy for BearerTokenStrategy {
    fn name(&self) -> &'static str {
        "bearer-token"
    }

    async fn resolve(&self, headers: &HeaderMap) -> Resolution {
        let Some(token) = bearer_token(headers) else {
            return Resolution::Inconclusive;
        };

        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => {
                let claims = data.claims;
                let roles = claims.role.into_iter().chain(claims.roles);
                Resolution::Resolved(ActorIdentity::authenticated(claims.sub, roles))
            }
            Ok(_) => {
                debug!("bearer token has empty subject");
                Resolution::Inconclusive
            }
            Err(err) => {
                debug!("bearer token rejected: {}", err);
                Resolution::Inconclusive
            }
        }
    }
}

/// Body returned by the identity service's introspection endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionClaims {
    #[serde(default, alias = "user_id", alias = "id")]
    user_id: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Asks a remote identity service who the caller is.
pub struct RemoteSessionStrategy {
    client: reqwest::Client,
    endpoint: String,
}

/// Headers describing this request's transport or body, not the caller.
const UNFORWARDED_HEADERS: [HeaderName; 5] =
    [HOST, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, CONNECTION];

impl RemoteSessionStrategy {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!("falling back to default http client: {}", err);
                reqwest::Client::new()
            });
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
        let mut forwarded = headers.clone();
        for name in &UNFORWARDED_HEADERS {
            forwarded.remove(name);
        }
        forwarded
    }
}

#[async_trait]
impl ActorStrategy for RemoteSessionStrategy {
    fn name(&self) -> &'static str {
        "remote-session"
    }

    async fn resolve(&self, headers: &HeaderMap) -> Resolution {
        let response = match self
            .client
            .get(&self.endpoint)
            .headers(Self::forwarded_headers(headers))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(endpoint = %self.endpoint, "session introspection failed: {}", err);
                return Resolution::Inconclusive;
            }
        };

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "session introspection declined");
            return Resolution::Inconclusive;
        }

        let claims = match response.json::<SessionClaims>().await {
            Ok(claims) => claims,
            Err(err) => {
                warn!("malformed session introspection body: {}", err);
                return Resolution::Inconclusive;
            }
        };

        let user_id = claims.user_id.filter(|id| !id.trim().is_empty());
        let roles: Vec<String> = claims.role.into_iter().chain(claims.roles).collect();
        match user_id {
            Some(user_id) if !roles.is_empty() => {
                Resolution::Resolved(ActorIdentity::authenticated(user_id, roles))
            }
            _ => {
                warn!("session introspection body missing user id or role");
                Resolution::Inconclusive
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::actor::ANONYMOUS_ROLE;
    use axum::{
        Json, Router,
        http::{HeaderValue, StatusCode, header::COOKIE},
        response::IntoResponse,
        routing::get,
    };
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use tokio::net::TcpListener;

    const SECRET: &str = "test-secret";

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    async fn session_endpoint(headers: HeaderMap) -> impl IntoResponse {
        let cookie = headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match cookie {
            "session=good" => (
                StatusCode::OK,
                Json(json!({"userId": "remote-user", "role": "editor"})),
            )
                .into_response(),
            "session=norole" => {
                (StatusCode::OK, Json(json!({"userId": "remote-user"}))).into_response()
            }
            "session=garbage" => (StatusCode::OK, "not json").into_response(),
            _ => StatusCode::UNAUTHORIZED.into_response(),
        }
    }

    async fn spawn_identity_service() -> String {
        let app = Router::new().route("/session", get(session_endpoint));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/session", addr)
    }

    fn token_only() -> ActorResolver {
        ActorResolver::from_settings(SECRET, None, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn valid_token_yields_authenticated_actor() {
        let exp = Utc::now().timestamp() + 3600;
        let jwt = token(
            SECRET,
            json!({"sub": "u1", "role": "editor", "roles": ["viewer"], "exp": exp}),
        );

        let actor = token_only().resolve(&bearer(&jwt)).await;
        assert_eq!(actor, ActorIdentity::authenticated("u1", ["editor", "viewer"]));
    }

    #[tokio::test]
    async fn token_with_wrong_secret_falls_back_to_anonymous() {
        let exp = Utc::now().timestamp() + 3600;
        let jwt = token("other-secret", json!({"sub": "u1", "exp": exp}));

        let actor = token_only().resolve(&bearer(&jwt)).await;
        assert_eq!(actor.roles, vec![ANONYMOUS_ROLE]);
        assert!(!actor.authenticated);
        assert!(actor.user_id.is_none());
    }

    #[tokio::test]
    async fn expired_token_falls_back_to_anonymous() {
        let exp = Utc::now().timestamp() - 3600;
        let jwt = token(SECRET, json!({"sub": "u1", "exp": exp}));

        assert_eq!(token_only().resolve(&bearer(&jwt)).await, ActorIdentity::anonymous());
    }

    #[tokio::test]
    async fn garbage_authorization_header_is_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(token_only().resolve(&headers).await, ActorIdentity::anonymous());
        assert_eq!(token_only().resolve(&bearer("nope")).await, ActorIdentity::anonymous());
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn remote_session_resolves_after_failed_token() {
        let url = spawn_identity_service().await;
        let resolver = ActorResolver::from_settings(SECRET, Some(&url), Duration::from_secs(2));

        let mut headers = bearer("invalid");
        headers.insert(COOKIE, HeaderValue::from_static("session=good"));

        let actor = resolver.resolve(&headers).await;
        assert_eq!(actor, ActorIdentity::authenticated("remote-user", ["editor"]));
    }

    #[tokio::test]
    async fn token_wins_over_remote_session() {
        let url = spawn_identity_service().await;
        let resolver = ActorResolver::from_settings(SECRET, Some(&url), Duration::from_secs(2));
        let exp = Utc::now().timestamp() + 3600;
        let jwt = token(SECRET, json!({"sub": "token-user", "exp": exp}));

        let mut headers = bearer(&jwt);
        headers.insert(COOKIE, HeaderValue::from_static("session=good"));

        let actor = resolver.resolve(&headers).await;
        assert_eq!(actor.user_id.as_deref(), Some("token-user"));
    }

    #[tokio::test]
    async fn remote_failures_fall_through_to_anonymous() {
        let url = spawn_identity_service().await;
        let resolver = ActorResolver::from_settings(SECRET, Some(&url), Duration::from_secs(2));

        for cookie in ["session=bad", "session=garbage", "session=norole"] {
            let mut headers = HeaderMap::new();
            headers.insert(COOKIE, HeaderValue::from_static(cookie));
            assert_eq!(resolver.resolve(&headers).await, ActorIdentity::anonymous(), "{cookie}");
        }
    }

    #[tokio::test]
    async fn unreachable_identity_service_is_anonymous() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{}/session", addr);
        let resolver = ActorResolver::from_settings(SECRET, Some(&url), Duration::from_millis(500));

        assert_eq!(resolver.resolve(&HeaderMap::new()).await, ActorIdentity::anonymous());
    }

    #[test]
    fn forwarded_headers_drop_transport_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("files.test"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(COOKIE, HeaderValue::from_static("session=good"));

        let forwarded = RemoteSessionStrategy::forwarded_headers(&headers);
        assert!(forwarded.get(HOST).is_none());
        assert!(forwarded.get(CONTENT_LENGTH).is_none());
        assert_eq!(forwarded.get(COOKIE).unwrap(), "session=good");
    }
}
