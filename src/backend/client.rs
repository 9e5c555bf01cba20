//! HTTP client for the hosted backend.
//!
//! Talks to the three services exposed by the backend-as-a-service:
//! - the auth issuer under `/auth/v1`
//! - the table API under `/rest/v1`
//! - the function host under `/functions/v1`
//!
//! The client owns the current session and publishes every change to it on
//! a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::TokenResponse;
use super::{
    AuthBackend, AuthChange, AuthEvent, AuthSession, AuthUser, BackendError, DataBackend,
    FunctionBackend, Query, QueryResult, SessionTokens, SignUpRequest, SignUpResponse,
};

/// How often the auto-refresh task looks at the session expiry.
pub const AUTO_REFRESH_TICK: Duration = Duration::from_secs(30);

/// Sessions expiring within this many seconds get refreshed.
pub const REFRESH_THRESHOLD_SECS: i64 = 90;

pub fn needs_refresh(session: &AuthSession, now: i64) -> bool {
    session.expires_in(now) <= REFRESH_THRESHOLD_SECS
}

/// Client for the hosted backend.
pub struct BackendClient {
    client: Client,
    base_url: String,
    anon_key: String,
    session: RwLock<Option<AuthSession>>,
    event_tx: broadcast::Sender<AuthChange>,
}

impl BackendClient {
    /// Create a new backend client.
    ///
    /// # Arguments
    /// * `base_url` - Project URL (e.g., "https://project.example.co")
    /// * `anon_key` - Public API key sent with every request
    /// * `timeout_secs` - Request timeout in seconds
    pub fn new(base_url: String, anon_key: String, timeout_secs: u64) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        let (event_tx, _) = broadcast::channel(64);

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client,
            base_url,
            anon_key,
            session: RwLock::new(None),
            event_tx,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Spawns the token auto-refresh loop. It stops when `shutdown` is cancelled.
    pub fn spawn_auto_refresh(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        self.spawn_auto_refresh_every(AUTO_REFRESH_TICK, shutdown)
    }

    /// Same as `spawn_auto_refresh`, checking the session every `tick`.
    pub fn spawn_auto_refresh_every(
        self: &Arc<Self>,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let due = match client.session.read().await.as_ref() {
                    Some(session) => needs_refresh(session, Utc::now().timestamp()),
                    None => false,
                };
                if !due {
                    continue;
                }

                match client.refresh_session().await {
                    Ok(session) => info!("Refreshed session, expires at {}", session.expires_at),
                    Err(e @ (BackendError::InvalidCredentials | BackendError::NotAuthenticated)) => {
                        warn!("Session can no longer be refreshed, signing out: {}", e);
                        client.clear_session().await;
                    }
                    Err(e) => warn!("Failed to refresh session: {}", e),
                }
            }
            debug!("Auto-refresh loop stopped");
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.base_url, name)
    }

    async fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    /// Bearer for data and function calls: the user's token, or the anon key.
    async fn bearer(&self) -> String {
        self.access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request.header("apikey", &self.anon_key).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_response(status, &body))
    }

    async fn store_session(&self, session: AuthSession, event: AuthEvent) {
        *self.session.write().await = Some(session.clone());
        self.publish(event, Some(session));
    }

    async fn clear_session(&self) {
        *self.session.write().await = None;
        self.publish(AuthEvent::SignedOut, None);
    }

    fn publish(&self, event: AuthEvent, session: Option<AuthSession>) {
        debug!("Auth event {:?}", event);
        // No subscribers is fine, the change is still reflected in `session`.
        let _ = self.event_tx.send(AuthChange { event, session });
    }

    async fn fetch_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let response = self
            .send(self.client.get(self.auth_url("user")).bearer_auth(access_token))
            .await?;
        Ok(response.json().await?)
    }
}

fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl AuthBackend for BackendClient {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, BackendError> {
        let response = self
            .send(
                self.client
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", "password")])
                    .json(&json!({ "email": email, "password": password })),
            )
            .await?;
        let token: TokenResponse = response.json().await?;
        let session = token.into_session(Utc::now().timestamp());
        self.store_session(session.clone(), AuthEvent::SignedIn)
            .await;
        Ok(session)
    }

    async fn sign_up(&self, request: &SignUpRequest) -> Result<SignUpResponse, BackendError> {
        let response = self
            .send(
                self.client
                    .post(self.auth_url("signup"))
                    .query(&[("redirect_to", request.email_redirect_to.as_str())])
                    .json(&json!({
                        "email": request.email,
                        "password": request.password,
                        "data": { "full_name": request.full_name },
                    })),
            )
            .await?;
        let body: Value = response.json().await?;

        // Auto-confirming issuers answer with a full token grant.
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)?;
            let session = token.into_session(Utc::now().timestamp());
            self.store_session(session.clone(), AuthEvent::SignedIn)
                .await;
            return Ok(SignUpResponse {
                user: Some(session.user.clone()),
                session: Some(session),
            });
        }

        let user_value = match body.get("user") {
            Some(user) if user.is_object() => user.clone(),
            _ => body,
        };
        let user: AuthUser = serde_json::from_value(user_value)?;
        Ok(SignUpResponse {
            user: Some(user),
            session: None,
        })
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(token) = self.access_token().await else {
            self.clear_session().await;
            return Ok(());
        };

        let result = self
            .send(self.client.post(self.auth_url("logout")).bearer_auth(token))
            .await;
        // The local session goes away even when the issuer could not be reached.
        self.clear_session().await;
        match result {
            Ok(_) | Err(BackendError::NotAuthenticated) => Ok(()),
            // The session is already gone on the issuer side.
            Err(BackendError::Api { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_user(&self) -> Result<Option<AuthUser>, BackendError> {
        let Some(token) = self.access_token().await else {
            return Ok(None);
        };
        let user = self.fetch_user(&token).await?;
        if let Some(session) = self.session.write().await.as_mut() {
            session.user = user.clone();
        }
        Ok(Some(user))
    }

    async fn get_session(&self) -> Result<Option<AuthSession>, BackendError> {
        Ok(self.session.read().await.clone())
    }

    async fn set_session(&self, tokens: &SessionTokens) -> Result<AuthSession, BackendError> {
        let user = self.fetch_user(&tokens.access_token).await?;
        let session = AuthSession {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            token_type: tokens.token_type.clone(),
            expires_at: Utc::now().timestamp() + tokens.expires_in.unwrap_or(3600),
            user,
        };
        self.store_session(session.clone(), AuthEvent::SignedIn)
            .await;
        Ok(session)
    }

    async fn refresh_session(&self) -> Result<AuthSession, BackendError> {
        let refresh_token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or(BackendError::NotAuthenticated)?;

        let response = self
            .send(
                self.client
                    .post(self.auth_url("token"))
                    .query(&[("grant_type", "refresh_token")])
                    .json(&json!({ "refresh_token": refresh_token })),
            )
            .await?;
        let token: TokenResponse = response.json().await?;
        let session = token.into_session(Utc::now().timestamp());
        self.store_session(session.clone(), AuthEvent::TokenRefreshed)
            .await;
        Ok(session)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.event_tx.subscribe()
    }
}

#[async_trait]
impl DataBackend for BackendClient {
    async fn select(&self, query: &Query) -> Result<QueryResult, BackendError> {
        let mut request = self
            .client
            .get(self.rest_url(query.table_name()))
            .query(&query.to_params())
            .bearer_auth(self.bearer().await);
        if query.wants_count() {
            request = request.header("Prefer", "count=exact");
        }

        let response = self.send(request).await?;
        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);
        let rows: Vec<Value> = response.json().await?;

        debug!(
            "Selected {} rows from {} (total {:?})",
            rows.len(),
            query.table_name(),
            total
        );
        Ok(QueryResult { rows, total })
    }

    async fn insert(&self, table: &str, row: Value) -> Result<(), BackendError> {
        self.send(
            self.client
                .post(self.rest_url(table))
                .bearer_auth(self.bearer().await)
                .header("Prefer", "return=minimal")
                .json(&row),
        )
        .await?;
        Ok(())
    }

    async fn update(&self, query: &Query, patch: Value) -> Result<(), BackendError> {
        self.send(
            self.client
                .patch(self.rest_url(query.table_name()))
                .query(&query.filter_params())
                .bearer_auth(self.bearer().await)
                .header("Prefer", "return=minimal")
                .json(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FunctionBackend for BackendClient {
    async fn invoke(&self, function: &str, body: Value) -> Result<Value, BackendError> {
        let response = self
            .send(
                self.client
                    .post(self.function_url(function))
                    .bearer_auth(self.bearer().await)
                    .json(&body),
            )
            .await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
