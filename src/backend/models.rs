//! Wire types shared by the auth issuer and the table API.
//!
//! These mirror the JSON returned by the hosted backend. Conversion into
//! domain types happens in the services that own them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::BackendError;

// =============================================================================
// Auth
// =============================================================================

/// The authenticated principal returned by the auth issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

impl AuthUser {
    pub fn is_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }

    pub fn full_name(&self) -> Option<&str> {
        self.user_metadata
            .get("full_name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Unix timestamp (seconds) at which the access token expires.
    pub expires_at: i64,
    pub user: AuthUser,
}

impl AuthSession {
    pub fn expires_in(&self, now: i64) -> i64 {
        self.expires_at - now
    }
}

/// Token grant response from the auth issuer.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl TokenResponse {
    pub fn into_session(self, now: i64) -> AuthSession {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| now + self.expires_in.unwrap_or(3600));
        AuthSession {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type,
            expires_at,
            user: self.user,
        }
    }
}

/// Tokens delivered in an email-confirmation redirect.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Immutable notification published on the auth-event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<AuthSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    /// Where the confirmation email sends the user back to.
    pub email_redirect_to: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignUpResponse {
    pub user: Option<AuthUser>,
    /// Present only when the issuer confirms accounts without email verification.
    pub session: Option<AuthSession>,
}

// =============================================================================
// Tables
// =============================================================================

/// Rows returned by a table query plus the exact count when it was requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub total: Option<u64>,
}

impl QueryResult {
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>, BackendError> {
        self.rows
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(BackendError::from))
            .collect()
    }

    /// Decodes the first row, if any.
    pub fn decode_first<T: DeserializeOwned>(self) -> Result<Option<T>, BackendError> {
        match self.rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }
}
