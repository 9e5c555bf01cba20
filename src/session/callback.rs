//! Completes the email-confirmation redirect.
//!
//! The auth issuer sends the user back to `<site>/auth/callback` with the new
//! tokens in the URL fragment:
//! `#access_token=...&refresh_token=...&expires_in=3600&token_type=bearer`.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, info};

use crate::backend::{AuthSession, SessionTokens};

use super::sign_up::LOGIN_REDIRECT_DELAY;
use super::SessionStore;

pub const NO_SESSION_FOUND: &str = "No session found";

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Dashboard(AuthSession),
    /// Back to the login page with `error`, after `redirect_after`.
    Login {
        error: String,
        redirect_after: Duration,
    },
}

/// Parsed contents of a redirect fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthCallback {
    params: HashMap<String, String>,
}

impl AuthCallback {
    /// Reads the fragment of `url`. A bare fragment (`access_token=...`) works too.
    pub fn parse(url: &str) -> Self {
        let fragment = match url.split_once('#') {
            Some((_, fragment)) => fragment,
            None if url.contains("://") => "",
            None => url,
        };

        let params = fragment
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let value = value.replace('+', " ");
                let value = urlencoding::decode(&value).ok()?.into_owned();
                Some((key.to_string(), value))
            })
            .collect();

        Self { params }
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn tokens(&self) -> Option<SessionTokens> {
        Some(SessionTokens {
            access_token: self.param("access_token")?.to_string(),
            refresh_token: self.param("refresh_token")?.to_string(),
            token_type: self.param("token_type").unwrap_or("bearer").to_string(),
            expires_in: self.param("expires_in").and_then(|v| v.parse().ok()),
        })
    }

    /// Error reported by the issuer in place of tokens, e.g. an expired link.
    pub fn error(&self) -> Option<&str> {
        self.param("error_description").or_else(|| self.param("error"))
    }

    /// Installs the session carried by the redirect, or explains why there is none.
    pub async fn complete(&self, store: &SessionStore) -> CallbackOutcome {
        if let Some(message) = self.error() {
            error!("Auth callback error: {}", message);
            return login_with(message.to_string());
        }

        let Some(tokens) = self.tokens() else {
            return login_with(NO_SESSION_FOUND.to_string());
        };

        match store.set_session(&tokens).await {
            Ok(session) => {
                info!("Confirmation completed for {}", session.user.id);
                CallbackOutcome::Dashboard(session)
            }
            Err(e) => {
                error!("Auth callback error: {}", e);
                login_with(e.to_string())
            }
        }
    }
}

fn login_with(error: String) -> CallbackOutcome {
    CallbackOutcome::Login {
        error,
        redirect_after: LOGIN_REDIRECT_DELAY,
    }
}
