//! Errors returned by the hosted backend client.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("User already registered")]
    DuplicateAccount,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

/// Error body shapes emitted by the auth issuer, the table API and the function host.
/// Each service fills a different subset of these fields.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    error_code: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl ApiErrorBody {
    fn message(&self) -> Option<&str> {
        self.error_description
            .as_deref()
            .or(self.msg.as_deref())
            .or(self.message.as_deref())
            .or(self.error.as_deref())
    }
}

impl BackendError {
    /// Maps a non-successful HTTP response into a typed error.
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
        let message = parsed
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| body.trim().to_string());
        let lowered = message.to_lowercase();

        let invalid_credentials = parsed.error.as_deref() == Some("invalid_grant")
            || parsed.error_code.as_deref() == Some("invalid_credentials")
            || lowered.contains("invalid login credentials");
        if status == StatusCode::BAD_REQUEST && invalid_credentials {
            return BackendError::InvalidCredentials;
        }

        let duplicate = parsed.error_code.as_deref() == Some("user_already_exists")
            || lowered.contains("already registered");
        if (status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY)
            && duplicate
        {
            return BackendError::DuplicateAccount;
        }

        if status == StatusCode::UNAUTHORIZED {
            return BackendError::NotAuthenticated;
        }

        BackendError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Parse(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Parse(err.to_string())
    }
}
