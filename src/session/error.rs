use thiserror::Error;

use crate::backend::BackendError;

use super::sign_up::ValidationError;

/// Failures surfaced by the credential operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("An account with this email already exists")]
    DuplicateAccount,

    #[error("Network error: {0}")]
    Network(String),

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<BackendError> for AuthError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidCredentials => AuthError::InvalidCredentials,
            BackendError::DuplicateAccount => AuthError::DuplicateAccount,
            BackendError::Network(message) => AuthError::Network(message),
            BackendError::Api { message, .. } => AuthError::Rejected(message),
            other => AuthError::Rejected(other.to_string()),
        }
    }
}
