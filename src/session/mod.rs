//! Signed-in identity, credential operations and the sign-up flow.

mod callback;
mod error;
mod sign_up;
mod store;

pub use callback::{AuthCallback, CallbackOutcome, NO_SESSION_FOUND};
pub use error::AuthError;
pub use sign_up::{
    submit_sign_up, PasswordStrength, SignUpFlowState, SignUpForm, ValidationError,
    LOGIN_REDIRECT_DELAY, MIN_PASSWORD_LEN,
};
pub use store::{apply_auth_change, SessionSnapshot, SessionStore, SignUpOutcome, CALLBACK_PATH};
