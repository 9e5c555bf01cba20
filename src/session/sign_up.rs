//! Sign-up form checks and the flow around a sign-up submit.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use super::{AuthError, SessionStore, SignUpOutcome};

pub const MIN_PASSWORD_LEN: usize = 8;

/// Delay before a finished sign-up (or a failed callback) moves on to the login page.
pub const LOGIN_REDIRECT_DELAY: Duration = Duration::from_secs(3);

static UPPERCASE: LazyLock<Regex> = LazyLock::new(|| Regex::new("[A-Z]").expect("valid regex"));
static LOWERCASE: LazyLock<Regex> = LazyLock::new(|| Regex::new("[a-z]").expect("valid regex"));
static DIGIT: LazyLock<Regex> = LazyLock::new(|| Regex::new("[0-9]").expect("valid regex"));
static SPECIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[!@#$%^&*(),.?":{}|<>]"#).expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Password must be at least 8 characters long")]
    PasswordTooShort,

    #[error("Please accept the terms and conditions")]
    TermsNotAccepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PasswordStrength {
    VeryWeak,
    Weak,
    Fair,
    Good,
    Strong,
}

impl PasswordStrength {
    /// One point each for length, uppercase, lowercase, digit and special character.
    pub fn score(password: &str) -> u8 {
        let checks = [
            password.chars().count() >= MIN_PASSWORD_LEN,
            UPPERCASE.is_match(password),
            LOWERCASE.is_match(password),
            DIGIT.is_match(password),
            SPECIAL.is_match(password),
        ];
        checks.iter().filter(|passed| **passed).count() as u8
    }

    pub fn of(password: &str) -> Self {
        match Self::score(password) {
            0 => PasswordStrength::VeryWeak,
            1 | 2 => PasswordStrength::Weak,
            3 => PasswordStrength::Fair,
            4 => PasswordStrength::Good,
            _ => PasswordStrength::Strong,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PasswordStrength::VeryWeak => "Very Weak",
            PasswordStrength::Weak => "Weak",
            PasswordStrength::Fair => "Fair",
            PasswordStrength::Good => "Good",
            PasswordStrength::Strong => "Strong",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignUpForm {
    pub full_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub accepted_terms: bool,
}

impl SignUpForm {
    /// Checks run in a fixed order and stop at the first failure.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.password != self.confirm_password {
            return Err(ValidationError::PasswordMismatch);
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(ValidationError::PasswordTooShort);
        }
        if !self.accepted_terms {
            return Err(ValidationError::TermsNotAccepted);
        }
        Ok(())
    }

    pub fn password_strength(&self) -> PasswordStrength {
        PasswordStrength::of(&self.password)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignUpFlowState {
    /// Account registered; the page moves to login after `redirect_after`.
    CheckEmail {
        email: String,
        redirect_after: Duration,
    },
}

/// Validates the form locally and, when it passes, registers the account.
pub async fn submit_sign_up(
    store: &SessionStore,
    form: &SignUpForm,
) -> Result<SignUpFlowState, AuthError> {
    form.validate()?;

    let full_name = Some(form.full_name.trim()).filter(|name| !name.is_empty());
    match store.sign_up(&form.email, &form.password, full_name).await? {
        SignUpOutcome::ConfirmationRequired { email } => {
            info!("Confirmation email sent to {}", email)
        }
        SignUpOutcome::SignedIn(user) => info!("Account {} confirmed on sign-up", user.id),
    }
    Ok(SignUpFlowState::CheckEmail {
        email: form.email.clone(),
        redirect_after: LOGIN_REDIRECT_DELAY,
    })
}
