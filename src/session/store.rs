//! Session store.
//!
//! Holds the current identity and the loading flag. The snapshot is published
//! on a `watch` channel so any number of readers can follow it. Writes come
//! from three places only: the startup bootstrap, the auth-event listener and
//! sign-out.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{
    AuthBackend, AuthChange, AuthEvent, AuthSession, AuthUser, SessionTokens, SignUpRequest,
};
use crate::profile::ProfileService;

use super::AuthError;

/// Path on the site that finishes an email confirmation.
pub const CALLBACK_PATH: &str = "/auth/callback";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub user: Option<AuthUser>,
    pub session: Option<AuthSession>,
    /// True only while the startup fetch is running and no auth event arrived yet.
    pub loading: bool,
}

impl SessionSnapshot {
    fn bootstrapping() -> Self {
        Self {
            user: None,
            session: None,
            loading: true,
        }
    }

    fn signed_out() -> Self {
        Self {
            user: None,
            session: None,
            loading: false,
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.user.is_some()
    }
}

/// Snapshot after an auth change. Every change ends the loading window.
pub fn apply_auth_change(change: &AuthChange) -> SessionSnapshot {
    let session = match change.event {
        AuthEvent::SignedOut => None,
        _ => change.session.clone(),
    };
    SessionSnapshot {
        user: session.as_ref().map(|s| s.user.clone()),
        session,
        loading: false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignUpOutcome {
    /// Account created, the user has to follow the confirmation email first.
    ConfirmationRequired { email: String },
    SignedIn(AuthUser),
}

/// Asynchronous work triggered by auth operations, run off the event path.
#[derive(Debug)]
enum FollowUp {
    CreateProfile {
        user_id: Uuid,
        full_name: Option<String>,
    },
}

struct Published {
    /// Number of auth changes applied so far.
    generation: u64,
}

struct Shared {
    tx: watch::Sender<SessionSnapshot>,
    published: Mutex<Published>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Published> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, change: &AuthChange) {
        let mut published = self.lock();
        published.generation += 1;
        debug!(
            "Applying auth change {:?} (generation {})",
            change.event, published.generation
        );
        self.tx.send_replace(apply_auth_change(change));
    }

    /// Installs the bootstrap result unless an auth change got there first.
    fn finish_bootstrap(&self, started_at: u64, user: Option<AuthUser>, session: Option<AuthSession>) {
        let published = self.lock();
        if published.generation != started_at {
            debug!("Auth change arrived during bootstrap, keeping the newer identity");
            self.tx.send_modify(|snapshot| snapshot.loading = false);
            return;
        }
        self.tx.send_replace(SessionSnapshot {
            user,
            session,
            loading: false,
        });
    }

    fn clear(&self) {
        let mut published = self.lock();
        published.generation += 1;
        self.tx.send_replace(SessionSnapshot::signed_out());
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }
}

pub struct SessionStore {
    auth: Arc<dyn AuthBackend>,
    shared: Arc<Shared>,
    follow_ups: mpsc::UnboundedSender<FollowUp>,
    redirect_url: String,
    shutdown: CancellationToken,
}

impl SessionStore {
    /// Subscribes to auth changes, then bootstraps from the backend.
    ///
    /// Must be called inside a tokio runtime: the listener, the follow-up
    /// worker and the bootstrap run as spawned tasks.
    pub fn start(
        auth: Arc<dyn AuthBackend>,
        profiles: Arc<ProfileService>,
        site_url: &str,
    ) -> Arc<Self> {
        let (tx, _) = watch::channel(SessionSnapshot::bootstrapping());
        let shared = Arc::new(Shared {
            tx,
            published: Mutex::new(Published { generation: 0 }),
        });
        let (follow_ups, follow_up_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        // Subscribe before the bootstrap so no change slips between the two.
        let events = auth.subscribe();
        let started_at = shared.generation();

        tokio::spawn(run_listener(events, shared.clone(), shutdown.clone()));
        tokio::spawn(run_follow_ups(follow_up_rx, profiles, shutdown.clone()));
        tokio::spawn(bootstrap(auth.clone(), shared.clone(), started_at));

        Arc::new(Self {
            auth,
            shared,
            follow_ups,
            redirect_url: format!("{}{}", site_url.trim_end_matches('/'), CALLBACK_PATH),
            shutdown,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.tx.borrow().clone()
    }

    pub fn current_user(&self) -> Option<AuthUser> {
        self.shared.tx.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.tx.borrow().loading
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }

    /// Waits until the published snapshot satisfies `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.subscribe();
        let snapshot = match rx.wait_for(|snapshot| predicate(snapshot)).await {
            Ok(snapshot) => snapshot.clone(),
            // The sender lives in `self`, so this only happens while tearing down.
            Err(_) => self.snapshot(),
        };
        snapshot
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        info!("Signing in {}", email);
        self.auth
            .sign_in_with_password(email, password)
            .await
            .map_err(AuthError::from)
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: Option<&str>,
    ) -> Result<SignUpOutcome, AuthError> {
        let request = SignUpRequest {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.unwrap_or_default().to_string(),
            email_redirect_to: self.redirect_url.clone(),
        };
        info!("Signing up {}", email);
        let response = self.auth.sign_up(&request).await?;

        if let Some(user) = response.user.as_ref().filter(|u| u.is_confirmed()) {
            let follow_up = FollowUp::CreateProfile {
                user_id: user.id,
                full_name: full_name.map(str::to_string),
            };
            if self.follow_ups.send(follow_up).is_err() {
                warn!("Follow-up worker stopped, profile for {} not created", user.id);
            }
        }

        match response.session {
            Some(session) => Ok(SignUpOutcome::SignedIn(session.user)),
            None => Ok(SignUpOutcome::ConfirmationRequired {
                email: email.to_string(),
            }),
        }
    }

    /// Signs out remotely and clears the local session whatever the outcome.
    pub async fn sign_out(&self) {
        if let Err(e) = self.auth.sign_out().await {
            error!("Error signing out: {}", e);
        }
        self.shared.clear();
    }

    /// Installs a session from tokens delivered by a confirmation redirect.
    pub async fn set_session(&self, tokens: &SessionTokens) -> Result<AuthSession, AuthError> {
        self.auth.set_session(tokens).await.map_err(AuthError::from)
    }

    /// Stops the listener and the follow-up worker.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bootstrap(auth: Arc<dyn AuthBackend>, shared: Arc<Shared>, started_at: u64) {
    let user = match auth.get_user().await {
        Ok(user) => user,
        Err(e) => {
            error!("Error getting user: {}", e);
            None
        }
    };
    let session = match auth.get_session().await {
        Ok(session) => session,
        Err(e) => {
            error!("Error getting session: {}", e);
            None
        }
    };
    debug!("Bootstrap finished, signed in: {}", user.is_some());
    shared.finish_bootstrap(started_at, user, session);
}

async fn run_listener(
    mut events: broadcast::Receiver<AuthChange>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => received,
        };
        match change {
            Ok(change) => shared.apply(&change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Auth listener lagged, skipped {} changes", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Auth listener stopped");
}

async fn run_follow_ups(
    mut rx: mpsc::UnboundedReceiver<FollowUp>,
    profiles: Arc<ProfileService>,
    shutdown: CancellationToken,
) {
    loop {
        let follow_up = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(follow_up) => follow_up,
                None => break,
            },
        };
        match follow_up {
            FollowUp::CreateProfile { user_id, full_name } => {
                if let Err(e) = profiles.create_profile(user_id, full_name.as_deref()).await {
                    error!("Error creating user profile: {}", e);
                }
            }
        }
    }
    debug!("Follow-up worker stopped");
}
