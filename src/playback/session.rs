//! One viewing session: a tracker fed by player events, persisting through
//! `ProgressSync` for as long as the session is open.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::ContentId;
use crate::session::{SessionSnapshot, SessionStore};

use super::progress::ProgressSync;
use super::tracker::{PlaybackState, PlaybackTracker, PlayerEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("Sign in to watch content")]
    NotSignedIn,

    #[error("Player session is closed")]
    Closed,
}

/// What the player shows: where the head is and whether it is moving.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub position: f64,
    pub duration: Option<f64>,
}

impl PlaybackStatus {
    fn of(tracker: &PlaybackTracker) -> Self {
        Self {
            state: tracker.state(),
            position: tracker.position(),
            duration: tracker.duration(),
        }
    }
}

pub struct PlayerSession {
    content_id: ContentId,
    events: mpsc::UnboundedSender<PlayerEvent>,
    status: watch::Receiver<PlaybackStatus>,
    cancel: CancellationToken,
}

impl PlayerSession {
    /// Opens a session for `content_id`. Watching requires a signed-in user.
    pub fn open(
        store: &SessionStore,
        sync: Arc<ProgressSync>,
        content_id: ContentId,
    ) -> Result<Self, PlaybackError> {
        let user = store.current_user().ok_or(PlaybackError::NotSignedIn)?;
        info!("User {} opened content {}", user.id, content_id);

        let tracker = PlaybackTracker::new(content_id);
        let (status_tx, status) = watch::channel(PlaybackStatus::of(&tracker));
        let (events, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(sample(
            tracker,
            events_rx,
            status_tx,
            sync,
            Viewer {
                user_id: user.id,
                identity: store.subscribe(),
            },
            cancel.clone(),
        ));

        Ok(Self {
            content_id,
            events,
            status,
            cancel,
        })
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Feeds one player event. Fails once the session is closed.
    pub fn send(&self, event: PlayerEvent) -> Result<(), PlaybackError> {
        if self.cancel.is_cancelled() {
            return Err(PlaybackError::Closed);
        }
        self.events.send(event).map_err(|_| PlaybackError::Closed)
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.clone()
    }

    /// Stops sampling. A progress call already in flight still completes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for PlayerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The user the session was opened for.
struct Viewer {
    user_id: Uuid,
    identity: watch::Receiver<SessionSnapshot>,
}

impl Viewer {
    fn still_signed_in(&self) -> bool {
        self.identity
            .borrow()
            .user
            .as_ref()
            .is_some_and(|user| user.id == self.user_id)
    }
}

async fn sample(
    mut tracker: PlaybackTracker,
    mut events: mpsc::UnboundedReceiver<PlayerEvent>,
    status: watch::Sender<PlaybackStatus>,
    sync: Arc<ProgressSync>,
    mut viewer: Viewer,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            // Prefer closing over draining queued events.
            biased;
            _ = cancel.cancelled() => break,
            changed = viewer.identity.changed() => {
                if changed.is_err() || !viewer.still_signed_in() {
                    info!("Viewer signed out, closing content {}", tracker.content_id());
                    cancel.cancel();
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if !viewer.still_signed_in() {
            info!("Viewer signed out, closing content {}", tracker.content_id());
            cancel.cancel();
            break;
        }
        if let Some(update) = tracker.handle(event) {
            // Dropping the ticket leaves the call running.
            drop(sync.persist(update));
        }
        status.send_replace(PlaybackStatus::of(&tracker));
    }
    debug!("Stopped sampling content {}", tracker.content_id());
}
