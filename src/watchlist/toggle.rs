//! Watchlist membership toggle.
//!
//! The backend's acknowledgment is the source of truth. Each content item
//! keeps two flags: `acknowledged`, the state last confirmed by the
//! `manage-watchlist` function, and `provisional`, what the UI shows while a
//! change is on its way. A failed change rolls `provisional` back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{functions, AuthUser, BackendError, DataBackend, FunctionBackend, Query};
use crate::catalog::{CatalogError, CatalogService, Content, ContentId};
use crate::session::SessionStore;
use crate::sync::{FlightOutcome, SingleFlight};

pub const WATCHLIST_TABLE: &str = "user_watchlist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchlistAction {
    Add,
    Remove,
}

impl WatchlistAction {
    fn target(&self) -> bool {
        matches!(self, WatchlistAction::Add)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WatchlistError {
    #[error("Sign in to manage your watchlist")]
    NotSignedIn,

    #[error("Superseded by a newer watchlist change")]
    Superseded,

    #[error("Failed to update watchlist: {0}")]
    Backend(#[from] BackendError),
}

impl From<CatalogError> for WatchlistError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Backend(e) => WatchlistError::Backend(e),
            CatalogError::NotFound(what) => WatchlistError::Backend(BackendError::Api {
                status: 404,
                message: format!("{} not found", what),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Membership {
    /// Last state confirmed by the backend.
    pub acknowledged: bool,
    /// State shown to the user, ahead of `acknowledged` while a change is pending.
    pub provisional: bool,
}

impl Membership {
    fn settled(in_watchlist: bool) -> Self {
        Self {
            acknowledged: in_watchlist,
            provisional: in_watchlist,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.acknowledged != self.provisional
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WatchlistEntry {
    pub id: i64,
    pub user_id: Uuid,
    pub content_id: ContentId,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tracked {
    membership: Membership,
    /// Sequence number of the most recent change issued for this item.
    latest: u64,
}

type Tracking = Arc<Mutex<HashMap<ContentId, Tracked>>>;

fn lock(tracking: &Tracking) -> MutexGuard<'_, HashMap<ContentId, Tracked>> {
    tracking
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WatchlistToggle {
    store: Arc<SessionStore>,
    data: Arc<dyn DataBackend>,
    catalog: Arc<CatalogService>,
    flight: SingleFlight<ContentId, WatchlistAction, (), BackendError>,
    tracking: Tracking,
}

impl WatchlistToggle {
    pub fn new(
        store: Arc<SessionStore>,
        data: Arc<dyn DataBackend>,
        backend: Arc<dyn FunctionBackend>,
        catalog: Arc<CatalogService>,
    ) -> Self {
        let flight = SingleFlight::new(move |content_id: ContentId, action: WatchlistAction| {
            manage_watchlist(Arc::clone(&backend), content_id, action).boxed()
        });
        Self {
            store,
            data,
            catalog,
            flight,
            tracking: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn require_user(&self) -> Result<AuthUser, WatchlistError> {
        self.store
            .current_user()
            .ok_or(WatchlistError::NotSignedIn)
    }

    /// Locally known membership; not-in-watchlist when never loaded.
    pub fn membership(&self, content_id: ContentId) -> Membership {
        lock(&self.tracking)
            .get(&content_id)
            .map(|t| t.membership)
            .unwrap_or_default()
    }

    /// Reads membership from the store. A change in flight keeps its local state.
    pub async fn load_status(&self, content_id: ContentId) -> Result<Membership, WatchlistError> {
        let user = self.require_user()?;
        let query = Query::table(WATCHLIST_TABLE)
            .select("id")
            .eq("user_id", user.id)
            .eq("content_id", content_id)
            .limit(1);
        let in_watchlist = !self.data.select(&query).await?.rows.is_empty();

        let mut tracking = lock(&self.tracking);
        let tracked = tracking.entry(content_id).or_default();
        if self.flight.is_in_flight(&content_id) || tracked.membership.is_pending() {
            debug!("Change pending for {}, keeping local membership", content_id);
        } else {
            tracked.membership = Membership::settled(in_watchlist);
        }
        Ok(tracked.membership)
    }

    /// Requests `action` and waits for the backend's answer.
    pub async fn set(
        &self,
        content_id: ContentId,
        action: WatchlistAction,
    ) -> Result<Membership, WatchlistError> {
        self.require_user()?;

        let seq = {
            let mut tracking = lock(&self.tracking);
            let tracked = tracking.entry(content_id).or_default();
            tracked.latest += 1;
            tracked.membership.provisional = action.target();
            tracked.latest
        };

        let outcome = self.flight.submit(content_id, action).outcome().await;

        let mut tracking = lock(&self.tracking);
        let tracked = tracking.entry(content_id).or_default();
        let is_latest = tracked.latest == seq;
        match outcome {
            FlightOutcome::Completed(Ok(())) => {
                tracked.membership.acknowledged = action.target();
                if is_latest {
                    tracked.membership.provisional = tracked.membership.acknowledged;
                }
                Ok(tracked.membership)
            }
            FlightOutcome::Completed(Err(e)) => {
                warn!("Watchlist {:?} failed for {}: {}", action, content_id, e);
                if is_latest {
                    tracked.membership.provisional = tracked.membership.acknowledged;
                }
                Err(e.into())
            }
            FlightOutcome::Superseded => Err(WatchlistError::Superseded),
        }
    }

    /// Flips the displayed membership.
    pub async fn toggle(&self, content_id: ContentId) -> Result<Membership, WatchlistError> {
        let action = if self.membership(content_id).provisional {
            WatchlistAction::Remove
        } else {
            WatchlistAction::Add
        };
        self.set(content_id, action).await
    }

    /// The user's watchlist, most recently added first.
    pub async fn list(&self) -> Result<Vec<Content>, WatchlistError> {
        let user = self.require_user()?;
        let query = Query::table(WATCHLIST_TABLE)
            .eq("user_id", user.id)
            .order("added_at", false);
        let entries: Vec<WatchlistEntry> = self.data.select(&query).await?.decode()?;
        let ids: Vec<ContentId> = entries.iter().map(|e| e.content_id).collect();

        let mut contents: HashMap<ContentId, Content> = self
            .catalog
            .get_contents(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        Ok(ids.iter().filter_map(|id| contents.remove(id)).collect())
    }
}

async fn manage_watchlist(
    backend: Arc<dyn FunctionBackend>,
    content_id: ContentId,
    action: WatchlistAction,
) -> Result<(), BackendError> {
    backend
        .invoke(
            functions::MANAGE_WATCHLIST,
            json!({ "action": action, "contentId": content_id }),
        )
        .await?;
    info!("Watchlist {:?} acknowledged for {}", action, content_id);
    Ok(())
}
