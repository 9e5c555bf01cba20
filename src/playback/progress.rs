//! Persists progress updates through the `update-progress` function.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error};

use crate::backend::{functions, BackendError, FunctionBackend};
use crate::catalog::ContentId;
use crate::sync::{FlightTicket, SingleFlight};

use super::tracker::ProgressUpdate;

/// Fire-and-forget progress persistence, one call in flight per content item.
pub struct ProgressSync {
    flight: SingleFlight<ContentId, ProgressUpdate, (), BackendError>,
}

impl ProgressSync {
    pub fn new(backend: Arc<dyn FunctionBackend>) -> Self {
        let flight = SingleFlight::new(move |_content_id: ContentId, update: ProgressUpdate| {
            send_update(Arc::clone(&backend), update).boxed()
        });
        Self { flight }
    }

    /// Queues `update`. Never blocks; the ticket may be dropped.
    pub fn persist(&self, update: ProgressUpdate) -> FlightTicket<(), BackendError> {
        self.flight.submit(update.content_id, update)
    }

    pub fn is_in_flight(&self, content_id: ContentId) -> bool {
        self.flight.is_in_flight(&content_id)
    }
}

async fn send_update(
    backend: Arc<dyn FunctionBackend>,
    update: ProgressUpdate,
) -> Result<(), BackendError> {
    let body = serde_json::to_value(&update)?;
    match backend.invoke(functions::UPDATE_PROGRESS, body).await {
        Ok(_) => {
            debug!(
                "Saved progress {}s for content {} (completed: {})",
                update.progress_seconds, update.content_id, update.completed
            );
            Ok(())
        }
        Err(e) => {
            error!(
                "Error updating progress for content {}: {}",
                update.content_id, e
            );
            Err(e)
        }
    }
}
