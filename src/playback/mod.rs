//! Watching content: progress tracking and persistence.

mod format;
mod progress;
mod session;
mod tracker;

pub use format::format_time;
pub use progress::ProgressSync;
pub use session::{PlaybackError, PlaybackStatus, PlayerSession};
pub use tracker::{
    progress_bucket, PlaybackState, PlaybackTracker, PlayerEvent, ProgressUpdate,
    PROGRESS_BUCKETS,
};
