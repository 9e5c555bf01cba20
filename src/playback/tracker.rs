//! Playback progress tracker.
//!
//! Turns raw player events into the few progress updates worth persisting.
//! Progress is sampled on tenths of the duration: an update goes out each time
//! playback crosses into a tenth it has not reached before, and once more,
//! marked completed, when the video ends.

use serde::Serialize;
use tracing::debug;

use crate::catalog::ContentId;

/// Number of progress buckets a video is divided into.
pub const PROGRESS_BUCKETS: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    Play,
    Pause,
    TimeUpdate { current_time: f64, duration: f64 },
    Ended { duration: f64 },
}

/// Body of an `update-progress` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub content_id: ContentId,
    pub progress_seconds: u64,
    pub completed: bool,
}

/// Bucket index of a position, `0..=10`.
pub fn progress_bucket(current_time: f64, duration: f64) -> Option<u8> {
    if !current_time.is_finite() || !duration.is_finite() || duration <= 0.0 {
        return None;
    }
    let scaled = (current_time.max(0.0) * PROGRESS_BUCKETS as f64 / duration).floor();
    Some(scaled.min(PROGRESS_BUCKETS as f64) as u8)
}

#[derive(Debug, Clone)]
pub struct PlaybackTracker {
    content_id: ContentId,
    state: PlaybackState,
    position: f64,
    duration: Option<f64>,
    /// Highest bucket already sent out, 0 when nothing was sent.
    persisted_bucket: u8,
    /// Elapsed seconds of the last update, updates never go below it.
    last_elapsed: u64,
}

impl PlaybackTracker {
    pub fn new(content_id: ContentId) -> Self {
        Self {
            content_id,
            state: PlaybackState::Idle,
            position: 0.0,
            duration: None,
            persisted_bucket: 0,
            last_elapsed: 0,
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Watched fraction in `0.0..=1.0`, 0 while the duration is unknown.
    pub fn progress(&self) -> f64 {
        match self.duration {
            Some(duration) if duration > 0.0 => (self.position / duration).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }

    /// Applies one player event and returns the update to persist, if any.
    /// Events the current state does not accept are ignored.
    pub fn handle(&mut self, event: PlayerEvent) -> Option<ProgressUpdate> {
        match (self.state, event) {
            (PlaybackState::Idle | PlaybackState::Paused, PlayerEvent::Play) => {
                self.state = PlaybackState::Playing;
                None
            }
            (PlaybackState::Playing, PlayerEvent::Pause) => {
                self.state = PlaybackState::Paused;
                None
            }
            (
                PlaybackState::Playing,
                PlayerEvent::TimeUpdate {
                    current_time,
                    duration,
                },
            ) => self.on_time_update(current_time, duration),
            (
                PlaybackState::Paused,
                PlayerEvent::TimeUpdate {
                    current_time,
                    duration,
                },
            ) => {
                // Seeking while paused moves the head but persists nothing.
                self.record_position(current_time, duration);
                None
            }
            (PlaybackState::Playing, PlayerEvent::Ended { duration }) => self.on_ended(duration),
            (state, event) => {
                debug!("Ignoring {:?} while {:?}", event, state);
                None
            }
        }
    }

    fn record_position(&mut self, current_time: f64, duration: f64) -> bool {
        if !current_time.is_finite() || !duration.is_finite() || duration <= 0.0 {
            return false;
        }
        self.position = current_time.max(0.0);
        self.duration = Some(duration);
        true
    }

    fn on_time_update(&mut self, current_time: f64, duration: f64) -> Option<ProgressUpdate> {
        if !self.record_position(current_time, duration) {
            return None;
        }
        let bucket = progress_bucket(current_time, duration)?;
        if bucket <= self.persisted_bucket {
            return None;
        }
        self.persisted_bucket = bucket;
        Some(self.update(current_time.floor() as u64, false))
    }

    fn on_ended(&mut self, duration: f64) -> Option<ProgressUpdate> {
        let duration = if duration.is_finite() && duration > 0.0 {
            duration
        } else {
            self.duration.unwrap_or(self.position)
        };
        self.state = PlaybackState::Ended;
        self.position = duration;
        self.duration = Some(duration);
        self.persisted_bucket = PROGRESS_BUCKETS;
        Some(self.update(duration.floor() as u64, true))
    }

    fn update(&mut self, elapsed: u64, completed: bool) -> ProgressUpdate {
        self.last_elapsed = self.last_elapsed.max(elapsed);
        ProgressUpdate {
            content_id: self.content_id,
            progress_seconds: self.last_elapsed,
            completed,
        }
    }
}
