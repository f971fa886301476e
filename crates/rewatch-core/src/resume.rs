//! Resume-from-last-position
//!
//! The checkpoint fetch and the engine's metadata event arrive in either
//! order. Once both are known the seek target is computed exactly once;
//! after that the planner is consumed and later metadata events
//! (manifest reloads) are ignored.

use crate::types::WatchCheckpoint;
use tracing::{debug, info};

/// Clamp a seek target into `[0, duration - 1]`
///
/// Seeking onto the very end would immediately end playback.
pub fn clamp_seek(target: f64, duration: f64) -> f64 {
    let upper = (duration - 1.0).max(0.0);
    target.clamp(0.0, upper)
}

/// One-shot resume planner for a session
#[derive(Debug, Clone, Default)]
pub struct ResumePlanner {
    /// `None` until the checkpoint fetch settles
    checkpoint: Option<Option<f64>>,
    duration: Option<f64>,
    consumed: bool,
}

impl ResumePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the fetch result; `None` covers both "never watched" and a
    /// failed fetch.
    pub fn checkpoint_settled(&mut self, checkpoint: Option<&WatchCheckpoint>) {
        if self.checkpoint.is_some() {
            return;
        }
        let progress = checkpoint
            .map(|c| c.progress_seconds)
            .filter(|p| p.is_finite() && *p > 0.0);
        debug!(?progress, "Checkpoint settled");
        self.checkpoint = Some(progress);
    }

    /// Record media metadata; non-finite durations (live) are ignored
    pub fn metadata_ready(&mut self, duration: f64) {
        if duration.is_finite() && duration > 0.0 {
            self.duration = Some(duration);
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub fn is_waiting_for_checkpoint(&self) -> bool {
        !self.consumed && self.checkpoint.is_none()
    }

    /// Seek to apply, at most once per planner. `offset` is the current
    /// timestamp offset.
    pub fn take_seek(&mut self, offset: f64) -> Option<f64> {
        if self.consumed {
            return None;
        }
        let progress = self.checkpoint?;
        let Some(progress) = progress else {
            self.consumed = true;
            debug!("Nothing to resume");
            return None;
        };
        let duration = self.duration?;

        self.consumed = true;
        let target = clamp_seek(progress + offset, duration);
        if target > 0.0 {
            info!(progress, offset, duration, target, "Resuming playback");
            Some(target)
        } else {
            None
        }
    }
}
