//! Presentation timestamp offset correction
//!
//! Segmented containers may start their first video sample later than the
//! segment's nominal position on the playlist timeline. The drift is
//! measured once, on the first primary-track video media segment, and then
//! frozen for the rest of the session.

use crate::engine::SegmentAppend;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
enum OffsetState {
    /// Not yet installed on an engine; appends are not observed
    Detached,
    /// Installed, waiting for the first qualifying segment
    Listening,
    /// Measured; never changes again
    Frozen(f64),
}

/// One-shot offset measurement for a session
#[derive(Debug, Clone)]
pub struct OffsetCorrector {
    state: OffsetState,
}

impl OffsetCorrector {
    pub fn new() -> Self {
        Self {
            state: OffsetState::Detached,
        }
    }

    /// Start observing appends; must happen at or before engine attach
    pub fn install(&mut self) {
        if self.state == OffsetState::Detached {
            self.state = OffsetState::Listening;
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state == OffsetState::Listening
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.state, OffsetState::Frozen(_))
    }

    /// Offset in seconds; 0 until measured
    pub fn offset(&self) -> f64 {
        match self.state {
            OffsetState::Frozen(offset) => offset,
            OffsetState::Detached | OffsetState::Listening => 0.0,
        }
    }

    /// Feed one segment-append event. Returns the offset when this append
    /// froze it.
    pub fn observe(&mut self, segment: &SegmentAppend) -> Option<f64> {
        if self.state != OffsetState::Listening {
            return None;
        }
        if !segment.primary || segment.init_segment || !segment.has_video {
            debug!(?segment, "Segment does not qualify for offset");
            return None;
        }
        let decode_start = segment.video_decode_start?;

        let offset = decode_start - segment.nominal_start;
        if !offset.is_finite() {
            return None;
        }

        self.state = OffsetState::Frozen(offset);
        info!(
            offset,
            nominal_start = segment.nominal_start,
            decode_start,
            "Timestamp offset frozen"
        );
        Some(offset)
    }

    /// Duration exposed to the UI and the recorder
    pub fn corrected_duration(&self, raw_duration: f64) -> f64 {
        let offset = self.offset();
        if offset == 0.0 {
            raw_duration
        } else {
            (raw_duration - offset).max(0.0)
        }
    }
}

impl Default for OffsetCorrector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed() -> OffsetCorrector {
        let mut corrector = OffsetCorrector::new();
        corrector.install();
        corrector
    }

    #[test]
    fn first_video_segment_freezes_offset() {
        let mut corrector = installed();

        assert_eq!(corrector.observe(&SegmentAppend::video(10.0, 12.5)), Some(2.5));
        assert_eq!(corrector.observe(&SegmentAppend::video(20.0, 30.0)), None);
        assert_eq!(corrector.offset(), 2.5);
        assert!(corrector.is_frozen());
    }

    #[test]
    fn init_audio_and_secondary_segments_are_skipped() {
        let mut corrector = installed();

        let init = SegmentAppend {
            init_segment: true,
            ..SegmentAppend::video(0.0, 1.0)
        };
        let audio = SegmentAppend {
            has_video: false,
            ..SegmentAppend::video(0.0, 1.0)
        };
        let secondary = SegmentAppend {
            primary: false,
            ..SegmentAppend::video(0.0, 1.0)
        };
        let no_timestamp = SegmentAppend {
            video_decode_start: None,
            ..SegmentAppend::video(0.0, 1.0)
        };

        for segment in [init, audio, secondary, no_timestamp] {
            assert_eq!(corrector.observe(&segment), None);
        }
        assert!(corrector.is_listening());
        assert_eq!(corrector.observe(&SegmentAppend::video(0.0, 0.4)), Some(0.4));
    }

    #[test]
    fn detached_corrector_ignores_appends() {
        let mut corrector = OffsetCorrector::new();
        assert_eq!(corrector.observe(&SegmentAppend::video(0.0, 3.0)), None);
        assert_eq!(corrector.offset(), 0.0);
    }

    #[test]
    fn corrected_duration_subtracts_offset_and_floors_at_zero() {
        let mut corrector = installed();
        assert_eq!(corrector.corrected_duration(600.0), 600.0);

        corrector.observe(&SegmentAppend::video(0.0, 5.0));
        assert_eq!(corrector.corrected_duration(600.0), 595.0);
        assert_eq!(corrector.corrected_duration(3.0), 0.0);
    }

    #[test]
    fn negative_offset_extends_duration() {
        let mut corrector = installed();
        corrector.observe(&SegmentAppend::video(4.0, 3.0));
        assert_eq!(corrector.offset(), -1.0);
        assert_eq!(corrector.corrected_duration(100.0), 101.0);
    }
}
