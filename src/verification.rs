//! Verification state machine.
//!
//! A pending track collects one identity-confidence sample per associated update.
//! On the `min_detections`-th sample it resolves, once and for good, to `Known`
//! (mean ≥ `known_confidence`) or `Unknown`.

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::frame::Frame;
use crate::tracker::{Track, TrackState};

/// Absorbs f32 rounding in the mean so a mean equal to the threshold stays inclusive.
const MEAN_TOLERANCE: f32 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Known,
    Unknown,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Known => "known",
            Classification::Unknown => "unknown",
        }
    }
}

impl From<Classification> for TrackState {
    fn from(value: Classification) -> Self {
        match value {
            Classification::Known => TrackState::Known,
            Classification::Unknown => TrackState::Unknown,
        }
    }
}

/// Emitted exactly once per track, on its Pending → resolved transition.
#[derive(Clone, Debug)]
pub struct CommitEvent {
    pub track_id: u64,
    pub classification: Classification,
    pub mean_confidence: f32,
    pub frame: Frame,
    pub crop: RgbImage,
    pub bbox: BoundingBox,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    pub min_detections: u32,
    pub known_confidence: f32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_detections: 5,
            known_confidence: 0.92,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn set_min_detections(&mut self, min_detections: u32) {
        self.config.min_detections = min_detections.max(1);
    }

    pub fn set_known_confidence(&mut self, known_confidence: f32) {
        self.config.known_confidence = known_confidence.clamp(0.0, 1.0);
    }

    /// Feed one identity sample for an associated update.
    ///
    /// Returns the classification only on the update that resolves the track.
    /// Resolved tracks ignore further samples.
    pub fn observe(&self, track: &mut Track, sample: f32) -> Option<Classification> {
        if track.state.is_resolved() || track.committed {
            return None;
        }
        track.confidence_samples.push(sample.clamp(0.0, 1.0));
        track.detection_count += 1;
        if track.detection_count < self.config.min_detections {
            return None;
        }

        let mean = track.mean_confidence();
        let classification = if mean + MEAN_TOLERANCE >= self.config.known_confidence {
            Classification::Known
        } else {
            Classification::Unknown
        };
        track.state = classification.into();
        track.committed = true;
        Some(classification)
    }

    /// Overlay text for a track.
    pub fn label(&self, track: &Track) -> String {
        match track.state {
            TrackState::Pending => format!(
                "verifying {}/{}",
                track.detection_count, self.config.min_detections
            ),
            TrackState::Known => format!("KNOWN {:.2}", track.mean_confidence()),
            TrackState::Unknown => format!("UNKNOWN {:.2}", track.mean_confidence()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Label;
    use crate::tracker::{Tracker, TrackerConfig};

    fn pending_track() -> Track {
        let mut tracker = Tracker::new(TrackerConfig::default());
        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.9);
        let (_, id) = tracker.update(1, &[bbox])[0];
        tracker.get(id).cloned().expect("track")
    }

    #[test]
    fn resolves_known_on_fifth_sample_exactly_once() {
        let verifier = Verifier::default();
        let mut track = pending_track();
        let samples = [0.93, 0.94, 0.91, 0.95, 0.92];
        let mut commits = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            if let Some(c) = verifier.observe(&mut track, *sample) {
                commits.push((i + 1, c));
            }
        }
        assert_eq!(commits, vec![(5, Classification::Known)]);
        assert_eq!(verifier.observe(&mut track, 0.1), None);
        assert_eq!(track.detection_count, 5);
    }

    #[test]
    fn one_short_of_min_detections_never_commits() {
        let verifier = Verifier::default();
        let mut track = pending_track();
        for _ in 0..4 {
            assert_eq!(verifier.observe(&mut track, 0.99), None);
        }
        assert_eq!(track.state, TrackState::Pending);
        assert_eq!(verifier.label(&track), "verifying 4/5");
    }

    #[test]
    fn mean_equal_to_threshold_is_known() {
        let verifier = Verifier::default();
        let mut track = pending_track();
        let mut result = None;
        for _ in 0..5 {
            result = verifier.observe(&mut track, 0.92);
        }
        assert_eq!(result, Some(Classification::Known));
    }

    #[test]
    fn no_identity_evidence_resolves_unknown() {
        let verifier = Verifier::default();
        let mut track = pending_track();
        let mut result = None;
        for _ in 0..5 {
            result = verifier.observe(&mut track, 0.0);
        }
        assert_eq!(result, Some(Classification::Unknown));
        assert_eq!(track.state, TrackState::Unknown);
        assert!(track.committed);
    }
}
