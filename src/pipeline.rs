//! Per-frame detection pipeline.
//!
//! Detector boxes → pre-filters → tracker → verification → gate → (alert,
//! persistence, statistics). The pipeline owns the tracker; only the detection
//! loop drives it.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Duration;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::alert::AlertDispatcher;
use crate::detect::{BoundingBox, Label};
use crate::frame::Frame;
use crate::gate::{Decision, Gate, GateConfig};
use crate::stats::Statistics;
use crate::storage::{DetectionRecord, SharedStore};
use crate::tracker::{TrackState, Tracker, TrackerConfig};
use crate::verification::{Classification, CommitEvent, Verifier, VerifierConfig};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub person_confidence: f32,
    /// Person boxes smaller than this share of the frame (percent) are dropped.
    pub min_person_area_percent: f32,
    /// Run the detector on every n-th new frame.
    pub frame_skip: u32,
    pub buzzer_pattern: u8,
    pub tracker: TrackerConfig,
    pub verifier: VerifierConfig,
    pub gate: GateConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            person_confidence: 0.75,
            min_person_area_percent: 2.0,
            frame_skip: 5,
            buzzer_pattern: 1,
            tracker: TrackerConfig::default(),
            verifier: VerifierConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

/// Settings adjustable while the detection loop runs. `None` leaves a value unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub person_confidence: Option<f32>,
    pub min_detections: Option<u32>,
    pub known_confidence: Option<f32>,
    pub alert_cooldown_secs: Option<u64>,
    pub save_images: Option<bool>,
    pub frame_skip: Option<u32>,
    pub buzzer_pattern: Option<u8>,
}

/// Current values of the adjustable settings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Settings {
    pub person_confidence: f32,
    pub min_detections: u32,
    pub known_confidence: f32,
    pub alert_cooldown_secs: u64,
    pub save_images: bool,
    pub frame_skip: u32,
    pub buzzer_pattern: u8,
}

/// What the preview draws for one tracked box.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackOverlay {
    pub track_id: u64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub state: TrackState,
    pub label: String,
}

/// Result of one commit event after the gate and persistence.
#[derive(Clone, Debug)]
pub struct CommitOutcome {
    pub track_id: u64,
    pub classification: Classification,
    pub mean_confidence: f32,
    pub decision: Decision,
    pub record: Option<DetectionRecord>,
}

#[derive(Clone, Debug, Default)]
pub struct FrameOutcome {
    pub overlays: Vec<TrackOverlay>,
    pub commits: Vec<CommitOutcome>,
}

/// A box that reaches the tracker, with its identity sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Candidate {
    pub bbox: BoundingBox,
    pub sample: f32,
}

pub type SharedPipeline = Arc<Mutex<DetectionPipeline>>;

pub struct DetectionPipeline {
    person_confidence: f32,
    min_person_area_percent: f32,
    frame_skip: u32,
    buzzer_pattern: u8,
    tracker: Tracker,
    verifier: Verifier,
    gate: Gate,
    store: SharedStore,
    alerts: Arc<dyn AlertDispatcher>,
    stats: Arc<Statistics>,
}

impl DetectionPipeline {
    pub fn new(
        config: PipelineConfig,
        store: SharedStore,
        alerts: Arc<dyn AlertDispatcher>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            person_confidence: config.person_confidence,
            min_person_area_percent: config.min_person_area_percent,
            frame_skip: config.frame_skip.max(1),
            buzzer_pattern: config.buzzer_pattern,
            tracker: Tracker::new(config.tracker),
            verifier: Verifier::new(config.verifier),
            gate: Gate::new(config.gate),
            store,
            alerts,
            stats,
        }
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn settings(&self) -> Settings {
        Settings {
            person_confidence: self.person_confidence,
            min_detections: self.verifier.config().min_detections,
            known_confidence: self.verifier.config().known_confidence,
            alert_cooldown_secs: self.gate.alert_cooldown().num_seconds().max(0) as u64,
            save_images: self.gate.save_images(),
            frame_skip: self.frame_skip,
            buzzer_pattern: self.buzzer_pattern,
        }
    }

    /// Apply a settings patch. Rejected as a whole when any value is out of range.
    pub fn apply(&mut self, patch: &SettingsPatch) -> Result<Settings> {
        for (name, value) in [
            ("person_confidence", patch.person_confidence),
            ("known_confidence", patch.known_confidence),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(anyhow!("{} must be within [0, 1], got {}", name, v));
                }
            }
        }
        if patch.min_detections == Some(0) {
            return Err(anyhow!("min_detections must be at least 1"));
        }
        if patch.frame_skip == Some(0) {
            return Err(anyhow!("frame_skip must be at least 1"));
        }

        if let Some(v) = patch.person_confidence {
            self.person_confidence = v;
        }
        if let Some(v) = patch.min_detections {
            self.verifier.set_min_detections(v);
        }
        if let Some(v) = patch.known_confidence {
            self.verifier.set_known_confidence(v);
        }
        if let Some(secs) = patch.alert_cooldown_secs {
            self.gate
                .set_alert_cooldown(Duration::seconds(secs.min(i64::MAX as u64) as i64));
        }
        if let Some(v) = patch.save_images {
            self.gate.set_save_images(v);
        }
        if let Some(v) = patch.frame_skip {
            self.frame_skip = v;
        }
        if let Some(v) = patch.buzzer_pattern {
            self.buzzer_pattern = v;
        }
        let settings = self.settings();
        log::info!("DetectionPipeline: settings updated: {:?}", settings);
        Ok(settings)
    }

    /// Apply the pre-filters and fold face boxes into the person boxes containing them.
    ///
    /// Returns the surviving boxes with their identity samples and the number of
    /// person boxes dropped for being too small.
    pub(crate) fn candidates(&self, frame: &Frame, boxes: &[BoundingBox]) -> (Vec<Candidate>, u32) {
        let min_area = frame.area() * self.min_person_area_percent / 100.0;
        let mut too_small = 0;
        let mut persons: Vec<Candidate> = Vec::new();
        for bbox in boxes.iter().filter(|b| b.label == Label::Person) {
            if bbox.confidence < self.person_confidence {
                continue;
            }
            if bbox.area() < min_area {
                too_small += 1;
                continue;
            }
            persons.push(Candidate {
                bbox: *bbox,
                sample: 0.0,
            });
        }

        let mut faces = Vec::new();
        for face in boxes.iter().filter(|b| b.label.is_face()) {
            let center = face.center();
            let mut folded = false;
            for person in persons.iter_mut().filter(|p| p.bbox.contains_point(center)) {
                person.sample = person.sample.max(face.confidence);
                folded = true;
            }
            if !folded {
                faces.push(Candidate {
                    bbox: *face,
                    sample: face.confidence,
                });
            }
        }
        persons.extend(faces);
        (persons, too_small)
    }

    /// Run one frame's detections through tracking, verification and the gate.
    pub fn process(&mut self, frame: &Frame, boxes: &[BoundingBox]) -> FrameOutcome {
        self.stats.record_frame();
        let (candidates, too_small) = self.candidates(frame, boxes);
        self.stats.record_too_small(u64::from(too_small));

        let tracked: Vec<BoundingBox> = candidates.iter().map(|c| c.bbox).collect();
        let assignments = self.tracker.update(frame.index, &tracked);

        let mut outcome = FrameOutcome::default();
        for (candidate, (bbox, track_id)) in candidates.iter().zip(assignments) {
            let Some(track) = self.tracker.get_mut(track_id) else {
                continue;
            };
            let resolved = self.verifier.observe(track, candidate.sample);
            let mean_confidence = track.mean_confidence();
            outcome.overlays.push(TrackOverlay {
                track_id,
                bbox,
                state: track.state,
                label: self.verifier.label(track),
            });

            if let Some(classification) = resolved {
                let event = CommitEvent {
                    track_id,
                    classification,
                    mean_confidence,
                    frame: frame.clone(),
                    crop: frame.crop(&bbox).unwrap_or_else(|| RgbImage::new(0, 0)),
                    bbox,
                    timestamp: frame.captured_at,
                };
                outcome.commits.push(self.commit(event));
            }
        }
        outcome
    }

    fn commit(&mut self, event: CommitEvent) -> CommitOutcome {
        log::info!(
            "DetectionPipeline: track {} resolved {} (mean {:.3})",
            event.track_id,
            event.classification.as_str(),
            event.mean_confidence
        );
        self.stats.record_commit(event.classification);
        let decision = self.gate.admit(&event);

        if decision.alert {
            self.alerts.alert(self.buzzer_pattern);
        }

        let mut record = None;
        match (decision.persist, decision.hash) {
            (true, Some(hash)) => match self.persist(&event) {
                Ok(saved) => {
                    self.gate.remember(event.classification, hash, event.timestamp);
                    self.stats.record_image_saved();
                    record = Some(saved);
                }
                Err(err) => {
                    log::error!("DetectionPipeline: evidence not saved: {:#}", err);
                    self.stats.record_storage_failure(&format!("{:#}", err));
                }
            },
            _ => {
                if let Some(rejection) = decision.rejection {
                    log::debug!(
                        "DetectionPipeline: track {} not persisted: {:?}",
                        event.track_id,
                        rejection
                    );
                    if rejection.is_blocked() {
                        self.stats.record_blocked();
                    }
                }
            }
        }

        CommitOutcome {
            track_id: event.track_id,
            classification: event.classification,
            mean_confidence: event.mean_confidence,
            decision,
            record,
        }
    }

    fn persist(&self, event: &CommitEvent) -> Result<DetectionRecord> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("evidence store lock poisoned"))?;
        store.persist(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingDispatcher;
    use crate::storage::{EvidenceStore, InMemoryEvidenceStore};
    use chrono::Local;
    use image::Rgb;

    fn pipeline() -> (DetectionPipeline, Arc<RecordingDispatcher>, Arc<Statistics>) {
        let store: SharedStore = Arc::new(Mutex::new(InMemoryEvidenceStore::new()));
        let alerts = Arc::new(RecordingDispatcher::new());
        let stats = Arc::new(Statistics::new());
        let pipeline = DetectionPipeline::new(
            PipelineConfig::default(),
            store,
            alerts.clone(),
            stats.clone(),
        );
        (pipeline, alerts, stats)
    }

    fn frame(index: u64) -> Frame {
        let image = RgbImage::from_fn(320, 240, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 80]));
        Frame::new("cam", index, image).at(Local::now())
    }

    fn person() -> BoundingBox {
        BoundingBox::new(100.0, 60.0, 80.0, 150.0, Label::Person, 0.9)
    }

    fn face(confidence: f32) -> BoundingBox {
        BoundingBox::new(120.0, 70.0, 30.0, 30.0, Label::Face(0), confidence)
    }

    #[test]
    fn faces_fold_into_their_person_box() {
        let (pipeline, _, _) = pipeline();
        let stray = BoundingBox::new(10.0, 10.0, 20.0, 20.0, Label::Face(1), 0.5);
        let (candidates, too_small) =
            pipeline.candidates(&frame(1), &[person(), face(0.7), face(0.95), stray]);
        assert_eq!(too_small, 0);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].bbox.label, Label::Person);
        assert!((candidates[0].sample - 0.95).abs() < 1e-6);
        assert_eq!(candidates[1].bbox, stray);
        assert!((candidates[1].sample - 0.5).abs() < 1e-6);
    }

    #[test]
    fn weak_and_tiny_persons_are_filtered() {
        let (pipeline, _, _) = pipeline();
        let weak = BoundingBox::new(100.0, 60.0, 80.0, 150.0, Label::Person, 0.5);
        let tiny = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.99);
        let (candidates, too_small) = pipeline.candidates(&frame(1), &[weak, tiny]);
        assert!(candidates.is_empty());
        assert_eq!(too_small, 1);
    }

    #[test]
    fn tiny_persons_are_counted_apart_from_blocked_commits() {
        let (mut pipeline, _, stats) = pipeline();
        let tiny = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.99);
        let out = pipeline.process(&frame(1), &[tiny, tiny]);
        assert!(out.overlays.is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.daily.too_small_filtered, 2);
        assert_eq!(snap.daily.false_positives_blocked, 0);
    }

    #[test]
    fn confident_faces_commit_known_once_on_fifth_frame() {
        let (mut pipeline, alerts, stats) = pipeline();
        let mut commits = Vec::new();
        for (i, conf) in [0.93, 0.94, 0.91, 0.95, 0.92, 0.99].iter().enumerate() {
            let out = pipeline.process(&frame(i as u64 + 1), &[person(), face(*conf)]);
            for commit in out.commits {
                commits.push((i + 1, commit.classification));
            }
        }
        assert_eq!(commits, vec![(5, Classification::Known)]);
        assert!(alerts.patterns().is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.daily.known_today, 1);
        assert_eq!(snap.daily.images_saved, 1);
        assert_eq!(pipeline.store().lock().expect("store").len(), 1);
    }

    #[test]
    fn person_without_face_resolves_unknown_and_alerts() {
        let (mut pipeline, alerts, _) = pipeline();
        let mut last = FrameOutcome::default();
        for i in 1..=5 {
            last = pipeline.process(&frame(i), &[person()]);
        }
        assert_eq!(last.commits.len(), 1);
        assert_eq!(last.commits[0].classification, Classification::Unknown);
        assert_eq!(alerts.patterns(), vec![1]);
        assert_eq!(last.overlays[0].label, "UNKNOWN 0.00");
    }

    #[test]
    fn overlay_reports_verification_progress() {
        let (mut pipeline, _, _) = pipeline();
        let out = pipeline.process(&frame(1), &[person()]);
        assert_eq!(out.overlays.len(), 1);
        assert_eq!(out.overlays[0].state, TrackState::Pending);
        assert_eq!(out.overlays[0].label, "verifying 1/5");
    }

    #[test]
    fn storage_failure_is_counted_and_hash_not_remembered() {
        let mut failing = InMemoryEvidenceStore::new();
        failing.set_fail_writes(true);
        let store: SharedStore = Arc::new(Mutex::new(failing));
        let stats = Arc::new(Statistics::new());
        let mut pipeline = DetectionPipeline::new(
            PipelineConfig::default(),
            store,
            Arc::new(RecordingDispatcher::new()),
            stats.clone(),
        );
        let mut outcome = FrameOutcome::default();
        for i in 1..=5 {
            outcome = pipeline.process(&frame(i), &[person()]);
        }
        assert!(outcome.commits[0].decision.persist);
        assert!(outcome.commits[0].record.is_none());
        let snap = stats.snapshot();
        assert_eq!(snap.storage_failures, 1);
        assert!(snap.storage_error.is_some());
        assert_eq!(snap.daily.unknown_today, 1);
        assert!(pipeline.gate.last_persisted(Classification::Unknown).is_none());
    }

    #[test]
    fn settings_patch_is_validated_before_applying() {
        let (mut pipeline, _, _) = pipeline();
        let bad = SettingsPatch {
            person_confidence: Some(0.5),
            known_confidence: Some(1.5),
            ..SettingsPatch::default()
        };
        assert!(pipeline.apply(&bad).is_err());
        assert_eq!(pipeline.settings().person_confidence, 0.75);

        let good = SettingsPatch {
            min_detections: Some(3),
            frame_skip: Some(2),
            save_images: Some(false),
            ..SettingsPatch::default()
        };
        let settings = pipeline.apply(&good).expect("valid patch");
        assert_eq!(settings.min_detections, 3);
        assert_eq!(settings.frame_skip, 2);
        assert!(!settings.save_images);
    }
}
