//! Cross-frame identity tracker.
//!
//! Greedy nearest-centre association: every (box, track) pair within
//! `max_track_distance` is a candidate, candidates are taken in
//! `(distance, track_id, box order)` order, and a pair is accepted only when
//! neither side is already claimed. Track ids are monotonically assigned and
//! never reused, including after eviction.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::BoundingBox;

/// Classification state of a track. `Known` and `Unknown` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Pending,
    Known,
    Unknown,
}

impl TrackState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, TrackState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Pending => "pending",
            TrackState::Known => "known",
            TrackState::Unknown => "unknown",
        }
    }
}

/// A persistent identity.
#[derive(Clone, Debug)]
pub struct Track {
    pub track_id: u64,
    pub last_box: BoundingBox,
    pub last_seen_frame: u64,
    pub first_seen_frame: u64,
    /// Associated updates while pending; frozen once resolved.
    pub detection_count: u32,
    pub confidence_samples: Vec<f32>,
    /// Consecutive updates without a matching box.
    pub missed_updates: u32,
    pub state: TrackState,
    /// Set once the commit event for this track has been emitted.
    pub committed: bool,
}

impl Track {
    fn new(track_id: u64, bbox: BoundingBox, frame_index: u64) -> Self {
        Self {
            track_id,
            last_box: bbox,
            last_seen_frame: frame_index,
            first_seen_frame: frame_index,
            detection_count: 0,
            confidence_samples: Vec::new(),
            missed_updates: 0,
            state: TrackState::Pending,
            committed: false,
        }
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.confidence_samples.is_empty() {
            0.0
        } else {
            self.confidence_samples.iter().sum::<f32>() / self.confidence_samples.len() as f32
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Maximum centre distance in pixels for a box to continue a track.
    pub max_track_distance: f32,
    /// Unmatched updates tolerated before a track is evicted.
    pub track_timeout_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_track_distance: 100.0,
            track_timeout_frames: 30,
        }
    }
}

#[derive(Debug, Default)]
pub struct Tracker {
    config: TrackerConfig,
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    evicted: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 0,
            evicted: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Associate `boxes` with tracks. Returns one `(box, track_id)` per input box,
    /// in input order.
    pub fn update(&mut self, frame_index: u64, boxes: &[BoundingBox]) -> Vec<(BoundingBox, u64)> {
        let mut candidates: Vec<(f32, u64, usize)> = Vec::new();
        for (box_idx, bbox) in boxes.iter().enumerate() {
            for track in self.tracks.values() {
                let distance = bbox.center_distance(&track.last_box);
                if distance <= self.config.max_track_distance {
                    candidates.push((distance, track.track_id, box_idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut box_owner: Vec<Option<u64>> = vec![None; boxes.len()];
        let mut claimed_tracks = Vec::new();
        for (_, track_id, box_idx) in candidates {
            if box_owner[box_idx].is_some() || claimed_tracks.contains(&track_id) {
                continue;
            }
            box_owner[box_idx] = Some(track_id);
            claimed_tracks.push(track_id);
        }

        for track in self.tracks.values_mut() {
            if claimed_tracks.contains(&track.track_id) {
                continue;
            }
            track.missed_updates = track.missed_updates.saturating_add(1);
        }
        let timeout = self.config.track_timeout_frames;
        let before = self.tracks.len();
        self.tracks.retain(|id, track| {
            let keep = track.missed_updates <= timeout;
            if !keep {
                log::debug!("Tracker: evicting track {} ({:?})", id, track.state);
            }
            keep
        });
        self.evicted += (before - self.tracks.len()) as u64;

        let mut out = Vec::with_capacity(boxes.len());
        for (bbox, owner) in boxes.iter().zip(box_owner) {
            let track_id = match owner.and_then(|id| self.tracks.get_mut(&id)) {
                Some(track) => {
                    track.last_box = *bbox;
                    track.last_seen_frame = frame_index;
                    track.missed_updates = 0;
                    track.track_id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.insert(id, Track::new(id, *bbox, frame_index));
                    id
                }
            };
            out.push((*bbox, track_id));
        }
        out
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn get_mut(&mut self, track_id: u64) -> Option<&mut Track> {
        self.tracks.get_mut(&track_id)
    }

    /// Active tracks in id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Total tracks evicted so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
