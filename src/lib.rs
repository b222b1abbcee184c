//! watchpost
//!
//! Person verification for home security cameras: detections from a pluggable
//! detector are tracked across frames, confirmed as known or unknown people,
//! and gated before evidence is written or the buzzer goes off.
//!
//! # Module Structure
//!
//! - `ingest`: camera sources (synthetic, MJPEG over HTTP, V4L2)
//! - `stream`: one connection per camera, latest-frame fan-out, reconnect/backoff
//! - `cameras`: camera registry and selection
//! - `detect`: detector backends and the active-backend registry
//! - `tracker`, `verification`, `gate`: the per-track confirmation core
//! - `pipeline`, `runtime`: per-frame glue and the detection loop
//! - `storage`, `alert`, `stats`: evidence sink, buzzer client, daily counters
//! - `capture`: training-data capture
//! - `api`: status and preview HTTP surface

pub mod alert;
pub mod api;
pub mod cameras;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod gate;
pub mod ingest;
pub mod pipeline;
pub mod runtime;
pub mod stats;
pub mod storage;
pub mod stream;
pub mod tracker;
pub mod verification;

pub use alert::{AlertCounters, AlertDispatcher, HttpBuzzer, RecordingDispatcher};
pub use cameras::CameraRegistry;
pub use capture::TrainingCapture;
pub use config::WatchpostConfig;
pub use detect::{BoundingBox, DetectorBackend, DetectorRegistry, Label};
pub use error::{StreamError, WatchError};
pub use frame::Frame;
pub use gate::{Decision, Gate, GateConfig};
pub use ingest::{CameraDescriptor, CameraKind, FrameSource};
pub use pipeline::{DetectionPipeline, PipelineConfig, SettingsPatch, TrackOverlay};
pub use runtime::{DetectionService, SystemStatus};
pub use stats::{Statistics, StatsSnapshot};
pub use storage::{DetectionRecord, EvidenceStore, InMemoryEvidenceStore, JsonEvidenceStore};
pub use stream::{LinkState, StreamConfig, StreamHandle, StreamMultiplexer, StreamStatus};
pub use tracker::{Track, TrackState, Tracker, TrackerConfig};
pub use verification::{Classification, CommitEvent, Verifier, VerifierConfig};
