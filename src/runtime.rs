//! Detection service: the loop that pulls frames from the multiplexer and feeds
//! the pipeline.
//!
//! Start and stop are immediate and idempotent. Stopping bumps an epoch; a detector
//! call already in flight finishes, but its result is dropped because the epoch it
//! started under is gone. The pipeline (and its tracks) outlives stop/start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::Serialize;

use crate::alert::{AlertCounters, AlertDispatcher};
use crate::detect::DetectorRegistry;
use crate::error::WatchError;
use crate::pipeline::{SharedPipeline, TrackOverlay};
use crate::stats::{Statistics, StatsSnapshot};
use crate::storage::DetectionSummary;
use crate::stream::{StreamMultiplexer, StreamStatus};

const IDLE_POLL: Duration = Duration::from_millis(15);

/// Everything the status surface reports.
#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub camera: StreamStatus,
    pub detector: Option<String>,
    pub tracks_active: usize,
    pub alerts: AlertCounters,
    pub last_24h: DetectionSummary,
}

pub struct DetectionService {
    mux: Arc<StreamMultiplexer>,
    detectors: Arc<DetectorRegistry>,
    pipeline: SharedPipeline,
    alerts: Arc<dyn AlertDispatcher>,
    stats: Arc<Statistics>,
    overlays: Arc<RwLock<Arc<Vec<TrackOverlay>>>>,
    /// Odd while running. Each start and each stop increments it.
    epoch: Arc<AtomicU64>,
    /// Loop threads not yet joined. A quick stop/start can leave a retired loop
    /// finishing its last detector call next to the current one.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DetectionService {
    pub fn new(
        mux: Arc<StreamMultiplexer>,
        detectors: Arc<DetectorRegistry>,
        pipeline: SharedPipeline,
        alerts: Arc<dyn AlertDispatcher>,
    ) -> Result<Self> {
        let stats = pipeline
            .lock()
            .map_err(|_| anyhow!("pipeline lock poisoned"))?
            .stats()
            .clone();
        Ok(Self {
            mux,
            detectors,
            pipeline,
            alerts,
            stats,
            overlays: Arc::new(RwLock::new(Arc::new(Vec::new()))),
            epoch: Arc::new(AtomicU64::new(0)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) % 2 == 1
    }

    pub fn pipeline(&self) -> &SharedPipeline {
        &self.pipeline
    }

    pub fn detectors(&self) -> &Arc<DetectorRegistry> {
        &self.detectors
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.mux
    }

    /// Start the detection loop. Returns false when it was already running.
    pub fn start(&self) -> Result<bool> {
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| anyhow!("service lock poisoned"))?;
        if self.is_running() {
            return Ok(false);
        }
        let (finished, retired): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(|handle| handle.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                log::warn!("DetectionService: a previous detection loop panicked");
            }
        }
        *workers = retired;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = LoopContext {
            epoch,
            current: self.epoch.clone(),
            mux: self.mux.clone(),
            detectors: self.detectors.clone(),
            pipeline: self.pipeline.clone(),
            stats: self.stats.clone(),
            overlays: self.overlays.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("detection-{}", epoch))
            .spawn(move || ctx.run())
            .context("spawn detection loop")?;
        workers.push(handle);
        self.stats.set_active(true);
        log::info!("DetectionService: started (epoch {})", epoch);
        Ok(true)
    }

    /// Stop the detection loop without waiting for it. Returns false when it was not running.
    pub fn stop(&self) -> Result<bool> {
        let _workers = self
            .workers
            .lock()
            .map_err(|_| anyhow!("service lock poisoned"))?;
        if !self.is_running() {
            return Ok(false);
        }
        // Bumped under the overlay lock so a loop finishing its frame cannot
        // republish overlays after the clear.
        let epoch = match self.overlays.write() {
            Ok(mut overlays) => {
                *overlays = Arc::new(Vec::new());
                self.epoch.fetch_add(1, Ordering::SeqCst) + 1
            }
            Err(_) => self.epoch.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.stats.set_active(false);
        log::info!("DetectionService: stopped (epoch {})", epoch);
        Ok(true)
    }

    /// Stop and wait for every loop thread, retired ones included, to exit.
    pub fn shutdown(&self) -> Result<()> {
        self.stop()?;
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map_err(|_| anyhow!("service lock poisoned"))?
            .drain(..)
            .collect();
        let mut panicked = 0;
        for handle in handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(anyhow!("{} detection loop(s) panicked", panicked));
        }
        Ok(())
    }

    /// Overlays of the last processed frame.
    pub fn overlays(&self) -> Arc<Vec<TrackOverlay>> {
        self.overlays
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn status(&self) -> SystemStatus {
        let (tracks_active, last_24h) = match self.pipeline.lock() {
            Ok(pipeline) => {
                let cutoff = Local::now() - chrono::Duration::hours(24);
                let summary = pipeline
                    .store()
                    .lock()
                    .map(|store| store.summary_since(cutoff))
                    .unwrap_or_default();
                (pipeline.tracker().len(), summary)
            }
            Err(_) => (0, DetectionSummary::default()),
        };
        SystemStatus {
            stats: self.stats.snapshot(),
            camera: self.mux.status(),
            detector: self.detectors.active_name(),
            tracks_active,
            alerts: self.alerts.counters(),
            last_24h,
        }
    }
}

impl Drop for DetectionService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct LoopContext {
    epoch: u64,
    current: Arc<AtomicU64>,
    mux: Arc<StreamMultiplexer>,
    detectors: Arc<DetectorRegistry>,
    pipeline: SharedPipeline,
    stats: Arc<Statistics>,
    overlays: Arc<RwLock<Arc<Vec<TrackOverlay>>>>,
}

impl LoopContext {
    fn live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.epoch
    }

    fn run(self) {
        let mut last_index: Option<u64> = None;
        let mut fresh_frames: u64 = 0;
        while self.live() {
            let frame = match self.mux.read_latest() {
                Ok(frame) if last_index.map_or(true, |last| frame.index > last) => frame,
                _ => {
                    std::thread::sleep(IDLE_POLL);
                    continue;
                }
            };
            last_index = Some(frame.index);
            fresh_frames += 1;

            let frame_skip = match self.pipeline.lock() {
                Ok(pipeline) => u64::from(pipeline.frame_skip()),
                Err(_) => break,
            };
            if (fresh_frames - 1) % frame_skip != 0 {
                continue;
            }

            let result = self.detectors.detect(&frame);

            let Ok(mut pipeline) = self.pipeline.lock() else {
                break;
            };
            if !self.live() {
                log::debug!(
                    "DetectionService: dropping result for frame {} from epoch {}",
                    frame.index,
                    self.epoch
                );
                break;
            }
            match result {
                Ok(boxes) => {
                    let outcome = pipeline.process(&frame, &boxes);
                    if let Ok(mut overlays) = self.overlays.write() {
                        if self.live() {
                            *overlays = Arc::new(outcome.overlays);
                        }
                    }
                }
                Err(err) => {
                    let err = WatchError::DetectorFailure {
                        backend: self
                            .detectors
                            .active_name()
                            .unwrap_or_else(|| "none".to_string()),
                        reason: format!("{:#}", err),
                    };
                    log::warn!("DetectionService: {}", err);
                    self.stats.record_detector_failure();
                }
            }
        }
        log::debug!("DetectionService: loop for epoch {} exited", self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingDispatcher;
    use crate::detect::{BoundingBox, Label, ScriptedBackend};
    use crate::ingest::CameraDescriptor;
    use crate::pipeline::{DetectionPipeline, PipelineConfig};
    use crate::storage::{InMemoryEvidenceStore, SharedStore};
    use crate::stream::StreamConfig;
    use std::time::Instant;

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn service(backend: ScriptedBackend) -> DetectionService {
        let mux = Arc::new(StreamMultiplexer::new(StreamConfig::default()));
        mux.open(&CameraDescriptor::local(
            "webcam_0",
            "Synthetic",
            "stub://runtime?width=320&height=240&fps=60",
        ))
        .expect("open stub camera");
        let detectors = Arc::new(DetectorRegistry::new());
        detectors.register(backend).expect("register backend");
        let store: SharedStore = Arc::new(Mutex::new(InMemoryEvidenceStore::new()));
        let alerts = Arc::new(RecordingDispatcher::new());
        let pipeline = DetectionPipeline::new(
            PipelineConfig {
                frame_skip: 1,
                ..PipelineConfig::default()
            },
            store,
            alerts.clone(),
            Arc::new(Statistics::new()),
        );
        DetectionService::new(mux, detectors, Arc::new(Mutex::new(pipeline)), alerts)
            .expect("service")
    }

    fn person() -> BoundingBox {
        BoundingBox::new(100.0, 60.0, 80.0, 150.0, Label::Person, 0.9)
    }

    #[test]
    fn start_and_stop_are_idempotent() -> Result<()> {
        let service = service(ScriptedBackend::new().repeat(vec![person()]));
        assert!(service.start()?);
        assert!(!service.start()?);
        assert!(service.status().stats.active);
        assert!(service.stop()?);
        assert!(!service.stop()?);
        assert!(!service.status().stats.active);
        service.shutdown()?;
        Ok(())
    }

    #[test]
    fn loop_commits_unknown_person_and_keeps_tracks_across_restart() -> Result<()> {
        let service = service(ScriptedBackend::new().repeat(vec![person()]));
        service.start()?;
        assert!(wait_for(|| service.status().stats.daily.unknown_today == 1));
        assert!(!service.overlays().is_empty());
        service.shutdown()?;
        assert!(service.overlays().is_empty());

        let tracks = service.status().tracks_active;
        assert_eq!(tracks, 1);
        service.start()?;
        assert!(wait_for(|| service.status().stats.frames_processed > 10));
        service.shutdown()?;
        let status = service.status();
        assert_eq!(status.tracks_active, 1);
        assert_eq!(status.stats.daily.unknown_today, 1);
        Ok(())
    }

    #[test]
    fn detector_failures_are_counted_and_loop_continues() -> Result<()> {
        let backend = ScriptedBackend::new()
            .then_fail("model crashed")
            .then_fail("model crashed")
            .repeat(vec![]);
        let handle = backend.handle();
        let service = service(backend);
        service.start()?;
        assert!(wait_for(|| handle.calls() > 4));
        service.shutdown()?;
        let status = service.status();
        assert_eq!(status.stats.detector_failures, 2);
        assert!(status.stats.frames_processed >= 2);
        Ok(())
    }

    #[test]
    fn stop_discards_in_flight_detection() -> Result<()> {
        let backend = ScriptedBackend::new()
            .repeat(vec![person()])
            .with_delay(Duration::from_millis(300));
        let handle = backend.handle();
        let service = service(backend);
        service.start()?;
        std::thread::sleep(Duration::from_millis(100));
        service.stop()?;
        assert!(wait_for(|| handle.calls() == 1));
        service.shutdown()?;
        assert_eq!(service.status().stats.frames_processed, 0);
        Ok(())
    }

    #[test]
    fn shutdown_joins_loop_retired_by_quick_restart() -> Result<()> {
        let backend = ScriptedBackend::new()
            .repeat(vec![])
            .with_delay(Duration::from_millis(200));
        let handle = backend.handle();
        let service = service(backend);
        service.start()?;
        assert!(wait_for(|| handle.calls() >= 1));
        service.stop()?;
        service.start()?;

        service.shutdown()?;
        assert!(service.workers.lock().expect("workers").is_empty());
        // Every loop context held a clone of the epoch counter.
        assert_eq!(Arc::strong_count(&service.epoch), 1);
        Ok(())
    }
}
