//! Training-data capture.
//!
//! A third multiplexer reader next to the preview and the detection loop. Frames
//! are written as JPEGs into one directory per capture session:
//!
//! ```text
//! training_data/
//!   metadata.json
//!   alice_20240501_101500/img_0000_20240501_101501_123456.jpg
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::cameras::camera_slug;
use crate::error::StreamError;
use crate::frame::Frame;
use crate::stream::StreamMultiplexer;

const METADATA_FILE: &str = "metadata.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Collecting,
    Complete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct DatasetEntry {
    person: String,
    camera: String,
    created: String,
    count: u32,
    status: DatasetStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    datasets: BTreeMap<String, DatasetEntry>,
}

/// A dataset as listed to callers. `count` is the number of images on disk.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub person: String,
    pub camera: String,
    pub created: String,
    pub count: usize,
    pub status: DatasetStatus,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureProgress {
    pub captured: u32,
    pub target: u32,
    pub complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStatus {
    pub capturing: bool,
    pub dataset: Option<String>,
    pub person: Option<String>,
    pub camera: Option<String>,
    pub captured: u32,
    pub target: u32,
}

#[derive(Debug)]
struct Session {
    dataset: String,
    person: String,
    camera: String,
    path: PathBuf,
    captured: u32,
    target: u32,
}

#[derive(Debug)]
struct Inner {
    metadata: Metadata,
    session: Option<Session>,
}

pub struct TrainingCapture {
    base_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl TrainingCapture {
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("create dataset directory {}", base_dir.display()))?;
        let metadata_path = base_dir.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let raw = fs::read_to_string(&metadata_path)
                .with_context(|| format!("read {}", metadata_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse {}", metadata_path.display()))?
        } else {
            Metadata::default()
        };
        Ok(Self {
            base_dir,
            inner: Mutex::new(Inner {
                metadata,
                session: None,
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("capture state lock poisoned"))
    }

    fn save_metadata(&self, metadata: &Metadata) -> Result<()> {
        let path = self.base_dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(metadata).context("serialize dataset metadata")?;
        fs::write(&path, json).with_context(|| format!("write {}", path.display()))
    }

    /// Begin a capture session for `person`. Returns the dataset name.
    pub fn start(&self, person: &str, camera_id: &str, target: u32) -> Result<String> {
        if person.trim().is_empty() {
            return Err(anyhow!("person name must not be empty"));
        }
        if target == 0 {
            return Err(anyhow!("capture target must be at least 1"));
        }
        let mut inner = self.lock()?;
        if let Some(session) = inner.session.as_ref() {
            return Err(anyhow!("already capturing into {}", session.dataset));
        }

        let created = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let dataset = format!("{}_{}", camera_slug(person.trim()), created);
        let path = self.base_dir.join(&dataset);
        fs::create_dir_all(&path)
            .with_context(|| format!("create dataset {}", path.display()))?;

        inner.metadata.datasets.insert(
            dataset.clone(),
            DatasetEntry {
                person: person.trim().to_string(),
                camera: camera_id.to_string(),
                created,
                count: 0,
                status: DatasetStatus::Collecting,
            },
        );
        self.save_metadata(&inner.metadata)?;
        inner.session = Some(Session {
            dataset: dataset.clone(),
            person: person.trim().to_string(),
            camera: camera_id.to_string(),
            path,
            captured: 0,
            target,
        });
        log::info!(
            "TrainingCapture: started {} for {} on {} (target {})",
            dataset,
            person,
            camera_id,
            target
        );
        Ok(dataset)
    }

    /// Write one frame into the current dataset. Stops the session once the target is reached.
    pub fn capture_frame(&self, frame: &Frame) -> Result<CaptureProgress> {
        let mut inner = self.lock()?;
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("not capturing"))?;
        let stamp = frame.captured_at.format("%Y%m%d_%H%M%S_%6f");
        let file = session
            .path
            .join(format!("img_{:04}_{}.jpg", session.captured, stamp));
        frame
            .to_rgb_image()?
            .save(&file)
            .with_context(|| format!("write training image {}", file.display()))?;
        session.captured += 1;

        let progress = CaptureProgress {
            captured: session.captured,
            target: session.target,
            complete: session.captured >= session.target,
        };
        let dataset = session.dataset.clone();
        if let Some(entry) = inner.metadata.datasets.get_mut(&dataset) {
            entry.count = progress.captured;
        }
        if progress.complete {
            Self::finish(self, &mut inner)?;
        }
        Ok(progress)
    }

    fn finish(&self, inner: &mut Inner) -> Result<u32> {
        let session = inner
            .session
            .take()
            .ok_or_else(|| anyhow!("not capturing"))?;
        if let Some(entry) = inner.metadata.datasets.get_mut(&session.dataset) {
            entry.count = session.captured;
            entry.status = DatasetStatus::Complete;
        }
        self.save_metadata(&inner.metadata)?;
        log::info!(
            "TrainingCapture: {} complete, {} images collected",
            session.dataset,
            session.captured
        );
        Ok(session.captured)
    }

    /// End the current session. Returns the number of images captured.
    pub fn stop(&self) -> Result<u32> {
        let mut inner = self.lock()?;
        self.finish(&mut inner)
    }

    pub fn status(&self) -> CaptureStatus {
        let Ok(inner) = self.inner.lock() else {
            return CaptureStatus::default();
        };
        match inner.session.as_ref() {
            Some(s) => CaptureStatus {
                capturing: true,
                dataset: Some(s.dataset.clone()),
                person: Some(s.person.clone()),
                camera: Some(s.camera.clone()),
                captured: s.captured,
                target: s.target,
            },
            None => CaptureStatus::default(),
        }
    }

    pub fn datasets(&self) -> Result<Vec<DatasetSummary>> {
        let inner = self.lock()?;
        let mut out = Vec::with_capacity(inner.metadata.datasets.len());
        for (name, entry) in &inner.metadata.datasets {
            let path = self.base_dir.join(name);
            out.push(DatasetSummary {
                name: name.clone(),
                person: entry.person.clone(),
                camera: entry.camera.clone(),
                created: entry.created.clone(),
                count: count_images(&path),
                status: entry.status,
                path,
            });
        }
        Ok(out)
    }

    /// Remove a dataset directory and its metadata entry. Returns false when unknown.
    pub fn delete_dataset(&self, name: &str) -> Result<bool> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(anyhow!("invalid dataset name {:?}", name));
        }
        let mut inner = self.lock()?;
        if inner
            .session
            .as_ref()
            .is_some_and(|session| session.dataset == name)
        {
            return Err(anyhow!("dataset {} is still being captured", name));
        }
        let path = self.base_dir.join(name);
        let existed_on_disk = path.is_dir();
        if existed_on_disk {
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove dataset {}", path.display()))?;
        }
        let existed_in_metadata = inner.metadata.datasets.remove(name).is_some();
        if existed_in_metadata {
            self.save_metadata(&inner.metadata)?;
        }
        if existed_on_disk || existed_in_metadata {
            log::info!("TrainingCapture: deleted dataset {}", name);
        }
        Ok(existed_on_disk || existed_in_metadata)
    }

    /// Pull frames from the multiplexer every `interval` until the session ends.
    ///
    /// The reader is bound to the camera that is current when this is called; a
    /// camera switch or close ends the session.
    pub fn spawn_auto(
        self: &Arc<Self>,
        mux: &StreamMultiplexer,
        interval: Duration,
    ) -> Result<JoinHandle<()>> {
        let dataset = self
            .status()
            .dataset
            .ok_or_else(|| anyhow!("not capturing"))?;
        let handle = mux.handle().ok_or_else(|| anyhow!("no camera open"))?;
        let capture = self.clone();
        std::thread::Builder::new()
            .name("training-capture".to_string())
            .spawn(move || {
                let mut last_index = None;
                while capture.status().dataset.as_deref() == Some(dataset.as_str()) {
                    match handle.read_latest() {
                        Ok(frame) if last_index.map_or(true, |last| frame.index > last) => {
                            last_index = Some(frame.index);
                            match capture.capture_frame(&frame) {
                                Ok(progress) if progress.complete => break,
                                Ok(_) => {}
                                Err(err) => {
                                    log::error!("TrainingCapture: {:#}", err);
                                    let _ = capture.stop();
                                    break;
                                }
                            }
                        }
                        Ok(_) | Err(StreamError::Unavailable) => {}
                        Err(err) => {
                            log::warn!(
                                "TrainingCapture: camera {} went away ({}), ending capture",
                                handle.camera_id(),
                                err
                            );
                            let _ = capture.stop();
                            break;
                        }
                    }
                    std::thread::sleep(interval);
                }
            })
            .context("spawn training capture")
    }
}

fn count_images(path: &Path) -> usize {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "jpg"))
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::CameraDescriptor;
    use crate::stream::StreamConfig;
    use image::{Rgb, RgbImage};
    use std::time::Instant;

    fn frame(index: u64) -> Frame {
        Frame::new("webcam_0", index, RgbImage::from_pixel(32, 24, Rgb([10, 200, 30])))
    }

    #[test]
    fn capture_stops_at_target_and_records_metadata() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let capture = TrainingCapture::open(dir.path())?;
        let dataset = capture.start("Alice Smith", "webcam_0", 2)?;
        assert!(dataset.starts_with("alice_smith_"));
        assert!(capture.start("Bob", "webcam_0", 2).is_err());

        assert!(!capture.capture_frame(&frame(1))?.complete);
        assert!(capture.capture_frame(&frame(2))?.complete);
        assert!(!capture.status().capturing);
        assert!(capture.capture_frame(&frame(3)).is_err());

        let reopened = TrainingCapture::open(dir.path())?;
        let datasets = reopened.datasets()?;
        assert_eq!(datasets.len(), 1);
        assert_eq!(datasets[0].name, dataset);
        assert_eq!(datasets[0].person, "Alice Smith");
        assert_eq!(datasets[0].count, 2);
        assert_eq!(datasets[0].status, DatasetStatus::Complete);
        let first = fs::read_dir(dir.path().join(&dataset))?
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("img_0000_"));
        assert!(first);
        Ok(())
    }

    #[test]
    fn delete_dataset_removes_files_and_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let capture = TrainingCapture::open(dir.path())?;
        let dataset = capture.start("carol", "webcam_0", 5)?;
        assert!(capture.delete_dataset(&dataset).is_err());
        capture.capture_frame(&frame(1))?;
        assert_eq!(capture.stop()?, 1);

        assert!(capture.delete_dataset(&dataset)?);
        assert!(!dir.path().join(&dataset).exists());
        assert!(capture.datasets()?.is_empty());
        assert!(!capture.delete_dataset(&dataset)?);
        assert!(capture.delete_dataset("../escape").is_err());
        Ok(())
    }

    #[test]
    fn auto_capture_pulls_from_multiplexer() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let capture = Arc::new(TrainingCapture::open(dir.path())?);
        let mux = StreamMultiplexer::new(StreamConfig::default());
        mux.open(&CameraDescriptor::local(
            "webcam_0",
            "Synthetic",
            "stub://capture?width=64&height=48&fps=60",
        ))?;
        capture.start("dave", "webcam_0", 3)?;
        let worker = capture.spawn_auto(&mux, Duration::from_millis(5))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while capture.status().capturing && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        worker.join().map_err(|_| anyhow!("capture thread panicked"))?;
        let datasets = capture.datasets()?;
        assert_eq!(datasets[0].count, 3);
        Ok(())
    }
}
