//! Evidence persistence.
//!
//! The on-disk layout is a JSON Lines record log plus an image tree:
//!
//! ```text
//! security_images/
//!   known/   full_<ts>.jpg  crop_<ts>.jpg
//!   unknown/ full_<ts>.jpg  crop_<ts>.jpg
//! security_log.jsonl
//! ```
//!
//! Records are append-only. Ids continue from the highest id found in the log.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;
use crate::error::WatchError;
use crate::verification::{Classification, CommitEvent};

const OUTLINE_THICKNESS: i32 = 3;
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// One persisted detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: Classification,
    pub confidence: f32,
    pub timestamp: DateTime<Local>,
    pub date: String,
    pub time: String,
    pub image_path: Option<String>,
    #[serde(default)]
    pub crop_path: Option<String>,
    #[serde(default)]
    pub track_id: Option<u64>,
}

/// Known/unknown totals over a time window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DetectionSummary {
    pub known: u64,
    pub unknown: u64,
    pub total: u64,
}

/// Sink for gate-approved commit events.
pub trait EvidenceStore: Send {
    /// Write the annotated frame, the crop, and a record for `event`.
    fn persist(&mut self, event: &CommitEvent) -> Result<DetectionRecord>;

    /// Newest first, at most `limit`, optionally one classification only.
    fn records(&self, limit: usize, filter: Option<Classification>) -> Vec<DetectionRecord>;

    fn get(&self, id: u64) -> Option<DetectionRecord>;

    fn summary_since(&self, cutoff: DateTime<Local>) -> DetectionSummary;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedStore = Arc<Mutex<dyn EvidenceStore>>;

/// Draw the tracked box outline, a `TYPE: conf` label and the capture time onto
/// a copy of the frame.
pub fn annotate(
    frame: &RgbImage,
    bbox: &BoundingBox,
    kind: Classification,
    confidence: f32,
    at: &DateTime<Local>,
) -> RgbImage {
    let mut out = frame.clone();
    let color = match kind {
        Classification::Known => KNOWN_COLOR,
        Classification::Unknown => UNKNOWN_COLOR,
    };
    if let Some((x0, y0, x1, y1)) = bbox.clamped_corners(out.width(), out.height()) {
        for inset in 0..OUTLINE_THICKNESS {
            let w = (x1 - x0) as i32 - 2 * inset;
            let h = (y1 - y0) as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x0 as i32 + inset, y0 as i32 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut out, rect, color);
        }

        let label = format!("{}: {:.2}", kind.as_str().to_uppercase(), confidence);
        let label_height = (GLYPH_HEIGHT * LABEL_SCALE) as i32;
        let label_y = if y0 as i32 >= label_height + 4 {
            y0 as i32 - label_height - 3
        } else {
            y1 as i32 + 3
        };
        draw_text(&mut out, x0 as i32, label_y, &label, LABEL_SCALE, color);
    }

    let stamp = at.format("%Y-%m-%d %H:%M:%S").to_string();
    let bar = Rect::at(0, 0).of_size(text_width(&stamp, 1) + 8, GLYPH_HEIGHT + 8);
    draw_filled_rect_mut(&mut out, bar, Rgb([0, 0, 0]));
    draw_text(&mut out, 4, 4, &stamp, 1, Rgb([255, 255, 255]));
    out
}

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const LABEL_SCALE: u32 = 2;

/// 5x7 bitmap rows for the characters labels and timestamps use.
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        _ => [0; 7],
    }
}

fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * (GLYPH_WIDTH + 1) * scale
}

/// Draw `text` with `scale` pixels per font dot, clipped at the image edge.
fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: u32, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let scale_i = scale as i32;
    for (i, c) in text.chars().enumerate() {
        let origin_x = x + i as i32 * ((GLYPH_WIDTH + 1) * scale) as i32;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..scale_i {
                    for dx in 0..scale_i {
                        let px = origin_x + col as i32 * scale_i + dx;
                        let py = y + row as i32 * scale_i + dy;
                        if (0..width).contains(&px) && (0..height).contains(&py) {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

/// File stem for evidence of record `id`; unique even when frames share a timestamp.
fn evidence_stem(at: &DateTime<Local>, id: u64) -> String {
    format!("{}_{:04}", at.format("%Y%m%d_%H%M%S_%6f"), id)
}

/// In-memory record list shared by both stores.
#[derive(Debug, Default)]
struct RecordLog {
    records: Vec<DetectionRecord>,
}

impl RecordLog {
    fn next_id(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }

    fn build(
        &self,
        event: &CommitEvent,
        image_path: Option<String>,
        crop_path: Option<String>,
    ) -> DetectionRecord {
        DetectionRecord {
            id: self.next_id(),
            kind: event.classification,
            confidence: event.mean_confidence,
            timestamp: event.timestamp,
            date: event.timestamp.format("%Y-%m-%d").to_string(),
            time: event.timestamp.format("%H:%M:%S").to_string(),
            image_path,
            crop_path,
            track_id: Some(event.track_id),
        }
    }

    fn records(&self, limit: usize, filter: Option<Classification>) -> Vec<DetectionRecord> {
        self.records
            .iter()
            .rev()
            .filter(|r| filter.map_or(true, |kind| r.kind == kind))
            .take(limit)
            .cloned()
            .collect()
    }

    fn get(&self, id: u64) -> Option<DetectionRecord> {
        self.records.iter().find(|r| r.id == id).cloned()
    }

    fn summary_since(&self, cutoff: DateTime<Local>) -> DetectionSummary {
        let mut summary = DetectionSummary::default();
        for record in self.records.iter().filter(|r| r.timestamp > cutoff) {
            match record.kind {
                Classification::Known => summary.known += 1,
                Classification::Unknown => summary.unknown += 1,
            }
            summary.total += 1;
        }
        summary
    }
}

/// Filesystem store: JSON Lines log plus `known/` and `unknown/` image folders.
pub struct JsonEvidenceStore {
    images_dir: PathBuf,
    log_path: PathBuf,
    log: RecordLog,
}

impl JsonEvidenceStore {
    /// Create the directory tree if needed and reload the existing log.
    pub fn open(images_dir: impl AsRef<Path>, log_path: impl AsRef<Path>) -> Result<Self> {
        let images_dir = images_dir.as_ref().to_path_buf();
        let log_path = log_path.as_ref().to_path_buf();
        for bucket in ["known", "unknown"] {
            let dir = images_dir.join(bucket);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create evidence directory {}", dir.display()))?;
        }
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let log = RecordLog {
            records: load_records(&log_path)?,
        };
        log::info!(
            "JsonEvidenceStore: {} records loaded from {}",
            log.records.len(),
            log_path.display()
        );
        Ok(Self {
            images_dir,
            log_path,
            log,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn write_failure(path: &Path, err: impl std::fmt::Display) -> anyhow::Error {
        WatchError::StorageWriteFailure {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
        .into()
    }

    fn append_line(&self, record: &DetectionRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serialize detection record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|err| Self::write_failure(&self.log_path, err))?;
        writeln!(file, "{}", line).map_err(|err| Self::write_failure(&self.log_path, err))?;
        file.flush()
            .map_err(|err| Self::write_failure(&self.log_path, err))
    }
}

fn load_records(log_path: &Path) -> Result<Vec<DetectionRecord>> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(log_path)
        .with_context(|| format!("open detection log {}", log_path.display()))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read detection log {}", log_path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DetectionRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => log::warn!(
                "JsonEvidenceStore: skipping malformed line {} of {}: {}",
                n + 1,
                log_path.display(),
                err
            ),
        }
    }
    Ok(records)
}

impl EvidenceStore for JsonEvidenceStore {
    fn persist(&mut self, event: &CommitEvent) -> Result<DetectionRecord> {
        let stem = evidence_stem(&event.timestamp, self.log.next_id());
        let bucket = self.images_dir.join(event.classification.as_str());
        let full_path = bucket.join(format!("full_{}.jpg", stem));
        let crop_path = bucket.join(format!("crop_{}.jpg", stem));

        let frame = event.frame.to_rgb_image()?;
        annotate(
            &frame,
            &event.bbox,
            event.classification,
            event.mean_confidence,
            &event.timestamp,
        )
            .save(&full_path)
            .map_err(|err| Self::write_failure(&full_path, err))?;
        event
            .crop
            .save(&crop_path)
            .map_err(|err| Self::write_failure(&crop_path, err))?;

        let record = self.log.build(
            event,
            Some(full_path.display().to_string()),
            Some(crop_path.display().to_string()),
        );
        self.append_line(&record)?;
        self.log.records.push(record.clone());
        log::info!("JsonEvidenceStore: image saved: {}", full_path.display());
        Ok(record)
    }

    fn records(&self, limit: usize, filter: Option<Classification>) -> Vec<DetectionRecord> {
        self.log.records(limit, filter)
    }

    fn get(&self, id: u64) -> Option<DetectionRecord> {
        self.log.get(id)
    }

    fn summary_since(&self, cutoff: DateTime<Local>) -> DetectionSummary {
        self.log.summary_since(cutoff)
    }

    fn len(&self) -> usize {
        self.log.records.len()
    }
}

/// Store keeping records and images in memory. Writes can be made to fail on demand.
#[derive(Default)]
pub struct InMemoryEvidenceStore {
    log: RecordLog,
    images: Vec<(u64, RgbImage, RgbImage)>,
    fail_writes: bool,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Annotated frame and crop stored for record `id`.
    pub fn images(&self, id: u64) -> Option<(&RgbImage, &RgbImage)> {
        self.images
            .iter()
            .find(|(rid, _, _)| *rid == id)
            .map(|(_, full, crop)| (full, crop))
    }
}

impl EvidenceStore for InMemoryEvidenceStore {
    fn persist(&mut self, event: &CommitEvent) -> Result<DetectionRecord> {
        let stem = evidence_stem(&event.timestamp, self.log.next_id());
        let bucket = event.classification.as_str();
        if self.fail_writes {
            return Err(WatchError::StorageWriteFailure {
                path: format!("memory://{}/full_{}.jpg", bucket, stem),
                reason: "writes disabled".to_string(),
            }
            .into());
        }
        let frame = event.frame.to_rgb_image()?;
        let record = self.log.build(
            event,
            Some(format!("memory://{}/full_{}.jpg", bucket, stem)),
            Some(format!("memory://{}/crop_{}.jpg", bucket, stem)),
        );
        self.images.push((
            record.id,
            annotate(
                &frame,
                &event.bbox,
                event.classification,
                event.mean_confidence,
                &event.timestamp,
            ),
            event.crop.clone(),
        ));
        self.log.records.push(record.clone());
        Ok(record)
    }

    fn records(&self, limit: usize, filter: Option<Classification>) -> Vec<DetectionRecord> {
        self.log.records(limit, filter)
    }

    fn get(&self, id: u64) -> Option<DetectionRecord> {
        self.log.get(id)
    }

    fn summary_since(&self, cutoff: DateTime<Local>) -> DetectionSummary {
        self.log.summary_since(cutoff)
    }

    fn len(&self) -> usize {
        self.log.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Label;
    use crate::frame::Frame;
    use chrono::Duration;

    fn event(kind: Classification, at: DateTime<Local>) -> CommitEvent {
        let frame = RgbImage::from_pixel(40, 30, Rgb([0, 0, 255]));
        CommitEvent {
            track_id: 4,
            classification: kind,
            mean_confidence: 0.81,
            frame: Frame::new("cam", 9, frame).at(at),
            crop: RgbImage::from_pixel(10, 10, Rgb([9, 9, 9])),
            bbox: BoundingBox::new(5.0, 5.0, 20.0, 15.0, Label::Person, 0.9),
            timestamp: at,
        }
    }

    #[test]
    fn annotation_draws_outline_label_and_timestamp() {
        let frame = RgbImage::from_pixel(200, 150, Rgb([0, 0, 255]));
        let bbox = BoundingBox::new(60.0, 60.0, 40.0, 40.0, Label::Person, 0.9);
        let at = Local::now();

        let unknown = annotate(&frame, &bbox, Classification::Unknown, 0.42, &at);
        assert_eq!(unknown.get_pixel(60, 60), &UNKNOWN_COLOR);
        assert_eq!(unknown.get_pixel(80, 80), &Rgb([0, 0, 255]));
        let label_drawn = (60..200).any(|x| (40..58).any(|y| unknown.get_pixel(x, y) == &UNKNOWN_COLOR));
        assert!(label_drawn);
        let stamp_drawn = (4..130).any(|x| (4..11).any(|y| unknown.get_pixel(x, y) == &Rgb([255, 255, 255])));
        assert!(stamp_drawn);

        let known = annotate(&frame, &bbox, Classification::Known, 0.97, &at);
        assert_eq!(known.get_pixel(99, 99), &KNOWN_COLOR);
    }

    #[test]
    fn label_moves_below_box_at_top_edge() {
        let frame = RgbImage::from_pixel(120, 120, Rgb([0, 0, 255]));
        let bbox = BoundingBox::new(30.0, 2.0, 40.0, 40.0, Label::Person, 0.9);
        let out = annotate(&frame, &bbox, Classification::Known, 0.95, &Local::now());
        let below = (30..120).any(|x| (45..60).any(|y| out.get_pixel(x, y) == &KNOWN_COLOR));
        assert!(below);
    }

    #[test]
    fn same_timestamp_commits_keep_separate_evidence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = JsonEvidenceStore::open(
            dir.path().join("security_images"),
            dir.path().join("security_log.jsonl"),
        )?;
        let at = Local::now();
        let mut red = event(Classification::Unknown, at);
        red.crop = RgbImage::from_pixel(16, 16, Rgb([220, 0, 0]));
        let mut green = event(Classification::Unknown, at);
        green.track_id = 5;
        green.crop = RgbImage::from_pixel(16, 16, Rgb([0, 220, 0]));

        let a = store.persist(&red)?;
        let b = store.persist(&green)?;
        assert_ne!(a.image_path, b.image_path);
        assert_ne!(a.crop_path, b.crop_path);

        let crop_a = image::open(a.crop_path.as_deref().expect("crop path"))?.to_rgb8();
        let crop_b = image::open(b.crop_path.as_deref().expect("crop path"))?.to_rgb8();
        let Rgb([r, g, _]) = *crop_a.get_pixel(8, 8);
        assert!(r > 150 && g < 80, "first crop overwritten: {:?}", (r, g));
        let Rgb([r, g, _]) = *crop_b.get_pixel(8, 8);
        assert!(g > 150 && r < 80, "second crop wrong: {:?}", (r, g));
        Ok(())
    }

    #[test]
    fn persisted_records_reload_with_next_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = dir.path().join("security_images");
        let log_path = dir.path().join("security_log.jsonl");
        let now = Local::now();

        let first = {
            let mut store = JsonEvidenceStore::open(&images, &log_path)?;
            let first = store.persist(&event(Classification::Unknown, now))?;
            store.persist(&event(Classification::Known, now + Duration::seconds(1)))?;
            first
        };
        assert_eq!(first.id, 0);
        let image_path = first.image_path.clone().expect("image path");
        assert!(Path::new(&image_path).exists());
        assert!(image_path.contains("unknown"));

        let mut reopened = JsonEvidenceStore::open(&images, &log_path)?;
        assert_eq!(reopened.len(), 2);
        let reread = reopened.get(0).expect("record 0");
        assert_eq!(
            (reread.kind, reread.confidence, reread.image_path.clone()),
            (first.kind, first.confidence, first.image_path.clone())
        );
        let third = reopened.persist(&event(Classification::Unknown, now + Duration::seconds(2)))?;
        assert_eq!(third.id, 2);
        Ok(())
    }

    #[test]
    fn malformed_log_lines_are_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log_path = dir.path().join("log.jsonl");
        fs::write(&log_path, "not json\n\n")?;
        let store = JsonEvidenceStore::open(dir.path().join("img"), &log_path)?;
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn queries_are_newest_first_and_filtered() -> Result<()> {
        let mut store = InMemoryEvidenceStore::new();
        let now = Local::now();
        store.persist(&event(Classification::Unknown, now - Duration::hours(30)))?;
        store.persist(&event(Classification::Known, now - Duration::hours(2)))?;
        store.persist(&event(Classification::Unknown, now))?;

        let newest: Vec<u64> = store.records(2, None).iter().map(|r| r.id).collect();
        assert_eq!(newest, vec![2, 1]);
        let unknown: Vec<u64> = store
            .records(10, Some(Classification::Unknown))
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(unknown, vec![2, 0]);

        let day = store.summary_since(now - Duration::hours(24));
        assert_eq!(day, DetectionSummary { known: 1, unknown: 1, total: 2 });
        Ok(())
    }

    #[test]
    fn failing_memory_store_reports_storage_error() {
        let mut store = InMemoryEvidenceStore::new();
        store.set_fail_writes(true);
        let err = store
            .persist(&event(Classification::Unknown, Local::now()))
            .unwrap_err();
        let kind = err.downcast_ref::<WatchError>().map(|e| e.kind());
        assert_eq!(kind, Some("storage_write_failure"));
        assert!(store.is_empty());
    }
}
