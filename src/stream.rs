//! Shared stream multiplexer.
//!
//! Owns the one live connection to the current camera and fans the latest frame
//! out to any number of readers (detection loop, preview, training capture).
//!
//! - A dedicated pull thread per connection reads frames and overwrites the slot.
//! - Read failures are retried with exponential backoff plus jitter; after
//!   `offline_after_failures` consecutive failures the camera is reported offline
//!   until the next good frame.
//! - Switching connects the new source and reads its first frame before the old
//!   connection is retired. Every connection carries a generation number; frames
//!   and handles from a retired generation are rejected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use image::RgbImage;
use rand::Rng;
use serde::Serialize;

use crate::error::{StreamError, WatchError};
use crate::frame::{Frame, FrameSlot};
use crate::ingest::{self, CameraDescriptor, CameraKind, FrameSource, Resolution, SourceOptions};

const STOP_POLL: Duration = Duration::from_millis(20);

/// Reconnect policy and source options.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Base delay before the first retry.
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential backoff (before jitter).
    pub max_backoff: Duration,
    /// Consecutive failures after which the camera is reported offline.
    pub offline_after_failures: u32,
    pub source: SourceOptions,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            offline_after_failures: 3,
            source: SourceOptions::default(),
        }
    }
}

impl StreamConfig {
    /// Backoff before retry number `failures` (1-based), without jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.reconnect_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Online,
    Offline,
    Closed,
}

/// Observable state of the current connection.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub camera_id: Option<String>,
    pub state: LinkState,
    pub generation: u64,
    pub consecutive_failures: u32,
    pub offline_transitions: u64,
    pub reconnects: u64,
    pub frames_published: u64,
    pub last_frame_at: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

impl StreamStatus {
    fn closed() -> Self {
        Self {
            camera_id: None,
            state: LinkState::Closed,
            generation: 0,
            consecutive_failures: 0,
            offline_transitions: 0,
            reconnects: 0,
            frames_published: 0,
            last_frame_at: None,
            last_error: None,
        }
    }
}

/// What a one-shot inspection learned about a camera.
#[derive(Clone, Debug, Serialize)]
pub struct InspectReport {
    pub resolution: Resolution,
    /// Resolutions the device advertises (local cameras only).
    pub available: Vec<Resolution>,
}

struct Shared {
    slot: FrameSlot,
    generation: AtomicU64,
    open: AtomicBool,
    next_index: AtomicU64,
    status: Mutex<StreamStatus>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.open.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, frame: Frame) -> bool {
        self.slot.publish_if(frame, || {
            if self.open.load(Ordering::SeqCst) {
                self.generation.load(Ordering::SeqCst)
            } else {
                0
            }
        })
    }

    /// Apply `update` to the status if `generation` is still the live connection.
    fn update_status(&self, generation: u64, update: impl FnOnce(&mut StreamStatus)) {
        if let Ok(mut status) = self.status.lock() {
            if status.generation == generation && self.is_current(generation) {
                update(&mut status);
            }
        }
    }
}

struct Connection {
    descriptor: CameraDescriptor,
    generation: u64,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Connection {
    fn retire(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // The pull thread may be blocked inside a read; it exits on its next check.
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
        log::info!(
            "StreamMultiplexer: retired {} (generation {})",
            self.descriptor.id,
            self.generation
        );
    }
}

/// Single-producer, multi-reader camera stream.
pub struct StreamMultiplexer {
    shared: Arc<Shared>,
    config: StreamConfig,
    active: Mutex<Option<Connection>>,
}

/// Reader bound to one connection generation.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
    generation: u64,
    camera_id: Arc<str>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("generation", &self.generation)
            .field("camera_id", &self.camera_id)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Latest frame of this handle's connection.
    pub fn read_latest(&self) -> std::result::Result<Frame, StreamError> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        if !self.shared.is_current(self.generation) {
            return Err(StreamError::Stale);
        }
        match self.shared.slot.latest() {
            Some(frame) if frame.generation == self.generation => Ok(frame),
            Some(_) => Err(StreamError::Stale),
            None => Err(StreamError::Unavailable),
        }
    }
}

impl StreamMultiplexer {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: FrameSlot::new(),
                generation: AtomicU64::new(0),
                open: AtomicBool::new(false),
                next_index: AtomicU64::new(0),
                status: Mutex::new(StreamStatus::closed()),
            }),
            config,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open `descriptor` and make it the current camera.
    ///
    /// On failure the previous connection keeps running untouched.
    pub fn open(&self, descriptor: &CameraDescriptor) -> Result<StreamHandle> {
        let source = ingest::open_source(descriptor, &self.config.source)
            .map_err(|err| source_unavailable(descriptor, &err))?;
        self.open_with_source(descriptor, source)
    }

    /// Same as [`open`](Self::open) with a caller-built source.
    pub fn open_with_source(
        &self,
        descriptor: &CameraDescriptor,
        mut source: Box<dyn FrameSource>,
    ) -> Result<StreamHandle> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| anyhow!("stream multiplexer lock poisoned"))?;

        let (first, report) = inspect_source(descriptor, source.as_mut())
            .map_err(|err| source_unavailable(descriptor, &err))?;

        let generation = self.shared.generation.load(Ordering::SeqCst) + 1;
        let camera_id: Arc<str> = Arc::from(descriptor.id.as_str());
        let first_frame = Frame::with_generation(
            camera_id.clone(),
            self.shared.next_index(),
            first,
            generation,
        );

        if let Ok(mut status) = self.shared.status.lock() {
            *status = StreamStatus {
                camera_id: Some(descriptor.id.clone()),
                state: LinkState::Online,
                generation,
                frames_published: 1,
                last_frame_at: Some(first_frame.captured_at),
                ..StreamStatus::closed()
            };
            // Swap generation and slot while holding the status lock so readers of
            // `status()` never see the new camera paired with the old generation.
            self.shared.generation.store(generation, Ordering::SeqCst);
            self.shared.open.store(true, Ordering::SeqCst);
            self.shared.slot.clear();
            self.shared.publish(first_frame);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let shared = self.shared.clone();
            let config = self.config.clone();
            let stop = stop.clone();
            let camera_id = camera_id.clone();
            std::thread::Builder::new()
                .name(format!("stream-{}", descriptor.id))
                .spawn(move || pull_loop(source, shared, config, camera_id, generation, stop))
                .context("spawn stream pull thread")?
        };

        if let Some(previous) = active.replace(Connection {
            descriptor: descriptor.clone(),
            generation,
            stop,
            thread: Some(thread),
        }) {
            previous.retire();
        }

        log::info!(
            "StreamMultiplexer: opened {} ({}) at {} (generation {})",
            descriptor.id,
            descriptor.source_locator,
            report.resolution,
            generation
        );

        Ok(StreamHandle {
            shared: self.shared.clone(),
            generation,
            camera_id,
        })
    }

    /// Retire the current connection immediately. Idempotent.
    pub fn close(&self) {
        let Ok(mut active) = self.active.lock() else {
            return;
        };
        if let Ok(mut status) = self.shared.status.lock() {
            self.shared.open.store(false, Ordering::SeqCst);
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.slot.clear();
            *status = StreamStatus {
                offline_transitions: status.offline_transitions,
                ..StreamStatus::closed()
            };
        }
        if let Some(previous) = active.take() {
            previous.retire();
        }
    }

    /// Handle for the current connection.
    pub fn handle(&self) -> Option<StreamHandle> {
        let active = self.active.lock().ok()?;
        let connection = active.as_ref()?;
        Some(StreamHandle {
            shared: self.shared.clone(),
            generation: connection.generation,
            camera_id: Arc::from(connection.descriptor.id.as_str()),
        })
    }

    /// Latest frame of whichever camera is current.
    pub fn read_latest(&self) -> std::result::Result<Frame, StreamError> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let generation = self.shared.generation.load(Ordering::SeqCst);
        match self.shared.slot.latest() {
            Some(frame) if frame.generation == generation => Ok(frame),
            _ => Err(StreamError::Unavailable),
        }
    }

    pub fn current(&self) -> Option<CameraDescriptor> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|c| c.descriptor.clone()))
    }

    pub fn status(&self) -> StreamStatus {
        self.shared
            .status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_else(|_| StreamStatus::closed())
    }

    /// Open `descriptor` on a throwaway source, read one frame, and close it again.
    /// The current connection is not touched.
    pub fn inspect(&self, descriptor: &CameraDescriptor) -> Result<InspectReport> {
        let mut source = ingest::open_source(descriptor, &self.config.source)
            .map_err(|err| source_unavailable(descriptor, &err))?;
        let (_, report) = inspect_source(descriptor, source.as_mut())
            .map_err(|err| source_unavailable(descriptor, &err))?;
        Ok(report)
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

fn source_unavailable(descriptor: &CameraDescriptor, err: &anyhow::Error) -> anyhow::Error {
    WatchError::SourceUnavailable {
        camera: descriptor.id.clone(),
        reason: format!("{:#}", err),
    }
    .into()
}

/// Connect, list resolutions for local devices, and read the first frame.
fn inspect_source(
    descriptor: &CameraDescriptor,
    source: &mut dyn FrameSource,
) -> Result<(RgbImage, InspectReport)> {
    source
        .connect()
        .with_context(|| format!("connect to {}", descriptor.source_locator))?;
    let available = match descriptor.kind {
        CameraKind::Local => source.list_resolutions().unwrap_or_else(|err| {
            log::warn!(
                "StreamMultiplexer: resolution listing failed for {}: {}",
                descriptor.id,
                err
            );
            Vec::new()
        }),
        CameraKind::Ip => Vec::new(),
    };
    let first = source
        .next_image()
        .with_context(|| format!("read first frame from {}", descriptor.source_locator))?;
    let resolution = Resolution::new(first.width(), first.height());
    Ok((first, InspectReport { resolution, available }))
}

fn pull_loop(
    mut source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    config: StreamConfig,
    camera_id: Arc<str>,
    generation: u64,
    stop: Arc<AtomicBool>,
) {
    let mut failures: u32 = 0;
    let mut needs_connect = false;
    let retired = |shared: &Shared| stop.load(Ordering::SeqCst) || !shared.is_current(generation);

    while !retired(&shared) {
        let attempt = if needs_connect {
            source.connect().and_then(|_| source.next_image())
        } else {
            source.next_image()
        };

        match attempt {
            Ok(image) => {
                needs_connect = false;
                let frame =
                    Frame::with_generation(camera_id.clone(), shared.next_index(), image, generation);
                let captured_at = frame.captured_at;
                if !shared.publish(frame) {
                    break;
                }
                let recovered = failures > 0;
                failures = 0;
                shared.update_status(generation, |status| {
                    if status.state == LinkState::Offline {
                        log::info!("StreamMultiplexer: {} back online", camera_id);
                    }
                    if recovered {
                        status.reconnects += 1;
                    }
                    status.state = LinkState::Online;
                    status.consecutive_failures = 0;
                    status.frames_published += 1;
                    status.last_frame_at = Some(captured_at);
                    status.last_error = None;
                });
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                needs_connect = true;
                let reason = format!("{:#}", err);
                log::warn!(
                    "StreamMultiplexer: {} read failed ({} in a row): {}",
                    camera_id,
                    failures,
                    reason
                );
                let offline_after = config.offline_after_failures.max(1);
                shared.update_status(generation, |status| {
                    status.consecutive_failures = failures;
                    status.last_error = Some(reason);
                    if failures >= offline_after && status.state != LinkState::Offline {
                        log::warn!("StreamMultiplexer: {} marked offline", camera_id);
                        status.state = LinkState::Offline;
                        status.offline_transitions += 1;
                    }
                });
                let delay = jittered(config.backoff(failures));
                sleep_until_retired(delay, || retired(&shared));
            }
        }
    }
    log::debug!(
        "StreamMultiplexer: pull loop for {} (generation {}) exited",
        camera_id,
        generation
    );
}

fn jittered(delay: Duration) -> Duration {
    let jitter_ms = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

fn sleep_until_retired(delay: Duration, retired: impl Fn() -> bool) {
    let deadline = Instant::now() + delay;
    while !retired() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(STOP_POLL.min(deadline - now));
    }
}
