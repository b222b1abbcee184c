//! Camera sources.
//!
//! Every source sits behind the pull-based [`FrameSource`] trait:
//! - `stub://` synthetic cameras (tests, demos)
//! - MJPEG / JPEG-snapshot over HTTP (IP cameras, ESP32 peers)
//! - Local V4L2 devices (feature: ingest-v4l2)
//!
//! Sources only connect and decode. Reconnect policy, backoff and fan-out live in
//! the stream multiplexer, which owns exactly one source per open camera.

pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

/// Where a camera comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Capture device on this host (`/dev/videoN`, `stub://...`).
    Local,
    /// Network camera reached over HTTP.
    Ip,
}

/// Pixel dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A camera known to the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub display_name: String,
    pub kind: CameraKind,
    /// Device path or URL.
    pub source_locator: String,
    pub resolution: Option<Resolution>,
}

impl CameraDescriptor {
    pub fn local(id: &str, display_name: &str, locator: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            kind: CameraKind::Local,
            source_locator: locator.to_string(),
            resolution: None,
        }
    }

    pub fn ip(id: &str, display_name: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            kind: CameraKind::Ip,
            source_locator: url.to_string(),
            resolution: None,
        }
    }
}

/// Pull-based camera source.
///
/// `connect` must leave the source ready to serve `next_image`; calling it again
/// after a failure reopens the underlying device or connection.
pub trait FrameSource: Send {
    /// Open (or reopen) the device or connection.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next decoded frame is available.
    fn next_image(&mut self) -> Result<RgbImage>;

    /// Resolutions the device advertises. Empty when the source cannot tell.
    fn list_resolutions(&mut self) -> Result<Vec<Resolution>> {
        Ok(Vec::new())
    }
}

/// Timeouts and rates applied when a source is built from a descriptor.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Target frame rate; 0 disables decimation.
    pub target_fps: u32,
    /// Network read timeout.
    pub timeout: Duration,
    /// Preferred resolution for local devices.
    pub preferred: Resolution,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            target_fps: 15,
            timeout: Duration::from_secs(10),
            preferred: Resolution::new(640, 480),
        }
    }
}

/// Build the source matching a descriptor. The source is returned unconnected.
pub fn open_source(
    descriptor: &CameraDescriptor,
    options: &SourceOptions,
) -> Result<Box<dyn FrameSource>> {
    let locator = descriptor.source_locator.as_str();
    if locator.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::from_locator(locator)?));
    }
    match descriptor.kind {
        CameraKind::Ip => Ok(Box::new(MjpegSource::new(
            locator,
            options.target_fps,
            options.timeout,
        )?)),
        CameraKind::Local => open_local(locator, options),
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_local(locator: &str, options: &SourceOptions) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
        device: locator.to_string(),
        target_fps: options.target_fps,
        width: options.preferred.width,
        height: options.preferred.height,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_local(locator: &str, _options: &SourceOptions) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "local camera {} requires the ingest-v4l2 feature",
        locator
    ))
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
