//! V4L2 camera source for local capture devices.
//!
//! Negotiates RGB3, then YUYV, then MJPG, and normalizes every buffer to RGB8.
//! Resolution listing walks the advertised frame sizes of each supported format.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;
use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, Resolution};

const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"RGB3", b"YUYV", b"MJPG"];
const STEPWISE_CANDIDATES: [(u32, u32); 5] =
    [(320, 240), (640, 480), (800, 600), (1280, 720), (1920, 1080)];

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
        }
    }
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceV4l2State>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Rgb24,
        }
    }

    fn negotiate(&self, device: &mut v4l::Device) -> Result<(v4l::Format, PixelFormat)> {
        use v4l::video::Capture;

        let current = device.format().context("read v4l2 format")?;
        for fourcc in PREFERRED_FOURCCS {
            let mut wanted = current;
            wanted.width = self.config.width;
            wanted.height = self.config.height;
            wanted.fourcc = v4l::FourCC::new(fourcc);
            match device.set_format(&wanted) {
                Ok(applied) => {
                    if let Some(format) = PixelFormat::from_fourcc(&applied.fourcc.repr) {
                        return Ok((applied, format));
                    }
                }
                Err(err) => log::warn!(
                    "V4l2Source: {} rejected {}: {}",
                    self.config.device,
                    String::from_utf8_lossy(fourcc),
                    err
                ),
            }
        }
        Err(anyhow!(
            "{} supports none of RGB3/YUYV/MJPG",
            self.config.device
        ))
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.state = None;
        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let (format, pixel_format) = self.negotiate(&mut device)?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.format = pixel_format;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_image(&mut self) -> Result<RgbImage> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let captured = state.with_mut(|fields| {
            fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))
                .and_then(|(buf, meta)| {
                    let used = (meta.bytesused as usize).min(buf.len());
                    let used = if used == 0 { buf.len() } else { used };
                    normalize_to_rgb(&buf[..used], width, height, format)
                })
        });
        let image = match captured {
            Ok(image) => image,
            Err(err) => {
                self.state = None;
                return Err(err);
            }
        };

        Ok(image)
    }

    fn list_resolutions(&mut self) -> Result<Vec<Resolution>> {
        use v4l::framesize::FrameSizeEnum;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let formats = device.enum_formats().context("enumerate v4l2 formats")?;
        let mut found = Vec::new();
        for description in formats {
            if PixelFormat::from_fourcc(&description.fourcc.repr).is_none() {
                continue;
            }
            let sizes = match device.enum_framesizes(description.fourcc) {
                Ok(sizes) => sizes,
                Err(err) => {
                    log::warn!(
                        "V4l2Source: cannot list frame sizes of {}: {}",
                        self.config.device,
                        err
                    );
                    continue;
                }
            };
            for size in sizes {
                match size.size {
                    FrameSizeEnum::Discrete(discrete) => {
                        found.push(Resolution::new(discrete.width, discrete.height));
                    }
                    FrameSizeEnum::Stepwise(step) => {
                        found.extend(
                            STEPWISE_CANDIDATES
                                .iter()
                                .filter(|(w, h)| {
                                    (step.min_width..=step.max_width).contains(w)
                                        && (step.min_height..=step.max_height).contains(h)
                                })
                                .map(|&(w, h)| Resolution::new(w, h)),
                        );
                    }
                }
            }
        }
        found.sort_by_key(|r| (r.width, r.height));
        found.dedup();
        Ok(found)
    }
}
