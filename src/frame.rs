//! Frames as handed out by the stream multiplexer.
//!
//! - `Frame`: immutable, cheaply clonable RGB raster tagged with its camera and index.
//! - `FrameSlot`: the single latest-frame cell shared by the acquisition loop and readers.
//!
//! Pixel data sits behind an `Arc`, so publishing a new frame swaps a pointer and a
//! reader either sees the previous frame or the new one, never a mix of both.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::{Arc, Mutex};

use crate::detect::BoundingBox;

/// A decoded RGB8 frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Camera descriptor id this frame came from.
    pub camera_id: Arc<str>,
    /// Multiplexer-wide frame counter. Strictly increasing across camera switches.
    pub index: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Local>,
    pub width: u32,
    pub height: u32,
    pixels: Arc<[u8]>,
    /// Connection generation that produced the frame.
    pub(crate) generation: u64,
}

impl Frame {
    pub fn new(camera_id: &str, index: u64, image: RgbImage) -> Self {
        Self::with_generation(Arc::from(camera_id), index, image, 0)
    }

    pub(crate) fn with_generation(
        camera_id: Arc<str>,
        index: u64,
        image: RgbImage,
        generation: u64,
    ) -> Self {
        let (width, height) = image.dimensions();
        Self {
            camera_id,
            index,
            captured_at: Local::now(),
            width,
            height,
            pixels: Arc::from(image.into_raw()),
            generation,
        }
    }

    /// Override the capture time (replayed footage, tests).
    pub fn at(mut self, captured_at: DateTime<Local>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Borrow the packed RGB bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy the frame into an owned image.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    /// Copy the region under `bbox`, clamped to the frame. `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<RgbImage> {
        let (x0, y0, x1, y1) = bbox.clamped_corners(self.width, self.height)?;
        let (w, h) = (x1 - x0, y1 - y0);
        let mut out = RgbImage::new(w, h);
        let stride = self.width as usize * 3;
        for row in 0..h {
            let src = (y0 + row) as usize * stride + x0 as usize * 3;
            let dst = row as usize * w as usize * 3;
            out.as_mut()[dst..dst + w as usize * 3]
                .copy_from_slice(&self.pixels[src..src + w as usize * 3]);
        }
        Some(out)
    }

    pub fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }
}

/// Latest-frame cell. Writers overwrite, readers clone; nothing is ever queued.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame.
    pub fn publish(&self, frame: Frame) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = Some(frame);
        }
    }

    /// Replace the current frame only if it belongs to `generation`.
    pub(crate) fn publish_if(&self, frame: Frame, generation: impl Fn() -> u64) -> bool {
        let Ok(mut guard) = self.latest.lock() else {
            return false;
        };
        if frame.generation != generation() {
            return false;
        }
        *guard = Some(frame);
        true
    }

    /// Clone out the most recent frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.latest.lock() {
            *guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Label;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]))
    }

    #[test]
    fn crop_copies_the_boxed_region() {
        let frame = Frame::new("cam", 1, gradient(64, 48));
        let bbox = BoundingBox::new(10.0, 5.0, 4.0, 3.0, Label::Person, 0.9);
        let crop = frame.crop(&bbox).expect("non-empty crop");
        assert_eq!(crop.dimensions(), (4, 3));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([10, 5, 7]));
        assert_eq!(crop.get_pixel(3, 2), &Rgb([13, 7, 7]));
    }

    #[test]
    fn crop_outside_frame_is_none() {
        let frame = Frame::new("cam", 1, gradient(16, 16));
        let bbox = BoundingBox::new(40.0, 40.0, 10.0, 10.0, Label::Person, 0.9);
        assert!(frame.crop(&bbox).is_none());
    }

    #[test]
    fn slot_keeps_only_latest() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());
        slot.publish(Frame::new("cam", 1, gradient(4, 4)));
        slot.publish(Frame::new("cam", 2, gradient(4, 4)));
        assert_eq!(slot.latest().map(|f| f.index), Some(2));
        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn slot_rejects_frames_from_retired_generation() {
        let slot = FrameSlot::new();
        let frame = Frame::with_generation(Arc::from("cam"), 1, gradient(4, 4), 3);
        assert!(!slot.publish_if(frame.clone(), || 4));
        assert!(slot.latest().is_none());
        assert!(slot.publish_if(frame, || 3));
        assert!(slot.latest().is_some());
    }
}
