use anyhow::Result;

use crate::detect::result::BoundingBox;
use crate::frame::Frame;

/// Detector adapter.
///
/// Given a frame, return boxes with labels and confidences. The pipeline treats
/// implementations as stateless: nothing observed in one call may influence the
/// result of the next. `&mut self` exists for inference sessions that need scratch
/// buffers, not for carrying detections across frames.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &str;

    /// Run detection on a frame. May be slow; called from the detection loop only.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>>;

    /// Called once by the registry before the backend becomes selectable.
    /// An error keeps the backend out of the registry.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
