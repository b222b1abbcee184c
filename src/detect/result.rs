use serde::{Deserialize, Serialize};

/// Detector label for a box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Person,
    /// Recognized face of enrolled class `N`.
    Face(u32),
}

impl Label {
    pub fn is_face(&self) -> bool {
        matches!(self, Label::Face(_))
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Person => write!(f, "person"),
            Label::Face(class) => write!(f, "face-class-{}", class),
        }
    }
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub label: Label,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32, label: Label, confidence: f32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            label,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Build from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, label: Label, confidence: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0), label, confidence)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Euclidean distance between box centres.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    pub fn contains_point(&self, (px, py): (f32, f32)) -> bool {
        px >= self.x && px <= self.x + self.w && py >= self.y && py <= self.y + self.h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix0 = self.x.max(other.x);
        let iy0 = self.y.max(other.y);
        let ix1 = (self.x + self.w).min(other.x + other.w);
        let iy1 = (self.y + self.h).min(other.y + other.h);
        if ix1 <= ix0 || iy1 <= iy0 {
            return 0.0;
        }
        let inter = (ix1 - ix0) * (iy1 - iy0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer corners clamped to a `width` x `height` frame; `None` if nothing remains.
    pub fn clamped_corners(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.floor().clamp(0.0, width as f32) as u32;
        let y0 = self.y.floor().clamp(0.0, height as f32) as u32;
        let x1 = (self.x + self.w).ceil().clamp(0.0, width as f32) as u32;
        let y1 = (self.y + self.h).ceil().clamp(0.0, height as f32) as u32;
        if x1 <= x0 || y1 <= y0 {
            None
        } else {
            Some((x0, y0, x1, y1))
        }
    }

    /// Shift a box found inside a crop back into frame coordinates.
    pub fn offset(mut self, dx: f32, dy: f32) -> Self {
        self.x += dx;
        self.y += dy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_distance_is_euclidean() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.9);
        let b = BoundingBox::new(30.0, 40.0, 10.0, 10.0, Label::Person, 0.9);
        assert!((a.center_distance(&b) - 50.0).abs() < 1e-4);
    }

    #[test]
    fn confidence_is_clamped() {
        let b = BoundingBox::new(0.0, 0.0, 1.0, 1.0, Label::Face(2), 1.7);
        assert_eq!(b.confidence, 1.0);
        assert_eq!(b.label.to_string(), "face-class-2");
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.9);
        let b = BoundingBox::new(20.0, 0.0, 10.0, 10.0, Label::Person, 0.9);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }
}
