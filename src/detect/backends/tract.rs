#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Label};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;
const PAD_VALUE: f32 = 144.0 / 255.0;

/// How YOLO class ids map to box labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YoloRole {
    /// COCO-style detector; only class 0 (person) is kept.
    PersonDetector,
    /// Face recognizer; class `N` becomes `Label::Face(N)`.
    FaceRecognizer,
}

/// Tract-based YOLOv8 backend for ONNX inference.
///
/// Loads a local model file and decodes `[1, 4 + classes, anchors]` outputs into boxes.
/// It does not perform any network I/O or write to disk beyond model loading.
pub struct YoloBackend {
    name: String,
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    role: YoloRole,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, role: YoloRole, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_size as usize, input_size as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        let name = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "yolo".to_string());

        Ok(Self {
            name,
            model,
            role,
            width: input_size,
            height: input_size,
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Override the registry name (defaults to the model file stem).
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    fn scale_ratio(&self, w0: u32, h0: u32) -> f32 {
        (self.width as f32 / w0 as f32).min(self.height as f32 / h0 as f32)
    }

    fn build_input(&self, image: &RgbImage) -> Result<Tensor> {
        let (w0, h0) = image.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("cannot run inference on an empty image"));
        }
        let ratio = self.scale_ratio(w0, h0);
        let w_new = ((w0 as f32 * ratio).round() as u32).clamp(1, self.width);
        let h_new = ((h0 as f32 * ratio).round() as u32).clamp(1, self.height);
        let resized = image::imageops::resize(image, w_new, h_new, FilterType::Triangle);

        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| {
                if (x as u32) < w_new && (y as u32) < h_new {
                    resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0
                } else {
                    PAD_VALUE
                }
            },
        );
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> Option<Label> {
        match self.role {
            YoloRole::PersonDetector if class_id == 0 => Some(Label::Person),
            YoloRole::PersonDetector => None,
            YoloRole::FaceRecognizer => Some(Label::Face(class_id as u32)),
        }
    }

    fn decode(&self, outputs: TVec<TValue>, w0: u32, h0: u32) -> Result<Vec<BoundingBox>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }
        let classes = shape[1] - CXYWH_OFFSET;
        let anchors = shape[2];
        let ratio = self.scale_ratio(w0, h0);

        let mut boxes = Vec::new();
        for i in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 0..classes {
                let score = preds[[0, CXYWH_OFFSET + c, i]];
                if score > best.1 {
                    best = (c, score);
                }
            }
            let (class_id, confidence) = best;
            if confidence < self.confidence_threshold {
                continue;
            }
            let Some(label) = self.label_for(class_id) else {
                continue;
            };
            let cx = preds[[0, 0, i]] / ratio;
            let cy = preds[[0, 1, i]] / ratio;
            let w = preds[[0, 2, i]] / ratio;
            let h = preds[[0, 3, i]] / ratio;
            let x = (cx - w / 2.0).clamp(0.0, w0 as f32);
            let y = (cy - h / 2.0).clamp(0.0, h0 as f32);
            boxes.push(BoundingBox::new(x, y, w, h, label, confidence));
        }
        Ok(non_max_suppression(boxes, self.iou_threshold))
    }

    /// Run the model on an arbitrary image (whole frame or a crop).
    pub fn detect_image(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        let (w0, h0) = image.dimensions();
        let input = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, w0, h0)
    }
}

impl DetectorBackend for YoloBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        let image = frame.to_rgb_image()?;
        self.detect_image(&image)
    }

    /// One blank pass so the first real frame does not pay for lazy allocation.
    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.detect_image(&blank)
            .with_context(|| format!("{} warm-up inference", self.name))?;
        Ok(())
    }
}

/// Person detector followed by a face recognizer run on every person crop.
///
/// Face boxes are shifted back into frame coordinates so the tracker can fold them
/// into their person box.
pub struct TwoStageBackend {
    name: String,
    person: YoloBackend,
    face: YoloBackend,
}

impl TwoStageBackend {
    pub fn new(name: &str, person: YoloBackend, face: YoloBackend) -> Self {
        Self {
            name: name.to_string(),
            person,
            face,
        }
    }
}

impl DetectorBackend for TwoStageBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>> {
        let image = frame.to_rgb_image()?;
        let persons = self.person.detect_image(&image)?;
        let mut out = Vec::with_capacity(persons.len() * 2);
        for person in persons {
            if let Some(crop) = frame.crop(&person) {
                let faces = self.face.detect_image(&crop)?;
                let (x0, y0) = (person.x.max(0.0).floor(), person.y.max(0.0).floor());
                out.extend(faces.into_iter().map(|face| face.offset(x0, y0)));
            }
            out.push(person);
        }
        Ok(out)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.person.warm_up()?;
        self.face.warm_up()
    }
}

fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let overlaps = kept
            .iter()
            .any(|k| k.label == candidate.label && k.iou(&candidate) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_drops_overlapping_lower_confidence_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0, Label::Person, 0.9);
        let b = BoundingBox::new(1.0, 1.0, 10.0, 10.0, Label::Person, 0.8);
        let c = BoundingBox::new(50.0, 50.0, 10.0, 10.0, Label::Person, 0.7);
        let kept = non_max_suppression(vec![b, c, a], 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
    }
}
