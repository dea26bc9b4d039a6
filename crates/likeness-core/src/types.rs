use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned box in pixel coordinates of the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Clip this box to an image of the given size.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(Rect::new(self.x, self.y, w, h))
    }
}

/// A face candidate that passed the eye gate, with its crops.
#[derive(Debug, Clone)]
pub struct DetectionRegion {
    /// Face box in source-image coordinates.
    pub bbox: Rect,
    /// Eye boxes relative to the face crop.
    pub eyes: Vec<Rect>,
    pub color: RgbImage,
    pub gray: GrayImage,
}

/// Classification of one accepted face.
///
/// Serializes to `{"class", "class_probability", "class_dictionary"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(rename = "class")]
    pub class_name: String,
    /// Per-class percentages in label-id order, rounded to two decimals.
    pub class_probability: Vec<f64>,
    /// Full name -> id map of the loaded label set.
    pub class_dictionary: BTreeMap<String, usize>,
}

impl ClassificationResult {
    /// Id of the most probable class according to `class_probability`.
    pub fn top_class_id(&self) -> Option<usize> {
        self.class_probability
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)
    }
}
