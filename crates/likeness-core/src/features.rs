//! Fixed-layout feature vectors: raw crop pixels followed by wavelet detail.

use crate::imaging;
use image::{GrayImage, RgbImage};
use ndarray::{Array1, ArrayView2, Axis};
use serde::Deserialize;

/// Side length both components are resized to before flattening.
pub const DEFAULT_FEATURE_SIZE: u32 = 64;

/// Channel order the training pipeline stored pixels in.
///
/// Sets the raw-pixel block order and the gray weighting of the wavelet
/// input. The reference classifier was trained on BGR-ordered pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

/// Classifier input. Length is `3·S² + S²` for side length `S`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Array1<f32>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &Array1<f32> {
        &self.values
    }

    /// The vector as a `[1, len]` batch of one.
    pub fn as_row(&self) -> ArrayView2<'_, f32> {
        self.values.view().insert_axis(Axis(0))
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self {
            values: Array1::from(values),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureVectorBuilder {
    size: u32,
    channel_order: ChannelOrder,
}

impl FeatureVectorBuilder {
    pub fn new(size: u32, channel_order: ChannelOrder) -> Self {
        Self {
            size: size.max(1),
            channel_order,
        }
    }

    /// Total vector length produced by [`build`](Self::build).
    pub fn vector_len(&self) -> usize {
        let plane = self.size as usize * self.size as usize;
        3 * plane + plane
    }

    /// Resize both images to S×S and stack raw pixels above detail pixels.
    pub fn build(&self, crop: &RgbImage, detail: &GrayImage) -> FeatureVector {
        let scaled = imaging::resize_bilinear(crop, self.size, self.size);
        let scaled_detail = imaging::resize_bilinear(detail, self.size, self.size);

        let mut values = Vec::with_capacity(self.vector_len());
        for pixel in scaled.pixels() {
            let [r, g, b] = pixel.0;
            let ordered = match self.channel_order {
                ChannelOrder::Bgr => [b, g, r],
                ChannelOrder::Rgb => [r, g, b],
            };
            values.extend(ordered.iter().map(|&c| c as f32));
        }
        values.extend(scaled_detail.as_raw().iter().map(|&v| v as f32));

        FeatureVector::from(values)
    }
}

impl Default for FeatureVectorBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_FEATURE_SIZE, ChannelOrder::default())
    }
}
