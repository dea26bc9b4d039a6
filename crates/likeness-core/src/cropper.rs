//! Face-and-eyes gated cropping.

use crate::imaging;
use crate::types::{DetectionRegion, Rect};
use image::{GrayImage, RgbImage};

/// Default number of eyes a face candidate must show to be kept.
pub const DEFAULT_MIN_EYES: usize = 2;

/// Anything that finds object boxes in a grayscale image.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<Rect>;
}

/// Two-stage detector: faces in the whole image, then eyes inside each face.
pub struct FaceCropper {
    faces: Box<dyn ObjectDetector>,
    eyes: Box<dyn ObjectDetector>,
    min_eyes: usize,
}

impl FaceCropper {
    pub fn new(faces: Box<dyn ObjectDetector>, eyes: Box<dyn ObjectDetector>, min_eyes: usize) -> Self {
        Self {
            faces,
            eyes,
            min_eyes,
        }
    }

    /// Face regions with at least `min_eyes` eyes, in face-detector order.
    pub fn crop_faces(&self, image: &RgbImage) -> Vec<DetectionRegion> {
        let gray = imaging::to_grayscale(image);
        let candidates = self.faces.detect(&gray);
        tracing::debug!(candidates = candidates.len(), "face candidates");

        let mut regions = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(bbox) = candidate.clamp_to(image.width(), image.height()) else {
                tracing::debug!(?candidate, "face candidate outside image, skipped");
                continue;
            };
            let (Some(face_gray), Some(face_color)) =
                (imaging::crop(&gray, &bbox), imaging::crop(image, &bbox))
            else {
                continue;
            };

            let eyes = self.eyes.detect(&face_gray);
            if eyes.len() < self.min_eyes {
                tracing::debug!(?bbox, eyes = eyes.len(), min_eyes = self.min_eyes, "face rejected");
                continue;
            }

            tracing::debug!(?bbox, eyes = eyes.len(), "face accepted");
            regions.push(DetectionRegion {
                bbox,
                eyes,
                color: face_color,
                gray: face_gray,
            });
        }

        regions
    }
}
