//! Pixel-level helpers: grayscale conversions, bilinear resize and cropping.
//!
//! The resize samples like OpenCV's `INTER_LINEAR` (pixel-center aligned, no
//! anti-aliasing) because the classifier was trained on crops scaled that way.

use crate::types::Rect;
use image::{GrayImage, ImageBuffer, Luma, Pixel, RgbImage};

// BT.601 luma weights.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Convert an RGB image to 8-bit grayscale.
pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Luma([luma(r, g, b)])
    })
}

/// Grayscale with the red and blue weights exchanged: the result of an
/// RGB-to-gray conversion run over BGR-ordered data.
pub fn to_grayscale_swapped(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Luma([luma(b, g, r)])
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    let y = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

/// Resize any 8-bit image buffer with bilinear interpolation.
pub fn resize_bilinear<P>(
    src: &ImageBuffer<P, Vec<u8>>,
    new_width: u32,
    new_height: u32,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = src.dimensions();
    let mut out = ImageBuffer::<P, Vec<u8>>::new(new_width, new_height);
    if width == 0 || height == 0 || new_width == 0 || new_height == 0 {
        return out;
    }

    let channels = P::CHANNEL_COUNT as usize;
    let w = width as usize;
    let h = height as usize;
    let new_w = new_width as usize;
    let scale_x = width as f32 / new_width as f32;
    let scale_y = height as f32 / new_height as f32;
    let raw = src.as_raw();
    let dst: &mut [u8] = &mut out;

    for y in 0..new_height as usize {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fy = src_y - src_y.floor();

        for x in 0..new_w {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let fx = src_x - src_x.floor();

            for c in 0..channels {
                let tl = raw[(y0 * w + x0) * channels + c] as f32;
                let tr = raw[(y0 * w + x1) * channels + c] as f32;
                let bl = raw[(y1 * w + x0) * channels + c] as f32;
                let br = raw[(y1 * w + x1) * channels + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                dst[(y * new_w + x) * channels + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// Copy the part of `image` covered by `rect`, clipped to the image bounds.
pub fn crop<P>(image: &ImageBuffer<P, Vec<u8>>, rect: &Rect) -> Option<ImageBuffer<P, Vec<u8>>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (width, height) = image.dimensions();
    let r = rect.clamp_to(width, height)?;
    Some(image::imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image())
}
