//! Image input decoding: file paths and base64 payloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::io::Cursor;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot read image {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is empty")]
    EmptyPayload,
    #[error("cannot decode image bytes: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero size")]
    ZeroSized,
}

/// Where an input image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image file on disk.
    Path(PathBuf),
    /// Base64 image bytes, optionally behind a `<header>,` prefix such as
    /// `data:image/jpeg;base64,`.
    Encoded(String),
}

impl ImageSource {
    /// Short description for log fields; never includes payload bytes.
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Encoded(payload) => format!("<encoded, {} chars>", payload.len()),
        }
    }
}

/// Decode an image source into an 8-bit RGB raster.
pub fn decode(source: &ImageSource) -> Result<RgbImage, DecodeError> {
    let bytes = match source {
        ImageSource::Path(path) => std::fs::read(path).map_err(|source| DecodeError::Io {
            path: path.display().to_string(),
            source,
        })?,
        ImageSource::Encoded(payload) => decode_payload(payload)?,
    };

    let image = decode_oriented(&bytes)?.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::ZeroSized);
    }
    tracing::debug!(source = %source.describe(), width = image.width(), height = image.height(), "decoded image");
    Ok(image)
}

/// Decode bytes and apply any EXIF orientation, so a rotated phone photo
/// reaches the detectors upright.
fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Strip an optional header up to the first `,` and base64-decode the rest.
fn decode_payload(payload: &str) -> Result<Vec<u8>, DecodeError> {
    let body = payload.split_once(',').map_or(payload, |(_, body)| body);
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(BASE64.decode(compact)?)
}
