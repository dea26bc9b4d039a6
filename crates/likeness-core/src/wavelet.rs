//! Multi-level 2-D discrete wavelet transform and the detail image built on it.
//!
//! Decomposition uses half-sample symmetric boundary extension, so a signal of
//! length `n` yields `floor((n + L - 1) / 2)` coefficients per band for a filter
//! of length `L`. Reconstruction of an odd-length axis comes back one sample
//! longer than the original.

use crate::features::ChannelOrder;
use crate::imaging;
use image::{GrayImage, Luma, RgbImage};
use ndarray::{s, Array2, ArrayView1, Axis, Zip};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// Scaling (reconstruction low-pass) coefficients.
const DB1_SCALING: [f64; 2] = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
const DB2_SCALING: [f64; 4] = [
    0.48296291314469025,
    0.836516303737469,
    0.22414386804185735,
    -0.12940952255092145,
];
const DB3_SCALING: [f64; 6] = [
    0.3326705529509569,
    0.8068915093133388,
    0.4598775021193313,
    -0.13501102001039084,
    -0.08544127388224149,
    0.035226291882100656,
];
const DB4_SCALING: [f64; 8] = [
    0.23037781330885523,
    0.7148465705525415,
    0.6308807679295904,
    -0.02798376941698385,
    -0.18703481171888114,
    0.030841381835986965,
    0.032883011666982945,
    -0.010597401784997278,
];

const MAX_DAUBECHIES_ORDER: u8 = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaveletError {
    #[error("unknown wavelet family '{0}' (expected haar or db1..db4)")]
    UnknownFamily(String),
}

/// Supported orthogonal wavelet families. `db1` is the same filter as `haar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum WaveletFamily {
    Haar,
    Daubechies(u8),
}

impl WaveletFamily {
    fn scaling(&self) -> &'static [f64] {
        match self {
            WaveletFamily::Haar | WaveletFamily::Daubechies(0..=1) => &DB1_SCALING,
            WaveletFamily::Daubechies(2) => &DB2_SCALING,
            WaveletFamily::Daubechies(3) => &DB3_SCALING,
            // `FromStr` rejects orders above 4; hand-built values saturate.
            WaveletFamily::Daubechies(_) => &DB4_SCALING,
        }
    }

    /// Filter length.
    pub fn filter_len(&self) -> usize {
        self.scaling().len()
    }
}

impl FromStr for WaveletFamily {
    type Err = WaveletError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.trim().to_ascii_lowercase();
        if lower == "haar" {
            return Ok(WaveletFamily::Haar);
        }
        lower
            .strip_prefix("db")
            .and_then(|order| order.parse::<u8>().ok())
            .filter(|order| (1..=MAX_DAUBECHIES_ORDER).contains(order))
            .map(WaveletFamily::Daubechies)
            .ok_or_else(|| WaveletError::UnknownFamily(value.to_string()))
    }
}

impl TryFrom<String> for WaveletFamily {
    type Error = WaveletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for WaveletFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveletFamily::Haar => write!(f, "haar"),
            WaveletFamily::Daubechies(order) => write!(f, "db{order}"),
        }
    }
}

/// Decomposition and reconstruction filters derived from one scaling filter.
struct FilterBank {
    dec_lo: Vec<f32>,
    dec_hi: Vec<f32>,
    rec_lo: Vec<f32>,
    rec_hi: Vec<f32>,
}

impl FilterBank {
    fn new(family: WaveletFamily) -> Self {
        let h = family.scaling();
        let len = h.len();
        let rec_lo: Vec<f32> = h.iter().map(|&c| c as f32).collect();
        let dec_lo: Vec<f32> = rec_lo.iter().rev().copied().collect();
        let rec_hi: Vec<f32> = (0..len)
            .map(|k| {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                sign * h[len - 1 - k] as f32
            })
            .collect();
        let dec_hi: Vec<f32> = rec_hi.iter().rev().copied().collect();
        Self { dec_lo, dec_hi, rec_lo, rec_hi }
    }

    fn len(&self) -> usize {
        self.rec_lo.len()
    }

    fn coeff_len(&self, n: usize) -> usize {
        (n + self.len() - 1) / 2
    }

    fn rec_len(&self, n: usize) -> usize {
        (2 * n + 2).saturating_sub(self.len())
    }
}

/// Map an out-of-range index onto the signal by half-sample mirroring.
fn symmetric_index(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let i = i.rem_euclid(period);
    if i < n {
        i as usize
    } else {
        (period - 1 - i) as usize
    }
}

/// Single-level 1-D analysis: every second sample of the full convolution,
/// starting at index 1.
fn dwt(signal: &[f32], bank: &FilterBank) -> (Vec<f32>, Vec<f32>) {
    let n = signal.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }
    let out_len = bank.coeff_len(n);
    let mut approx = Vec::with_capacity(out_len);
    let mut detail = Vec::with_capacity(out_len);

    for o in 0..out_len {
        let i = (2 * o + 1) as isize;
        let mut a = 0.0f32;
        let mut d = 0.0f32;
        for j in 0..bank.len() {
            let sample = signal[symmetric_index(i - j as isize, n)];
            a += bank.dec_lo[j] * sample;
            d += bank.dec_hi[j] * sample;
        }
        approx.push(a);
        detail.push(d);
    }

    (approx, detail)
}

/// Single-level 1-D synthesis, keeping only the fully overlapped part of the
/// upsampled convolution. `approx` and `detail` must have equal length.
fn idwt(approx: &[f32], detail: &[f32], bank: &FilterBank) -> Vec<f32> {
    let n = approx.len().min(detail.len());
    let half = bank.len() / 2;
    let mut out = vec![0.0f32; bank.rec_len(n)];

    for (o, i) in ((half - 1)..n).enumerate() {
        let mut even = 0.0f32;
        let mut odd = 0.0f32;
        for j in 0..half {
            even += bank.rec_lo[2 * j] * approx[i - j] + bank.rec_hi[2 * j] * detail[i - j];
            odd += bank.rec_lo[2 * j + 1] * approx[i - j] + bank.rec_hi[2 * j + 1] * detail[i - j];
        }
        out[2 * o] = even;
        out[2 * o + 1] = odd;
    }

    out
}

fn dwt_axis(data: &Array2<f32>, axis: Axis, bank: &FilterBank) -> (Array2<f32>, Array2<f32>) {
    let out_len = bank.coeff_len(data.len_of(axis));
    let shape = if axis == Axis(0) {
        (out_len, data.ncols())
    } else {
        (data.nrows(), out_len)
    };
    let mut lo = Array2::<f32>::zeros(shape);
    let mut hi = Array2::<f32>::zeros(shape);

    Zip::from(data.lanes(axis))
        .and(lo.lanes_mut(axis))
        .and(hi.lanes_mut(axis))
        .for_each(|src, mut lo_lane, mut hi_lane| {
            let signal: Vec<f32> = src.iter().copied().collect();
            let (a, d) = dwt(&signal, bank);
            lo_lane.assign(&ArrayView1::from(&a[..]));
            hi_lane.assign(&ArrayView1::from(&d[..]));
        });

    (lo, hi)
}

fn idwt_axis(
    approx: &Array2<f32>,
    detail: &Array2<f32>,
    axis: Axis,
    bank: &FilterBank,
) -> Array2<f32> {
    let out_len = bank.rec_len(approx.len_of(axis));
    let shape = if axis == Axis(0) {
        (out_len, approx.ncols())
    } else {
        (approx.nrows(), out_len)
    };
    let mut out = Array2::<f32>::zeros(shape);

    Zip::from(approx.lanes(axis))
        .and(detail.lanes(axis))
        .and(out.lanes_mut(axis))
        .for_each(|a, d, mut out_lane| {
            let a: Vec<f32> = a.iter().copied().collect();
            let d: Vec<f32> = d.iter().copied().collect();
            let rec = idwt(&a, &d, bank);
            out_lane.assign(&ArrayView1::from(&rec[..]));
        });

    out
}

/// Detail sub-bands of one decomposition level.
#[derive(Debug, Clone)]
pub struct DetailBands {
    /// High-pass along rows, low-pass along columns.
    pub horizontal: Array2<f32>,
    /// Low-pass along rows, high-pass along columns.
    pub vertical: Array2<f32>,
    pub diagonal: Array2<f32>,
}

/// Full multi-level decomposition. `details` is ordered coarsest level first.
#[derive(Debug, Clone)]
pub struct WaveletCoefficients {
    pub approximation: Array2<f32>,
    pub details: Vec<DetailBands>,
}

fn dwt2(data: &Array2<f32>, bank: &FilterBank) -> (Array2<f32>, DetailBands) {
    let (lo0, hi0) = dwt_axis(data, Axis(0), bank);
    let (aa, ad) = dwt_axis(&lo0, Axis(1), bank);
    let (da, dd) = dwt_axis(&hi0, Axis(1), bank);
    (
        aa,
        DetailBands {
            horizontal: da,
            vertical: ad,
            diagonal: dd,
        },
    )
}

fn idwt2(approx: &Array2<f32>, bands: &DetailBands, bank: &FilterBank) -> Array2<f32> {
    let lo0 = idwt_axis(approx, &bands.vertical, Axis(1), bank);
    let hi0 = idwt_axis(&bands.horizontal, &bands.diagonal, Axis(1), bank);
    idwt_axis(&lo0, &hi0, Axis(0), bank)
}

/// Decompose `data` into `level` levels of detail plus a final approximation.
pub fn wavedec2(data: &Array2<f32>, family: WaveletFamily, level: usize) -> WaveletCoefficients {
    let bank = FilterBank::new(family);
    let mut approximation = data.clone();
    let mut details = Vec::with_capacity(level);

    for _ in 0..level {
        let (a, bands) = dwt2(&approximation, &bank);
        details.push(bands);
        approximation = a;
    }
    details.reverse();

    WaveletCoefficients {
        approximation,
        details,
    }
}

/// Inverse of [`wavedec2`].
pub fn waverec2(coeffs: &WaveletCoefficients, family: WaveletFamily) -> Array2<f32> {
    let bank = FilterBank::new(family);
    let mut approximation = coeffs.approximation.clone();

    for bands in &coeffs.details {
        let (rows, cols) = bands.horizontal.dim();
        if approximation.dim() != (rows, cols) {
            // Odd lengths reconstruct one sample long; trim to the detail shape.
            approximation = approximation.slice(s![..rows, ..cols]).to_owned();
        }
        approximation = idwt2(&approximation, bands, &bank);
    }

    approximation
}

/// Wavelet family and decomposition depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WaveletConfig {
    pub family: WaveletFamily,
    pub level: usize,
}

impl WaveletConfig {
    /// Cheap single-level Haar transform for visual inspection.
    pub fn preview() -> Self {
        Self {
            family: WaveletFamily::Haar,
            level: 1,
        }
    }
}

impl Default for WaveletConfig {
    /// The transform the classifier's training vectors were built with.
    fn default() -> Self {
        Self {
            family: WaveletFamily::Daubechies(1),
            level: 5,
        }
    }
}

/// Produces an edge/texture image by removing the coarsest wavelet band.
#[derive(Debug, Clone, Copy)]
pub struct WaveletFeatureExtractor {
    family: WaveletFamily,
    level: usize,
    channel_order: ChannelOrder,
}

impl WaveletFeatureExtractor {
    /// A level of 0 is treated as 1.
    pub fn new(config: &WaveletConfig) -> Self {
        Self {
            family: config.family,
            level: config.level.max(1),
            channel_order: ChannelOrder::default(),
        }
    }

    /// Channel order the gray conversion assumes its input was stored in.
    ///
    /// With [`ChannelOrder::Bgr`] the luma weights land on swapped channels:
    /// blue is weighted 0.299 and red 0.114, as in the training vectors.
    pub fn with_channel_order(mut self, channel_order: ChannelOrder) -> Self {
        self.channel_order = channel_order;
        self
    }

    pub fn family(&self) -> WaveletFamily {
        self.family
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Detail image of a color crop.
    pub fn extract(&self, crop: &RgbImage) -> GrayImage {
        let gray = match self.channel_order {
            ChannelOrder::Bgr => imaging::to_grayscale_swapped(crop),
            ChannelOrder::Rgb => imaging::to_grayscale(crop),
        };
        self.extract_gray(&gray)
    }

    /// Detail image of a grayscale crop. The output may be one pixel larger
    /// than the input along each odd dimension.
    pub fn extract_gray(&self, gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return GrayImage::new(width, height);
        }

        let data = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            gray.get_pixel(x as u32, y as u32)[0] as f32 / 255.0
        });

        let mut coeffs = wavedec2(&data, self.family, self.level);
        coeffs.approximation.fill(0.0);
        let reconstructed = waverec2(&coeffs, self.family);

        let (rows, cols) = reconstructed.dim();
        GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([quantize(reconstructed[[y as usize, x as usize]])])
        })
    }
}

/// Scale a `[0, 1]` response to 8 bits, truncating toward zero and wrapping
/// modulo 256, so -0.5 maps to 129.
fn quantize(value: f32) -> u8 {
    (value * 255.0) as i32 as u8
}

impl Default for WaveletFeatureExtractor {
    fn default() -> Self {
        Self::new(&WaveletConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(y, x)| ((x * 7 + y * 13) % 31) as f32 / 31.0)
    }

    fn max_abs_diff(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_parse_family() {
        assert_eq!("haar".parse::<WaveletFamily>().unwrap(), WaveletFamily::Haar);
        assert_eq!("DB2".parse::<WaveletFamily>().unwrap(), WaveletFamily::Daubechies(2));
        assert!("db9".parse::<WaveletFamily>().is_err());
        assert!("sym4".parse::<WaveletFamily>().is_err());
        assert_eq!(WaveletFamily::Daubechies(3).to_string(), "db3");
    }

    #[test]
    fn test_haar_matches_db1() {
        let haar = FilterBank::new(WaveletFamily::Haar);
        let db1 = FilterBank::new(WaveletFamily::Daubechies(1));
        assert_eq!(haar.dec_lo, db1.dec_lo);
        assert_eq!(haar.dec_hi, db1.dec_hi);
    }

    #[test]
    fn test_haar_single_level_values() {
        let bank = FilterBank::new(WaveletFamily::Haar);
        let (a, d) = dwt(&[1.0, 3.0, 5.0, 7.0], &bank);
        let s = std::f32::consts::FRAC_1_SQRT_2;
        assert_eq!(a.len(), 2);
        assert!((a[0] - 4.0 * s).abs() < 1e-6);
        assert!((a[1] - 12.0 * s).abs() < 1e-6);
        assert!((d[0] + 2.0 * s).abs() < 1e-6);
        assert!((d[1] + 2.0 * s).abs() < 1e-6);
    }

    #[test]
    fn test_coefficient_lengths() {
        let bank = FilterBank::new(WaveletFamily::Daubechies(2));
        let (a, d) = dwt(&[0.5; 7], &bank);
        assert_eq!(a.len(), 5);
        assert_eq!(d.len(), 5);
        assert_eq!(idwt(&a, &d, &bank).len(), 8);
    }

    #[test]
    fn test_perfect_reconstruction_1d() {
        let signal: Vec<f32> = (0..9).map(|i| ((i * 5) % 7) as f32).collect();
        for family in ["haar", "db2", "db3", "db4"] {
            let bank = FilterBank::new(family.parse().unwrap());
            let (a, d) = dwt(&signal, &bank);
            let rec = idwt(&a, &d, &bank);
            for (x, y) in signal.iter().zip(rec.iter()) {
                assert!((x - y).abs() < 1e-4, "{family}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn test_perfect_reconstruction_2d_multilevel() {
        let data = ramp(16, 12);
        for family in [WaveletFamily::Haar, WaveletFamily::Daubechies(2)] {
            let coeffs = wavedec2(&data, family, 3);
            assert_eq!(coeffs.details.len(), 3);
            let rec = waverec2(&coeffs, family);
            assert_eq!(rec.dim(), (16, 12));
            assert!(max_abs_diff(&rec, &data) < 1e-4, "{family}");
        }
    }

    #[test]
    fn test_odd_size_reconstructs_one_larger() {
        let data = ramp(9, 7);
        let coeffs = wavedec2(&data, WaveletFamily::Haar, 2);
        let rec = waverec2(&coeffs, WaveletFamily::Haar);
        assert_eq!(rec.dim(), (10, 8));
        let inner = rec.slice(s![..9, ..7]).to_owned();
        assert!(max_abs_diff(&inner, &data) < 1e-4);
    }

    #[test]
    fn test_details_are_coarsest_first() {
        let coeffs = wavedec2(&ramp(32, 32), WaveletFamily::Haar, 3);
        assert_eq!(coeffs.approximation.dim(), (4, 4));
        assert_eq!(coeffs.details[0].diagonal.dim(), (4, 4));
        assert_eq!(coeffs.details[2].diagonal.dim(), (16, 16));
    }

    #[test]
    fn test_constant_image_has_no_detail() {
        let gray = GrayImage::from_pixel(20, 20, Luma([180]));
        let extractor = WaveletFeatureExtractor::new(&WaveletConfig::preview());
        let detail = extractor.extract_gray(&gray);
        assert_eq!(detail.dimensions(), (20, 20));
        assert!(detail.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_edge_survives_detail_extraction() {
        // Vertical step edge between columns 4 and 5 (odd boundary, so a
        // single-level Haar pair straddles it).
        let gray = GrayImage::from_fn(10, 10, |x, _| Luma([if x < 5 { 0 } else { 255 }]));
        let extractor = WaveletFeatureExtractor::new(&WaveletConfig::preview());
        let detail = extractor.extract_gray(&gray);
        let edge_energy: u32 = (0..10).map(|y| detail.get_pixel(5, y)[0] as u32).sum();
        assert!(edge_energy > 0, "edge should leave a detail response");
        assert_eq!(detail.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_pipeline_default_is_db1_level5() {
        let extractor = WaveletFeatureExtractor::default();
        assert_eq!(extractor.family(), WaveletFamily::Daubechies(1));
        assert_eq!(extractor.level(), 5);
        let crop = RgbImage::from_fn(37, 41, |x, y| image::Rgb([(x * 6) as u8, (y * 5) as u8, 90]));
        let detail = extractor.extract(&crop);
        assert!(detail.width() >= 37 && detail.width() <= 38);
        assert!(detail.height() >= 41 && detail.height() <= 42);
    }

    #[test]
    fn test_negative_detail_wraps() {
        // Haar pair (0, 1) leaves -0.5 on the dark side and 0.5 on the bright side.
        let gray = GrayImage::from_fn(2, 2, |x, _| Luma([if x == 0 { 0 } else { 255 }]));
        let extractor = WaveletFeatureExtractor::new(&WaveletConfig::preview());
        let detail = extractor.extract_gray(&gray);
        assert_eq!(detail.as_raw(), &vec![129, 127, 129, 127]);
    }

    #[test]
    fn test_quantize_truncates_then_wraps() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(-1e-7), 0);
        assert_eq!(quantize(0.5), 127);
        assert_eq!(quantize(-0.5), 129);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(1.2), 50);
    }

    #[test]
    fn test_bgr_gray_weights_blue_over_red() {
        let red = RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 255]));
        let config = WaveletConfig::preview();

        assert_eq!(imaging::to_grayscale_swapped(&red).get_pixel(0, 0)[0], 29);
        assert_eq!(imaging::to_grayscale_swapped(&blue).get_pixel(0, 0)[0], 76);

        let bgr = WaveletFeatureExtractor::new(&config);
        let rgb = WaveletFeatureExtractor::new(&config).with_channel_order(ChannelOrder::Rgb);
        let crop = RgbImage::from_fn(2, 2, |x, _| {
            if x == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        // Red to blue rises in BGR gray (29 -> 76) and falls in RGB gray.
        assert_eq!(bgr.extract(&crop).get_pixel(1, 0)[0], 23);
        assert_eq!(rgb.extract(&crop).get_pixel(0, 0)[0], 23);
        assert_ne!(bgr.extract(&crop), rgb.extract(&crop));
    }

    #[test]
    fn test_zero_level_is_treated_as_one() {
        let extractor = WaveletFeatureExtractor::new(&WaveletConfig {
            family: WaveletFamily::Haar,
            level: 0,
        });
        assert_eq!(extractor.level(), 1);
    }
}
