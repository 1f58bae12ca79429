//! Pixel-level primitives: resize, content hashing and similarity scoring.

use super::MediaError;
use crate::frame::FrameImage;
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Digest used for hash-based fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    #[default]
    Sha256,
    Sha512,
}

/// Hex digest of the raw payload bytes.
pub fn content_hash(image: &FrameImage, method: HashMethod) -> String {
    match method {
        HashMethod::Sha256 => format!("{:x}", Sha256::digest(image.as_slice())),
        HashMethod::Sha512 => format!("{:x}", Sha512::digest(image.as_slice())),
    }
}

/// Resize to `width`x`height` with bilinear filtering, keeping the channel count.
///
/// Returns a clone of the input when the size already matches.
pub fn resize(image: &FrameImage, width: u32, height: u32) -> Result<FrameImage, MediaError> {
    if image.width() == width && image.height() == height {
        return Ok(image.clone());
    }

    let (w, h) = (image.width(), image.height());
    let pixels = image.as_slice().to_vec();
    let malformed = || MediaError::Unsupported(format!("{}-channel resize", image.channels()));

    let resized = match image.channels() {
        1 => {
            let src = ImageBuffer::<Luma<u8>, _>::from_raw(w, h, pixels).ok_or_else(malformed)?;
            imageops::resize(&src, width, height, FilterType::Triangle).into_raw()
        }
        2 => {
            let src = ImageBuffer::<LumaA<u8>, _>::from_raw(w, h, pixels).ok_or_else(malformed)?;
            imageops::resize(&src, width, height, FilterType::Triangle).into_raw()
        }
        3 => {
            let src = ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, pixels).ok_or_else(malformed)?;
            imageops::resize(&src, width, height, FilterType::Triangle).into_raw()
        }
        4 => {
            let src = ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, pixels).ok_or_else(malformed)?;
            imageops::resize(&src, width, height, FilterType::Triangle).into_raw()
        }
        _ => return Err(malformed()),
    };

    Ok(FrameImage::new(width, height, image.channels(), resized)?)
}

/// Convert to single-channel luma (ITU-R BT.601 weights).
pub fn grayscale(image: &FrameImage) -> Result<GrayImage, MediaError> {
    let (w, h) = (image.width(), image.height());
    let data = image.as_slice();

    let luma: Vec<u8> = match image.channels() {
        1 => data.to_vec(),
        3 | 4 => data
            .chunks_exact(image.channels() as usize)
            .map(|px| {
                let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect(),
        n => {
            return Err(MediaError::Unsupported(format!(
                "grayscale conversion of {n}-channel frames"
            )))
        }
    };

    GrayImage::from_raw(w, h, luma)
        .ok_or_else(|| MediaError::ReadFailed("grayscale buffer size mismatch".to_string()))
}

/// Normalized correlation coefficient between two equally sized frames.
///
/// Scores lie in `[-1, 1]`; 1 means the grayscale images are identical up to
/// brightness and contrast. Frames of different shape score 0. When either
/// image is flat (zero variance) the coefficient is undefined; the score is 1
/// if the payloads are byte-identical and 0 otherwise.
pub fn similarity(a: &FrameImage, b: &FrameImage) -> Result<f64, MediaError> {
    if !a.same_shape(b) {
        return Ok(0.0);
    }

    let ga = grayscale(a)?;
    let gb = grayscale(b)?;
    let n = ga.as_raw().len() as f64;

    let mean_a = ga.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = gb.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
    for (&pa, &pb) in ga.as_raw().iter().zip(gb.as_raw().iter()) {
        let da = pa as f64 - mean_a;
        let db = pb as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
        return Ok(if a.as_slice() == b.as_slice() { 1.0 } else { 0.0 });
    }

    Ok((cov / denom).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, offset: u8) -> FrameImage {
        let data: Vec<u8> = (0..width * height * 3)
            .map(|i| ((i / 3) as u8).wrapping_mul(7).wrapping_add(offset))
            .collect();
        FrameImage::new(width, height, 3, data).unwrap()
    }

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = gradient(8, 8, 0);
        let b = gradient(8, 8, 1);

        assert_eq!(content_hash(&a, HashMethod::Sha256), content_hash(&a.clone(), HashMethod::Sha256));
        assert_ne!(content_hash(&a, HashMethod::Sha256), content_hash(&b, HashMethod::Sha256));
        assert_eq!(content_hash(&a, HashMethod::Sha256).len(), 64);
        assert_eq!(content_hash(&a, HashMethod::Sha512).len(), 128);
    }

    #[test]
    fn test_resize_changes_dimensions() {
        let image = gradient(16, 8, 0);
        let resized = resize(&image, 8, 4).unwrap();

        assert_eq!(resized.width(), 8);
        assert_eq!(resized.height(), 4);
        assert_eq!(resized.channels(), 3);
        assert_eq!(resized.as_slice().len(), 8 * 4 * 3);
    }

    #[test]
    fn test_resize_noop_when_matching() {
        let image = gradient(8, 8, 3);
        assert_eq!(resize(&image, 8, 8).unwrap(), image);
    }

    #[test]
    fn test_identical_frames_score_one() {
        let image = gradient(12, 12, 5);
        let score = similarity(&image, &image.clone()).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_different_frames_score_lower() {
        let a = gradient(12, 12, 0);
        let data: Vec<u8> = a.as_slice().iter().rev().copied().collect();
        let b = FrameImage::new(12, 12, 3, data).unwrap();
        assert!(similarity(&a, &b).unwrap() < 0.95);
    }

    #[test]
    fn test_shape_mismatch_scores_zero() {
        let a = gradient(8, 8, 0);
        let b = gradient(8, 4, 0);
        assert_eq!(similarity(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_flat_frames() {
        let black = FrameImage::filled(4, 4, 3, 0).unwrap();
        let white = FrameImage::filled(4, 4, 3, 255).unwrap();
        assert_eq!(similarity(&black, &black.clone()).unwrap(), 1.0);
        assert_eq!(similarity(&black, &white).unwrap(), 0.0);
    }

    #[test]
    fn test_two_channel_similarity_is_unsupported() {
        let a = FrameImage::filled(4, 4, 2, 9).unwrap();
        assert!(similarity(&a, &a.clone()).is_err());
    }
}
