//! Change detection using perceptual hashing.
//!
//! When navigation stalls (end of list, lost focus) consecutive frames look
//! the same and extracting them again only produces duplicates. The average
//! hash (aHash) of each frame is compared with the previous one to detect
//! that without a pixel-by-pixel comparison.

use image::DynamicImage;
use tracing::trace;

/// Hash size (8x8 = 64 bits)
const HASH_SIZE: u32 = 8;

/// Perceptual hash value (64-bit)
pub type PerceptualHash = u64;

/// Tracks the last frame's hash for a single capture target
pub struct ChangeDetector {
    last_hash: Option<PerceptualHash>,
    /// Hamming distance at or above which a frame counts as changed
    threshold: u32,
}

impl ChangeDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            last_hash: None,
            threshold,
        }
    }

    /// Check if a frame differs from the previous one
    ///
    /// Returns `true` for the first frame, or when the hash distance reaches
    /// the threshold. The stored hash only moves on change, so slow drift is
    /// still caught.
    pub fn has_changed(&mut self, image: &DynamicImage) -> bool {
        let current_hash = compute_ahash(image);

        let changed = match self.last_hash {
            Some(prev_hash) => {
                let distance = hamming_distance(current_hash, prev_hash);
                trace!(
                    "Frame hash {} distance: {} (threshold: {})",
                    hash_to_hex(current_hash),
                    distance,
                    self.threshold
                );
                distance >= self.threshold
            }
            None => true,
        };

        if changed {
            self.last_hash = Some(current_hash);
        }

        changed
    }

    /// Forget the previous frame (e.g. after the capture target changed)
    pub fn reset(&mut self) {
        self.last_hash = None;
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Compute average hash (aHash) for an image
///
/// Algorithm:
/// 1. Resize to 8x8
/// 2. Convert to grayscale
/// 3. Calculate average brightness
/// 4. Generate 64-bit hash: bit=1 if pixel > average, else 0
pub fn compute_ahash(image: &DynamicImage) -> PerceptualHash {
    let resized = image.resize_exact(HASH_SIZE, HASH_SIZE, image::imageops::FilterType::Nearest);
    let gray = resized.to_luma8();

    let sum: u32 = gray.pixels().map(|p| p.0[0] as u32).sum();
    let avg = (sum / (HASH_SIZE * HASH_SIZE)) as u8;

    let mut hash: PerceptualHash = 0;
    for (i, pixel) in gray.pixels().enumerate() {
        if pixel.0[0] > avg {
            hash |= 1 << i;
        }
    }

    hash
}

/// Number of differing bits (0-64)
pub fn hamming_distance(a: PerceptualHash, b: PerceptualHash) -> u32 {
    (a ^ b).count_ones()
}

pub fn hash_to_hex(hash: PerceptualHash) -> String {
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn create_test_image(brightness: u8) -> DynamicImage {
        let mut img = RgbImage::new(100, 100);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([brightness, brightness, brightness]);
        }
        DynamicImage::ImageRgb8(img)
    }

    fn create_half_image() -> DynamicImage {
        let mut img = RgbImage::new(100, 100);
        for (x, _, pixel) in img.enumerate_pixels_mut() {
            let brightness = if x < 50 { 0 } else { 255 };
            *pixel = Rgb([brightness, brightness, brightness]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0, 1), 1);
        assert_eq!(hamming_distance(0, 0xFF), 8);
        assert_eq!(hamming_distance(0, u64::MAX), 64);
    }

    #[test]
    fn test_identical_images_same_hash() {
        assert_eq!(
            compute_ahash(&create_test_image(128)),
            compute_ahash(&create_test_image(128))
        );
    }

    #[test]
    fn test_first_frame_counts_as_changed() {
        let mut detector = ChangeDetector::new(2);
        assert!(detector.has_changed(&create_test_image(128)));
    }

    #[test]
    fn test_same_frame_is_unchanged() {
        let mut detector = ChangeDetector::new(2);
        let img = create_test_image(128);

        assert!(detector.has_changed(&img));
        assert!(!detector.has_changed(&img));
    }

    #[test]
    fn test_different_frame_is_changed() {
        let mut detector = ChangeDetector::new(2);

        assert!(detector.has_changed(&create_test_image(0)));
        assert!(detector.has_changed(&create_half_image()));
    }

    #[test]
    fn test_reset_forgets_previous_frame() {
        let mut detector = ChangeDetector::new(2);
        let img = create_test_image(128);

        assert!(detector.has_changed(&img));
        detector.reset();
        assert!(detector.has_changed(&img));
    }

    #[test]
    fn test_hash_to_hex() {
        assert_eq!(hash_to_hex(0), "0000000000000000");
        assert_eq!(hash_to_hex(255), "00000000000000ff");
    }
}
