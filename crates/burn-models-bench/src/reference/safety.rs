//! Reference post-decode filter

use image::{Rgb, RgbImage};

use crate::components::SafetyChecker;

/// Flags images whose mean luminance exceeds a threshold and replaces them
/// with black
#[derive(Debug, Clone, Copy)]
pub struct LuminanceChecker {
    pub threshold: f32,
}

impl Default for LuminanceChecker {
    fn default() -> Self {
        Self { threshold: 0.98 }
    }
}

fn mean_luminance(image: &RgbImage) -> f32 {
    let pixels = (image.width() * image.height()).max(1) as f32;
    let total: f32 = image
        .pixels()
        .map(|Rgb([r, g, b])| 0.299 * *r as f32 + 0.587 * *g as f32 + 0.114 * *b as f32)
        .sum();
    total / pixels / 255.0
}

impl SafetyChecker for LuminanceChecker {
    fn check(&self, images: &mut [RgbImage]) -> Vec<bool> {
        images
            .iter_mut()
            .map(|image| {
                let flagged = mean_luminance(image) > self.threshold;
                if flagged {
                    image.pixels_mut().for_each(|p| *p = Rgb([0, 0, 0]));
                }
                flagged
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_blanks_bright_images() {
        let checker = LuminanceChecker::default();
        let mut images = vec![
            RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])),
            RgbImage::from_pixel(4, 4, Rgb([40, 90, 200])),
        ];
        assert_eq!(checker.check(&mut images), vec![true, false]);
        assert!(images[0].pixels().all(|p| p.0 == [0, 0, 0]));
        assert_eq!(images[1].get_pixel(0, 0).0, [40, 90, 200]);
    }
}
