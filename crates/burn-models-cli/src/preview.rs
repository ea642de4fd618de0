//! Terminal image preview
//!
//! Draws an image with 24-bit ANSI colors, two pixel rows per text row using
//! the upper half block.

use std::fmt::Write;

use image::RgbImage;
use image::imageops::{self, FilterType};

pub const MAX_WIDTH: u32 = 80;

/// Render `image` as ANSI text at most `max_width` columns wide
pub fn render_image(image: &RgbImage, max_width: u32) -> String {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return String::new();
    }

    let columns = width.min(max_width.max(1));
    let rows = ((height as u64 * columns as u64 / width as u64) as u32).max(1);
    let scaled = imageops::resize(image, columns, rows, FilterType::Triangle);

    let mut out = String::new();
    for y in (0..rows).step_by(2) {
        for x in 0..columns {
            let [r, g, b] = scaled.get_pixel(x, y).0;
            let _ = write!(out, "\x1b[38;2;{r};{g};{b}m");
            if y + 1 < rows {
                let [r, g, b] = scaled.get_pixel(x, y + 1).0;
                let _ = write!(out, "\x1b[48;2;{r};{g};{b}m");
            }
            out.push('\u{2580}');
        }
        out.push_str("\x1b[0m\n");
    }
    out
}

pub fn print_image(image: &RgbImage, max_width: u32) {
    print!("{}", render_image(image, max_width));
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_render_dimensions() {
        let image = RgbImage::from_pixel(160, 160, Rgb([255, 0, 0]));
        let text = render_image(&image, MAX_WIDTH);

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 40);
        assert!(lines.iter().all(|line| line.matches('\u{2580}').count() == 80));
        assert!(text.contains("\x1b[38;2;255;0;0m"));
    }

    #[test]
    fn test_odd_rows_have_no_background() {
        let image = RgbImage::from_pixel(2, 3, Rgb([1, 2, 3]));
        let text = render_image(&image, MAX_WIDTH);
        let last = text.lines().last().unwrap();

        assert_eq!(text.lines().count(), 2);
        assert!(!last.contains("48;2"));
    }

    #[test]
    fn test_empty_image() {
        assert!(render_image(&RgbImage::new(0, 0), MAX_WIDTH).is_empty());
    }
}
