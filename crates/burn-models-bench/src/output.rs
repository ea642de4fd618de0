//! Saving generated images

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::info;

use crate::error::Result;

/// Output path of each of `count` images
///
/// A single image goes to `path` itself; several get `-{i}` inserted before
/// the extension.
pub fn output_paths(path: &Path, count: usize) -> Vec<PathBuf> {
    if count == 1 {
        return vec![path.to_path_buf()];
    }

    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    (0..count)
        .map(|i| {
            let name = match &extension {
                Some(ext) => format!("{stem}-{i}.{ext}"),
                None => format!("{stem}-{i}"),
            };
            path.with_file_name(name)
        })
        .collect()
}

/// Write `images` next to `path`, returning the paths written
pub fn save_images(images: &[RgbImage], path: &Path) -> Result<Vec<PathBuf>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let paths = output_paths(path, images.len());
    for (image, path) in images.iter().zip(&paths) {
        image.save(path)?;
        info!(path = %path.display(), "saved image");
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_output_paths() {
        let path = Path::new("out/image.png");
        assert_eq!(output_paths(path, 1), vec![PathBuf::from("out/image.png")]);
        assert_eq!(
            output_paths(path, 3),
            vec![
                PathBuf::from("out/image-0.png"),
                PathBuf::from("out/image-1.png"),
                PathBuf::from("out/image-2.png"),
            ]
        );
        assert_eq!(output_paths(Path::new("image"), 2)[1], PathBuf::from("image-1"));
        assert!(output_paths(path, 0).is_empty());
    }

    #[test]
    fn test_save_batch() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![RgbImage::from_pixel(8, 4, Rgb([1, 2, 3])); 2];
        let written = save_images(&images, &dir.path().join("nested").join("out.png")).unwrap();

        assert_eq!(written.len(), 2);
        for path in &written {
            let loaded = image::open(path).unwrap().to_rgb8();
            assert_eq!(loaded.dimensions(), (8, 4));
        }
    }
}
