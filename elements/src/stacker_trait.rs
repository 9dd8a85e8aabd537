// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, data_loss_error};
use image::{GrayImage, ImageReader};
use image::imageops;
use log::debug;

// Combines several exposures of one sky location into a single composite.
// `paths` are straightened exposure files, all of the same field.
// If no composite is returned, an error is returned:
//   DataLoss: `paths` is empty, or a file could not be read or decoded.
//   Internal: the implementation failed for another reason.
// The caller treats every error as a processing failure of the location.
pub trait ExposureStacker {
    fn stack(&self, paths: &[PathBuf]) -> Result<GrayImage, CanonicalError>;
}

// Pixel-wise mean of the exposures. Straightening can leave the exposures a
// few pixels different in size; each is center-cropped to the smallest common
// width and height before accumulating.
#[derive(Debug, Default)]
pub struct MeanStacker {}

impl MeanStacker {
    pub fn new() -> Self {
        MeanStacker{}
    }

    fn load(path: &Path) -> Result<GrayImage, CanonicalError> {
        let reader = ImageReader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| data_loss_error(
                format!("Cannot open {:?}: {:?}", path, e).as_str()))?;
        let img = reader.decode().map_err(|e| data_loss_error(
            format!("Cannot decode {:?}: {:?}", path, e).as_str()))?;
        Ok(img.to_luma8())
    }
}

fn center_crop(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (w, h) = image.dimensions();
    if (w, h) == (width, height) {
        return image.clone();
    }
    imageops::crop_imm(image, (w - width) / 2, (h - height) / 2,
                       width, height).to_image()
}

impl ExposureStacker for MeanStacker {
    fn stack(&self, paths: &[PathBuf]) -> Result<GrayImage, CanonicalError> {
        if paths.is_empty() {
            return Err(data_loss_error("No exposures to stack"));
        }
        let frames = paths.iter()
            .map(|p| Self::load(p))
            .collect::<Result<Vec<GrayImage>, CanonicalError>>()?;

        let width = frames.iter().map(|f| f.width()).min().unwrap_or(0);
        let height = frames.iter().map(|f| f.height()).min().unwrap_or(0);
        if width == 0 || height == 0 {
            return Err(data_loss_error("Exposure has zero size"));
        }

        let mut sum = vec![0.0_f32; (width * height) as usize];
        for frame in &frames {
            let cropped = center_crop(frame, width, height);
            for (acc, pixel) in sum.iter_mut().zip(cropped.as_raw().iter()) {
                *acc += *pixel as f32;
            }
        }
        let inv_count = 1.0 / frames.len() as f32;
        let out_vec: Vec<u8> = sum.iter()
            .map(|s| (s * inv_count).round().clamp(0.0, 255.0) as u8)
            .collect();
        debug!("Stacked {} exposures into {}x{}", frames.len(), width, height);
        GrayImage::from_raw(width, height, out_vec).ok_or_else(
            || data_loss_error("Stacked buffer size mismatch"))
    }
}

#[cfg(test)]
mod tests {
    use image::Luma;
    use super::*;

    #[test]
    fn test_mean_of_exposures() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (n, level) in [10_u8, 20, 60].iter().enumerate() {
            let path = dir.path().join(format!("exposure_{}.png", n + 1));
            GrayImage::from_pixel(6, 4, Luma([*level])).save(&path).unwrap();
            paths.push(path);
        }
        let stacked = MeanStacker::new().stack(&paths).unwrap();
        assert_eq!(stacked.dimensions(), (6, 4));
        assert!(stacked.pixels().all(|p| p[0] == 30));
    }

    #[test]
    fn test_mismatched_sizes_center_crop() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("exposure_1.png");
        let small = dir.path().join("exposure_2.png");
        // 8x6 frame with a bright 4x4 center; 4x4 frame that is all bright.
        let img = GrayImage::from_fn(8, 6, |x, y| {
            if (2..6).contains(&x) && (1..5).contains(&y) { Luma([200]) } else { Luma([0]) }
        });
        img.save(&big).unwrap();
        GrayImage::from_pixel(4, 4, Luma([100])).save(&small).unwrap();

        let stacked = MeanStacker::new().stack(&[big, small]).unwrap();
        assert_eq!(stacked.dimensions(), (4, 4));
        assert!(stacked.pixels().all(|p| p[0] == 150));
    }

    #[test]
    fn test_stack_errors() {
        assert!(MeanStacker::new().stack(&[]).is_err());

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("exposure_1.jpeg");
        assert!(MeanStacker::new().stack(&[missing]).is_err());
    }

}  // mod tests.
