// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{GrayImage, Luma};
use image::imageops;
use imageproc::filter::median_filter;
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use imageproc::stats::histogram;

// Builds the histogram equalization lookup table. The cumulative histogram is
// rescaled so that the lowest occupied intensity maps to 0 and the highest to
// 255. Returns None when all pixels share one intensity, which leaves nothing
// to spread.
fn compute_equalization_lut(histo: &[u32; 256]) -> Option<[u8; 256]> {
    let mut cum_sum = [0_u64; 256];
    let mut running = 0_u64;
    for (n, count) in histo.iter().enumerate() {
        running += *count as u64;
        cum_sum[n] = running;
    }
    // Intensities below the darkest occupied bin have a zero cumulative count
    // and clamp to 0 along with it.
    let cum_min = *cum_sum.iter().find(|c| **c > 0)?;
    let cum_max = cum_sum[255];
    if cum_max == cum_min {
        return None;
    }
    let mut lut: [u8; 256] = [0; 256];
    for n in 0..256 {
        let c = cum_sum[n].max(cum_min);
        lut[n] = ((c - cum_min) * 255 / (cum_max - cum_min)) as u8;
    }
    Some(lut)
}

// Copy the image, remapping intensities by histogram equalization.
pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let mut out = image.clone();
    equalize_histogram_mut(&mut out);
    out
}

// In-place variant of equalize_histogram().
pub fn equalize_histogram_mut(image: &mut GrayImage) {
    let channel_histogram = histogram(&*image);
    let lut = match compute_equalization_lut(&channel_histogram.channels[0]) {
        Some(lut) => lut,
        None => { return; }
    };
    for pixel in image.pixels_mut() {
        pixel[0] = lut[pixel[0] as usize];
    }
}

// Edge-preserving smoothing applied to a stacked composite ahead of
// equalization. `radius` of 0 returns an unmodified copy.
pub fn smooth(image: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return image.clone();
    }
    median_filter(image, radius, radius)
}

// Rotates `image` clockwise by `angle` degrees about its center. Unlike
// imageproc's rotate_about_center(), the canvas is first grown to the image
// diagonal so no content is clipped. Exposed areas get `fill`.
pub fn rotate_expanded(image: &GrayImage, angle: f64, fill: u8) -> GrayImage {
    let (w, h) = image.dimensions();
    let side = (w as f64).hypot(h as f64).ceil() as u32;
    let mut canvas = GrayImage::from_pixel(side, side, Luma([fill]));
    imageops::replace(&mut canvas, image,
                      ((side - w) / 2) as i64, ((side - h) / 2) as i64);
    rotate_about_center(&canvas,
                        angle.to_radians() as f32,
                        Interpolation::Bilinear,
                        Luma::<u8>([fill]))
}

// mod tests.
