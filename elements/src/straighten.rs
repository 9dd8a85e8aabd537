// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Straightening of archive exposures.
//!
//! An exposure fetched from the archive is usually a tilted rectangle of
//! content on a white background. The normalizer finds the content's extreme
//! points, estimates the tilt from them, rotates the content upright on a
//! black-filled canvas and crops to the content bounds. Exposures whose content
//! already reaches the left border ("zoomed" exposures) have no tilt margin to
//! work from and are instead cropped by scanning inward along the diagonals.

use std::path::Path;

use canonical_error::{CanonicalError, data_loss_error, internal_error};
use image::{GrayImage, ImageReader, Luma};
use image::imageops;
use log::debug;

use crate::image_utils::rotate_expanded;

/// A boundary point found by one of the edge scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corner {
    pub row: u32,
    pub col: u32,
    pub value: u8,
}

/// First matching pixel when scanning in from each image edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Corners {
    pub top: Corner,
    pub bottom: Corner,
    pub left: Corner,
    pub right: Corner,
}

pub fn is_less(value: u8, threshold: u8) -> bool {
    value < threshold
}

pub fn is_greater(value: u8, threshold: u8) -> bool {
    value > threshold
}

// Returns the first pixel along `coords` (row, col) accepted by
// `accept(row, col, value)`.
fn first_where<A, I>(image: &GrayImage, coords: I, accept: &A) -> Option<Corner>
where A: Fn(u32, u32, u8) -> bool,
      I: Iterator<Item = (u32, u32)>
{
    for (row, col) in coords {
        let value = image.get_pixel(col, row)[0];
        if accept(row, col, value) {
            return Some(Corner{row, col, value});
        }
    }
    None
}

// Returns the first pixel along `coords` (row, col) that satisfies
// `predicate`.
fn first_match<P, I>(image: &GrayImage, coords: I, predicate: &P, threshold: u8)
                     -> Option<Corner>
where P: Fn(u8, u8) -> bool,
      I: Iterator<Item = (u32, u32)>
{
    first_where(image, coords, &|_row, _col, value| predicate(value, threshold))
}

/// Scans in from each of the four edges for the first pixel satisfying
/// `predicate(value, threshold)`:
///   top: rows downward, each row left to right.
///   bottom: rows upward, each row left to right.
///   left: columns rightward, each column top to bottom.
///   right: columns leftward, each column top to bottom.
/// Returns None if no pixel matches.
pub fn find_corners<P>(image: &GrayImage, predicate: P, threshold: u8)
                       -> Option<Corners>
where P: Fn(u8, u8) -> bool
{
    let (width, height) = image.dimensions();
    let top = first_match(
        image,
        (0..height).flat_map(|row| (0..width).map(move |col| (row, col))),
        &predicate, threshold)?;
    let bottom = first_match(
        image,
        (0..height).rev().flat_map(|row| (0..width).map(move |col| (row, col))),
        &predicate, threshold)?;
    let left = first_match(
        image,
        (0..width).flat_map(|col| (0..height).map(move |row| (row, col))),
        &predicate, threshold)?;
    let right = first_match(
        image,
        (0..width).rev().flat_map(|col| (0..height).map(move |row| (row, col))),
        &predicate, threshold)?;
    Some(Corners{top, bottom, left, right})
}

/// An exposure is "zoomed" when its first column holds non-background pixels
/// at two different rows, i.e. the content already spans the frame.
pub fn is_zoomed_in(image: &GrayImage, background_level: u8) -> bool {
    let height = image.height();
    if image.width() == 0 || height == 0 {
        return false;
    }
    let from_top = first_match(image, (0..height).map(|row| (row, 0)),
                               &is_less, background_level);
    let from_bottom = first_match(image, (0..height).rev().map(|row| (row, 0)),
                                  &is_less, background_level);
    match (from_top, from_bottom) {
        (Some(t), Some(b)) => t.row != b.row,
        _ => false,
    }
}

/// Tilt, in degrees, of the content edge running from the top corner to the
/// right corner. Positive when the right corner is lower in the image.
pub fn estimate_rotation(top: &Corner, right: &Corner) -> f64 {
    let d_row = right.row as f64 - top.row as f64;
    let d_col = right.col as f64 - top.col as f64;
    d_row.atan2(d_col).to_degrees()
}

// Corner pairs closer than this along both axes do not define an edge.
const MIN_EDGE_SPAN: u32 = 3;

fn is_degenerate_pair(a: &Corner, b: &Corner) -> bool {
    a.row.abs_diff(b.row) < MIN_EDGE_SPAN && a.col.abs_diff(b.col) < MIN_EDGE_SPAN
}

// Area of the bounding box of the content pixels, measured along axes turned
// by `theta` degrees. Smallest when the axes follow the content edges.
fn bounding_area(image: &GrayImage, background_level: u8, theta: f64) -> f64 {
    let (s, c) = theta.to_radians().sin_cos();
    let (mut min_u, mut max_u) = (f64::MAX, f64::MIN);
    let (mut min_v, mut max_v) = (f64::MAX, f64::MIN);
    for (col, row, pixel) in image.enumerate_pixels() {
        if pixel[0] >= background_level {
            continue;
        }
        let (x, y) = (col as f64, row as f64);
        let u = x * c + y * s;
        let v = y * c - x * s;
        min_u = min_u.min(u);
        max_u = max_u.max(u);
        min_v = min_v.min(v);
        max_v = max_v.max(v);
    }
    if min_u > max_u {
        return 0.0;
    }
    (max_u - min_u) * (max_v - min_v)
}

/// Tilt of the content, as estimate_rotation() measures it. The top and right
/// corners share one content edge and the left and bottom corners lie on the
/// parallel edge. Where an edge is shallow the scan stops short of the true
/// vertex and skews that pair's slope, so of the two slopes the one giving the
/// tighter bounding box is used. Pairs that nearly coincide are skipped.
pub fn estimate_tilt(image: &GrayImage, corners: &Corners, background_level: u8) -> f64 {
    let pairs = [(&corners.top, &corners.right), (&corners.left, &corners.bottom)];
    let mut best: Option<(f64, f64)> = None;
    for (a, b) in pairs {
        if is_degenerate_pair(a, b) {
            continue;
        }
        let theta = estimate_rotation(a, b);
        let area = bounding_area(image, background_level, theta);
        // The top and right pair wins near-ties, e.g. an untilted rectangle.
        if best.map_or(true, |(_, best_area)| area < best_area - 1.0) {
            best = Some((theta, area));
        }
    }
    best.map_or(0.0, |(theta, _)| theta)
}

// Moves diagonally from (row, col) by the given steps until a content pixel is
// found or the image is exited.
fn diagonal_scan(image: &GrayImage, row: u32, col: u32,
                 row_step: i64, col_step: i64, background_level: u8)
                 -> Option<Corner> {
    let (width, height) = image.dimensions();
    let steps = width.min(height) as i64;
    let coords = (0..steps).map(move |i| {
        ((row as i64 + i * row_step) as u32, (col as i64 + i * col_step) as u32)
    });
    first_match(image, coords, &is_less, background_level)
}

// Crops to rows [top, bottom) and columns [left, right).
fn crop_to(image: &GrayImage, top: u32, bottom: u32, left: u32, right: u32)
           -> Result<GrayImage, CanonicalError> {
    if bottom <= top || right <= left {
        return Err(data_loss_error(
            format!("Degenerate content bounds rows {}..{} cols {}..{}",
                    top, bottom, left, right).as_str()));
    }
    Ok(imageops::crop_imm(image, left, top, right - left, bottom - top).to_image())
}

#[derive(Clone, Copy, Debug)]
pub struct NormalizerConfig {
    // Pixels at or above this level are background (white margin). Kept below
    // 255 to tolerate JPEG noise and interpolation rounding.
    pub background_level: u8,

    // Fill used for canvas areas exposed by rotation. Pixels above this level
    // belong to the rotated frame.
    pub fill_level: u8,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig{background_level: 250, fill_level: 0}
    }
}

pub struct GeometryNormalizer {
    config: NormalizerConfig,
}

impl GeometryNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        GeometryNormalizer{config}
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Returns the exposure's content, upright and cropped to its bounds.
    pub fn straighten(&self, image: &GrayImage) -> Result<GrayImage, CanonicalError> {
        if is_zoomed_in(image, self.config.background_level) {
            debug!("Exposure is zoomed in, cropping without rotation");
            return self.straighten_zoomed(image);
        }
        self.straighten_rotated(image)
    }

    fn straighten_rotated(&self, image: &GrayImage) -> Result<GrayImage, CanonicalError> {
        let background = self.config.background_level;
        let fill = self.config.fill_level;

        let corners = find_corners(image, is_less, background).ok_or_else(
            || data_loss_error("Exposure has no content"))?;
        let theta = estimate_tilt(image, &corners, background);
        let turn = 90.0 - theta;
        let rotated = rotate_expanded(image, turn, fill);
        debug!("Estimated tilt {:.2} degrees", theta);

        // The exposure's frame turned the same way. Where it is below the
        // background level the interpolation mixed in fill, so a dark pixel
        // there is frame boundary rather than content.
        let (width, height) = image.dimensions();
        let frame = rotate_expanded(
            &GrayImage::from_pixel(width, height, Luma([u8::MAX])), turn, fill);
        let is_content = |row: u32, col: u32, value: u8| {
            value < background && frame.get_pixel(col, row)[0] >= background
        };

        // Scan inward from the rotated frame's extremes.
        let rc = find_corners(&rotated, is_greater, fill).ok_or_else(
            || internal_error("Rotated exposure is empty"))?;
        let (r0, r1, c0, c1) = (rc.top.row, rc.bottom.row, rc.left.col, rc.right.col);
        let top_edge = first_where(
            &rotated, (r0..=r1).flat_map(|row| (c0..=c1).map(move |col| (row, col))),
            &is_content);
        let bottom_edge = first_where(
            &rotated, (r0..=r1).rev().flat_map(|row| (c0..=c1).map(move |col| (row, col))),
            &is_content);
        let left_edge = first_where(
            &rotated, (c0..=c1).flat_map(|col| (r0..=r1).map(move |row| (row, col))),
            &is_content);
        let right_edge = first_where(
            &rotated, (c0..=c1).rev().flat_map(|col| (r0..=r1).map(move |row| (row, col))),
            &is_content);
        match (top_edge, bottom_edge, left_edge, right_edge) {
            (Some(t), Some(b), Some(l), Some(r)) => crop_to(&rotated, t.row, b.row, l.col, r.col),
            _ => Err(data_loss_error("Content edge not found in rotated exposure")),
        }
    }

    fn straighten_zoomed(&self, image: &GrayImage) -> Result<GrayImage, CanonicalError> {
        let background = self.config.background_level;
        let (width, height) = image.dimensions();
        let (last_row, last_col) = (height - 1, width - 1);

        let top_left = diagonal_scan(image, 0, 0, 1, 1, background);
        let top_right = diagonal_scan(image, 0, last_col, 1, -1, background);
        let bottom_left = diagonal_scan(image, last_row, 0, -1, 1, background);
        let bottom_right = diagonal_scan(image, last_row, last_col, -1, -1, background);
        let (tl, tr, bl, br) = match (top_left, top_right, bottom_left, bottom_right) {
            (Some(tl), Some(tr), Some(bl), Some(br)) => (tl, tr, bl, br),
            _ => { return Err(data_loss_error("Zoomed exposure diagonal has no content")); }
        };
        // Take the inner of each pair so no background corner survives.
        let top = tl.row.max(tr.row);
        let bottom = bl.row.min(br.row);
        let left = tl.col.max(bl.col);
        let right = tr.col.min(br.col);
        crop_to(image, top, bottom, left, right)
    }

    /// Straightens the exposure file at `path`, replacing it with the result.
    pub fn straighten_file(&self, path: &Path) -> Result<(), CanonicalError> {
        let reader = ImageReader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|e| data_loss_error(
                format!("Cannot open {:?}: {:?}", path, e).as_str()))?;
        let img = reader.decode().map_err(|e| data_loss_error(
            format!("Cannot decode {:?}: {:?}", path, e).as_str()))?;
        let straightened = self.straighten(&img.to_luma8())?;
        straightened.save(path).map_err(|e| internal_error(
            format!("Cannot write {:?}: {:?}", path, e).as_str()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use image::Luma;
    use super::*;

    const WHITE: u8 = 255;
    const CONTENT: u8 = 100;

    // White `width` x `height` frame holding a `2*half_w` x `2*half_h`
    // rectangle of CONTENT, rotated clockwise by `angle` degrees about the
    // frame center.
    fn tilted_exposure(width: u32, height: u32,
                       half_w: f64, half_h: f64, angle: f64) -> GrayImage {
        let (s, c) = angle.to_radians().sin_cos();
        let cx = (width as f64 - 1.0) / 2.0;
        let cy = (height as f64 - 1.0) / 2.0;
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let u = c * dx + s * dy;
            let v = -s * dx + c * dy;
            if u.abs() <= half_w && v.abs() <= half_h {
                Luma([CONTENT])
            } else {
                Luma([WHITE])
            }
        })
    }

    #[test]
    fn test_find_corners_single_pixel() {
        let mut img = GrayImage::from_pixel(30, 20, Luma([WHITE]));
        img.put_pixel(12, 7, Luma([3]));
        let corners = find_corners(&img, is_less, WHITE).unwrap();
        let expected = Corner{row: 7, col: 12, value: 3};
        assert_eq!(corners.top, expected);
        assert_eq!(corners.bottom, expected);
        assert_eq!(corners.left, expected);
        assert_eq!(corners.right, expected);
    }

    #[test]
    fn test_find_corners_scan_order() {
        // Axis aligned block: ties within an edge go to the first pixel in
        // scan order.
        let mut img = GrayImage::from_pixel(12, 12, Luma([0]));
        for row in 5..10 {
            for col in 3..8 {
                img.put_pixel(col, row, Luma([40]));
            }
        }
        let corners = find_corners(&img, is_greater, 0).unwrap();
        assert_eq!((corners.top.row, corners.top.col), (5, 3));
        assert_eq!((corners.bottom.row, corners.bottom.col), (9, 3));
        assert_eq!((corners.left.row, corners.left.col), (5, 3));
        assert_eq!((corners.right.row, corners.right.col), (5, 7));
        assert_eq!(corners.right.value, 40);
    }

    #[test]
    fn test_find_corners_none() {
        let img = GrayImage::from_pixel(10, 10, Luma([WHITE]));
        assert_eq!(find_corners(&img, is_less, WHITE), None);
    }

    #[test]
    fn test_is_zoomed_in() {
        let mut img = GrayImage::from_pixel(10, 10, Luma([WHITE]));
        assert!(!is_zoomed_in(&img, 250));

        // Single hit in column 0.
        img.put_pixel(0, 4, Luma([10]));
        assert!(!is_zoomed_in(&img, 250));

        // Hits elsewhere do not count.
        img.put_pixel(3, 8, Luma([10]));
        assert!(!is_zoomed_in(&img, 250));

        img.put_pixel(0, 6, Luma([10]));
        assert!(is_zoomed_in(&img, 250));
    }

    #[test]
    fn test_estimate_rotation() {
        let top = Corner{row: 10, col: 10, value: 0};
        let right = Corner{row: 20, col: 20, value: 0};
        assert!((estimate_rotation(&top, &right) - 45.0).abs() < 1e-9);
        let right = Corner{row: 10, col: 30, value: 0};
        assert_eq!(estimate_rotation(&top, &right), 0.0);
        // Degenerate: same point.
        assert_eq!(estimate_rotation(&top, &top), 0.0);
    }

    #[test]
    fn test_straighten_tilted_rectangle() {
        // 230x104 content rectangle tilted by 20 degrees in a 300x200 frame.
        let img = tilted_exposure(300, 200, 115.0, 52.0, 20.0);
        assert!(!is_zoomed_in(&img, 250));

        let normalizer = GeometryNormalizer::new(NormalizerConfig::default());
        let straightened = normalizer.straighten(&img).unwrap();
        let (w, h) = straightened.dimensions();

        // The straightening turn is (90 - tilt), so the long side ends up
        // vertical.
        assert!((w as i64 - 104).abs() <= 6, "width {}", w);
        assert!((h as i64 - 230).abs() <= 6, "height {}", h);

        assert_interior_is_content(&straightened, 5, "20 degrees");
        assert!(straightened.get_pixel(w / 2, h / 2)[0] < 150);
    }

    fn assert_interior_is_content(image: &GrayImage, inset: u32, case: &str) {
        let (w, h) = image.dimensions();
        assert!(w > 2 * inset && h > 2 * inset, "{}: too small {}x{}", case, w, h);
        for y in inset..h - inset {
            for x in inset..w - inset {
                let value = image.get_pixel(x, y)[0];
                assert!(value < 250, "{}: background at {},{}", case, x, y);
            }
        }
    }

    #[test]
    fn test_straighten_tilt_sweep() {
        let normalizer = GeometryNormalizer::new(NormalizerConfig::default());
        // (frame width, frame height, half width, half height)
        let frames = [(400, 300, 100.0, 50.0), (300, 300, 80.0, 60.0)];
        for (width, height, half_w, half_h) in frames {
            for angle in [-30.0, -10.0, -5.0, 0.0, 5.0, 10.0, 30.0] {
                let case = format!("{}x{} frame at {} degrees", width, height, angle);
                let img = tilted_exposure(width, height, half_w, half_h, angle);
                let straightened = normalizer.straighten(&img)
                    .unwrap_or_else(|e| panic!("{}: {:?}", case, e));
                let (w, h) = straightened.dimensions();

                // A clockwise tilt is measured along the long edge and ends
                // up portrait; a counterclockwise one along the short edge
                // and stays landscape.
                let (expected_w, expected_h) = if angle >= 0.0 {
                    (2.0 * half_h, 2.0 * half_w)
                } else {
                    (2.0 * half_w, 2.0 * half_h)
                };
                assert!((w as f64 - expected_w).abs() <= 6.0, "{}: width {}", case, w);
                assert!((h as f64 - expected_h).abs() <= 6.0, "{}: height {}", case, h);
                assert_interior_is_content(&straightened, 5, &case);
            }
        }
    }

    #[test]
    fn test_estimate_tilt() {
        let img = tilted_exposure(400, 300, 100.0, 50.0, 10.0);
        let corners = find_corners(&img, is_less, 250).unwrap();
        assert_abs_diff_eq!(estimate_tilt(&img, &corners, 250), 10.0, epsilon = 1.5);

        // Counterclockwise: the short edge from the top corner is measured.
        let img = tilted_exposure(400, 300, 100.0, 50.0, -10.0);
        let corners = find_corners(&img, is_less, 250).unwrap();
        assert_abs_diff_eq!(estimate_tilt(&img, &corners, 250), 80.0, epsilon = 1.5);

        let img = tilted_exposure(400, 300, 100.0, 50.0, 0.0);
        let corners = find_corners(&img, is_less, 250).unwrap();
        assert_abs_diff_eq!(estimate_tilt(&img, &corners, 250), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_estimate_tilt_skips_coincident_corners() {
        let img = GrayImage::from_pixel(40, 40, Luma([WHITE]));
        let corner = |row, col| Corner{row, col, value: 0};
        let corners = Corners{
            top: corner(10, 10),
            right: corner(11, 11),
            left: corner(20, 5),
            bottom: corner(30, 25),
        };
        assert_abs_diff_eq!(estimate_tilt(&img, &corners, 250),
                            26.565, epsilon = 1e-3);

        let corners = Corners{left: corner(10, 12), bottom: corner(12, 12), ..corners};
        assert_eq!(estimate_tilt(&img, &corners, 250), 0.0);
    }

    #[test]
    fn test_straighten_zoomed() {
        let (width, height) = (100_u32, 80_u32);
        // Content everywhere except triangles in the two left corners.
        let img = GrayImage::from_fn(width, height, |x, y| {
            let from_top = y + x;
            let from_bottom = (height - 1 - y) + x;
            if from_top < 15 || from_bottom < 15 {
                Luma([WHITE])
            } else {
                Luma([CONTENT])
            }
        });
        assert!(is_zoomed_in(&img, 250));

        let normalizer = GeometryNormalizer::new(NormalizerConfig::default());
        let cropped = normalizer.straighten(&img).unwrap();
        // Top-left diagonal hits at (8, 8), bottom-left at (71, 8); the right
        // hand corners are content already.
        assert_eq!(cropped.dimensions(), (91, 63));
        for pixel in cropped.pixels() {
            assert_eq!(pixel[0], CONTENT);
        }
    }

    #[test]
    fn test_straighten_blank_exposure() {
        let img = GrayImage::from_pixel(50, 40, Luma([WHITE]));
        let normalizer = GeometryNormalizer::new(NormalizerConfig::default());
        assert!(normalizer.straighten(&img).is_err());
    }

    #[test]
    fn test_straighten_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exposure_1.png");
        tilted_exposure(300, 200, 115.0, 52.0, 20.0).save(&path).unwrap();

        let normalizer = GeometryNormalizer::new(NormalizerConfig::default());
        normalizer.straighten_file(&path).unwrap();
        let (w, h) = image::open(&path).unwrap().to_luma8().dimensions();
        assert!((w as i64 - 104).abs() <= 6);
        assert!((h as i64 - 230).abs() <= 6);

        // Garbage bytes are a decode failure.
        let bad = dir.path().join("exposure_2.png");
        std::fs::write(&bad, b"not an image").unwrap();
        assert!(normalizer.straighten_file(&bad).is_err());
    }

}  // mod tests.
