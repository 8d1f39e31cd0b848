use image::GrayImage;
use rayon::prelude::*;

use crate::config::{HeuristicParams, RefineParams};
use crate::errors::{CutoutError, Result};
use crate::postprocess::compose;
use crate::refine::refine;
use crate::types::Image;

/// Model-free matte: alpha grows with colour distance from the border colour.
///
/// Works well on product shots and portraits against a plain backdrop;
/// anything sharing the backdrop colour is cut away. Deterministic.
pub fn fast_matte(image: &Image, params: &HeuristicParams, refine_params: RefineParams) -> Result<Image> {
    let (width, height) = image.dimensions();
    let background = estimate_background(image);
    let (low, high) = cutoffs(image, background, params);

    let row_len = width as usize;
    let mut alpha = vec![0u8; row_len * height as usize];
    alpha
        .par_chunks_mut(row_len)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, a) in row.iter_mut().enumerate() {
                let d = distance(image.pixel(x as u32, y as u32), background);
                *a = ramp(d, low, high);
            }
        });

    let mask = GrayImage::from_raw(width, height, alpha).ok_or(CutoutError::InvalidImage {
        width,
        height,
        len: image.pixels().len(),
    })?;
    compose(image, &refine(&mask, refine_params))
}

/// Mean RGB of the four border lines, sampled at a fixed stride.
pub fn estimate_background(image: &Image) -> [f32; 3] {
    let (w, h) = image.dimensions();
    let step = (w.min(h) / 50).max(1) as usize;

    let mut sum = [0u64; 3];
    let mut count = 0u64;
    let mut add = |p: [u8; 4]| {
        for c in 0..3 {
            sum[c] += u64::from(p[c]);
        }
        count += 1;
    };
    for x in (0..w).step_by(step) {
        add(image.pixel(x, 0));
        add(image.pixel(x, h - 1));
    }
    for y in (0..h).step_by(step) {
        add(image.pixel(0, y));
        add(image.pixel(w - 1, y));
    }

    let count = count.max(1) as f32;
    [
        sum[0] as f32 / count,
        sum[1] as f32 / count,
        sum[2] as f32 / count,
    ]
}

/// Low and high distance cutoffs from a sparse grid over the whole image.
fn cutoffs(image: &Image, background: [f32; 3], params: &HeuristicParams) -> (f32, f32) {
    let (w, h) = image.dimensions();
    let step_x = (w / 64).max(1) as usize;
    let step_y = (h / 64).max(1) as usize;

    let mut dists: Vec<f32> = (0..h)
        .step_by(step_y)
        .flat_map(|y| (0..w).step_by(step_x).map(move |x| (x, y)))
        .map(|(x, y)| distance(image.pixel(x, y), background))
        .collect();
    dists.sort_by(f32::total_cmp);

    let at = |q: f32| {
        let i = ((dists.len() as f32 * q).floor() as usize).min(dists.len().saturating_sub(1));
        dists.get(i).copied().unwrap_or(0.0)
    };
    let low = at(params.low_quantile) + params.low_margin;
    let high = (at(params.high_quantile) + params.high_margin).max(low);
    (low, high)
}

#[inline]
fn distance(p: [u8; 4], background: [f32; 3]) -> f32 {
    let dr = f32::from(p[0]) - background[0];
    let dg = f32::from(p[1]) - background[1];
    let db = f32::from(p[2]) - background[2];
    (dr * dr + dg * dg + db * db).sqrt()
}

#[inline]
fn ramp(d: f32, low: f32, high: f32) -> u8 {
    if d <= low {
        0
    } else if d >= high {
        255
    } else {
        (255.0 * (d - low) / (high - low)).round().clamp(0.0, 255.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bordered(size: u32, border: [u8; 4], center: [u8; 4], inset: u32) -> Image {
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let inside = x >= inset && x < size - inset && y >= inset && y < size - inset;
                pixels.extend_from_slice(if inside { &center } else { &border });
            }
        }
        Image::new(size, size, pixels).unwrap()
    }

    fn run(image: &Image) -> Result<Image> {
        fast_matte(image, &HeuristicParams::default(), RefineParams::new(1, 2))
    }

    #[test]
    fn test_uniform_gray_is_transparent() -> Result<()> {
        let image = Image::from_pixel(4, 4, [128, 128, 128, 255])?;
        let out = run(&image)?;
        assert!(out.alpha().iter().all(|a| *a <= 8));
        Ok(())
    }

    #[test]
    fn test_dark_center_on_white_border() -> Result<()> {
        let image = bordered(4, [255, 255, 255, 255], [0, 0, 0, 255], 1);
        let out = run(&image)?;
        for y in 0..4 {
            for x in 0..4 {
                let a = out.pixel(x, y)[3];
                if (1..3).contains(&x) && (1..3).contains(&y) {
                    assert!(a >= 247, "center ({x}, {y}) alpha {a}");
                } else {
                    assert!(a <= 8, "border ({x}, {y}) alpha {a}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_larger_subject_keeps_its_core() -> Result<()> {
        let image = bordered(64, [240, 240, 235, 255], [30, 60, 90, 255], 16);
        let out = run(&image)?;
        assert_eq!(out.pixel(32, 32)[3], 255);
        assert_eq!(out.pixel(2, 2)[3], 0);
        assert_eq!(out.pixel(2, 2)[..3], image.pixel(2, 2)[..3]);
        Ok(())
    }

    #[test]
    fn test_deterministic() -> Result<()> {
        let mut pixels = Vec::new();
        for i in 0..(37 * 29) {
            pixels.extend_from_slice(&[(i * 13 % 256) as u8, (i * 7 % 256) as u8, (i % 256) as u8, 255]);
        }
        let image = Image::new(37, 29, pixels)?;
        assert_eq!(run(&image)?, run(&image)?);
        Ok(())
    }

    #[test]
    fn test_background_estimate_from_border() -> Result<()> {
        let image = bordered(10, [10, 20, 30, 255], [200, 200, 200, 255], 1);
        assert_eq!(estimate_background(&image), [10.0, 20.0, 30.0]);
        Ok(())
    }

    #[test]
    fn test_ramp() {
        assert_eq!(ramp(5.0, 5.0, 20.0), 0);
        assert_eq!(ramp(20.0, 5.0, 20.0), 255);
        assert_eq!(ramp(12.5, 5.0, 20.0), 128);
        // degenerate band
        assert_eq!(ramp(6.0, 5.0, 5.0), 255);
    }
}
