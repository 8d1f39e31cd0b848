use image::{imageops, imageops::FilterType, GrayImage, ImageBuffer, Luma};
use ndarray::Array2;

use crate::config::{ContrastCurve, RefineParams};
use crate::errors::{CutoutError, Result};
use crate::preprocess::LetterboxGeometry;
use crate::refine::refine;
use crate::types::Image;

/// Spread below which the mask is treated as flat and not stretched.
const MIN_RANGE: f32 = 1e-6;

/// Turns the raw model plane into the output image.
///
/// Squash, normalize and contrast the mask in tensor space, crop the letterbox
/// and resize back to the source size, quantize, refine, then write the alpha
/// into a copy of `original`. The input buffer is never modified.
pub fn decode_mask(
    raw: &Array2<f32>,
    geometry: &LetterboxGeometry,
    original: &Image,
    contrast: &ContrastCurve,
    refine_params: RefineParams,
) -> Result<Image> {
    let side = geometry.target_size as usize;
    if raw.dim() != (side, side) {
        return Err(CutoutError::MaskOutputMissing {
            expected: geometry.plane_len(),
        });
    }

    let mut mask = squash(raw);
    normalize(&mut mask);
    apply_contrast(&mut mask, contrast);

    let alpha = uncrop(&mask, geometry, original.width(), original.height())?;
    let alpha = refine(&alpha, refine_params);
    compose(original, &alpha)
}

/// Logistic squashing, only when some value lies outside [0, 1].
fn squash(raw: &Array2<f32>) -> Array2<f32> {
    if raw.iter().any(|v| *v < 0.0 || *v > 1.0) {
        raw.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    } else {
        raw.clone()
    }
}

fn normalize(mask: &mut Array2<f32>) {
    let (min, max) = mask
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = max - min;
    if range > MIN_RANGE {
        mask.mapv_inplace(|v| (v - min) / range);
    }
}

fn apply_contrast(mask: &mut Array2<f32>, curve: &ContrastCurve) {
    mask.mapv_inplace(|v| {
        let v = v.clamp(0.0, 1.0).powf(curve.exponent);
        if v < curve.low {
            0.0
        } else if v > curve.high {
            1.0
        } else {
            v
        }
    });
}

/// Crops the letterbox margins, resizes to `width`×`height` and quantizes.
fn uncrop(mask: &Array2<f32>, geometry: &LetterboxGeometry, width: u32, height: u32) -> Result<GrayImage> {
    let side = geometry.target_size;
    let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(side, side, mask.iter().copied().collect()).ok_or(
            CutoutError::MaskOutputMissing {
                expected: geometry.plane_len(),
            },
        )?;

    let cropped = imageops::crop_imm(
        &plane,
        geometry.offset_x,
        geometry.offset_y,
        geometry.scaled_width,
        geometry.scaled_height,
    )
    .to_image();
    let resized = imageops::resize(&cropped, width, height, FilterType::Triangle);

    Ok(GrayImage::from_fn(width, height, |x, y| {
        let v = resized.get_pixel(x, y).0[0];
        Luma([(v * 255.0).round().clamp(0.0, 255.0) as u8])
    }))
}

pub(crate) fn compose(original: &Image, alpha: &GrayImage) -> Result<Image> {
    let mut pixels = original.pixels().to_vec();
    for (px, a) in pixels.chunks_exact_mut(4).zip(alpha.as_raw()) {
        px[3] = *a;
    }
    Image::new(original.width(), original.height(), pixels)
}
