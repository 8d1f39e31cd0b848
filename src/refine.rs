//! Mask clean-up shared by the model and heuristic paths: a binary
//! dilate-then-erode pass that fills pinholes and smooths ragged contours,
//! followed by a box-blur feather.

use image::GrayImage;
use imageproc::{
    distance_transform::Norm,
    filter::box_filter,
    morphology::{dilate, erode},
};

use crate::config::RefineParams;

/// Radius actually applied to a `width`×`height` mask.
///
/// The window `2r + 1` is kept within a quarter of the shorter side, so very
/// small images are passed through untouched.
pub fn effective_radius(radius: u8, width: u32, height: u32) -> u8 {
    let cap = (width.min(height) / 4).saturating_sub(1) / 2;
    radius.min(cap.min(u32::from(u8::MAX)) as u8)
}

/// Binarizes at 50% and applies dilate then erode with a square window.
///
/// Pixels outside the image are ignored by both operators, which makes the
/// pair idempotent on its own output.
pub fn open_mask(mask: &GrayImage, radius: u8) -> GrayImage {
    let radius = effective_radius(radius, mask.width(), mask.height());
    if radius == 0 {
        return mask.clone();
    }
    let mut binary = mask.clone();
    for p in binary.pixels_mut() {
        p.0[0] = if p.0[0] >= 128 { 255 } else { 0 };
    }
    erode(&dilate(&binary, Norm::LInf, radius), Norm::LInf, radius)
}

/// Box blur over a `(2r + 1)` square, replicating edge pixels.
pub fn feather(mask: &GrayImage, radius: u8) -> GrayImage {
    let radius = effective_radius(radius, mask.width(), mask.height());
    if radius == 0 {
        return mask.clone();
    }
    box_filter(mask, u32::from(radius), u32::from(radius))
}

pub fn refine(mask: &GrayImage, params: RefineParams) -> GrayImage {
    feather(&open_mask(mask, params.morph_radius), params.feather_radius)
}
