//! Property-based tests for the pixel pipeline
//!
//! Shape and channel invariants that must hold for any input image, checked
//! against the pure stages without a worker thread.

use cutout_rs::heuristic::fast_matte;
use cutout_rs::postprocess::decode_mask;
use cutout_rs::preprocess::{to_tensor, LetterboxGeometry};
use cutout_rs::{ContrastCurve, HeuristicParams, Image, Normalization, RefineParams};
use ndarray::Array2;
use proptest::prelude::*;

/// Strategy for small but valid image dimensions
fn image_dimensions() -> impl Strategy<Value = (u32, u32)> {
    (1u32..=24, 1u32..=24)
}

/// Strategy for an image with arbitrary RGBA content
fn rgba_image() -> impl Strategy<Value = Image> {
    image_dimensions().prop_flat_map(|(w, h)| {
        prop::collection::vec(any::<u8>(), (w * h * 4) as usize)
            .prop_map(move |pixels| Image::new(w, h, pixels).unwrap())
    })
}

/// Strategy for in-range refinement radii
fn refine_params() -> impl Strategy<Value = RefineParams> {
    (0u8..=RefineParams::MAX_RADIUS, 0u8..=RefineParams::MAX_RADIUS)
        .prop_map(|(m, f)| RefineParams::new(m, f))
}

fn same_rgb(a: &Image, b: &Image) -> bool {
    a.pixels()
        .chunks_exact(4)
        .zip(b.pixels().chunks_exact(4))
        .all(|(p, q)| p[..3] == q[..3])
}

proptest! {
    /// Property: the heuristic only rewrites alpha
    #[test]
    fn fast_matte_preserves_rgb_and_dimensions(image in rgba_image(), refine in refine_params()) {
        let out = fast_matte(&image, &HeuristicParams::default(), refine).unwrap();
        prop_assert_eq!(out.dimensions(), image.dimensions());
        prop_assert!(same_rgb(&out, &image));
    }

    /// Property: the heuristic is deterministic
    #[test]
    fn fast_matte_is_deterministic(image in rgba_image()) {
        let params = HeuristicParams::default();
        let a = fast_matte(&image, &params, RefineParams::new(1, 2)).unwrap();
        let b = fast_matte(&image, &params, RefineParams::new(1, 2)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Property: letterboxing always fits inside the canvas, centred
    #[test]
    fn letterbox_fits_and_centres(
        (w, h) in (1u32..=5000, 1u32..=5000),
        target in 8u32..=512
    ) {
        let g = LetterboxGeometry::fit(w, h, target);
        prop_assert!(g.scaled_width >= 1 && g.scaled_width <= target);
        prop_assert!(g.scaled_height >= 1 && g.scaled_height <= target);
        prop_assert!(g.scaled_width == target || g.scaled_height == target);
        prop_assert_eq!(g.offset_x, (target - g.scaled_width) / 2);
        prop_assert_eq!(g.offset_y, (target - g.scaled_height) / 2);
    }

    /// Property: preprocessing is a pure function
    #[test]
    fn to_tensor_is_pure(image in rgba_image(), target in 8u32..=48) {
        let (a, ga) = to_tensor(&image, target, &Normalization::UnitRange, [255, 255, 255]).unwrap();
        let (b, gb) = to_tensor(&image, target, &Normalization::UnitRange, [255, 255, 255]).unwrap();
        prop_assert_eq!(ga, gb);
        prop_assert_eq!(a.shape(), &[1, 3, target as usize, target as usize]);
        prop_assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
        prop_assert!(a.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    /// Property: decoding any raw plane, logits included, only rewrites alpha
    #[test]
    fn decode_mask_preserves_rgb(
        image in rgba_image(),
        raw in prop::collection::vec(-20.0f32..20.0, 32 * 32),
        refine in refine_params()
    ) {
        let geometry = LetterboxGeometry::fit(image.width(), image.height(), 32);
        let raw = Array2::from_shape_vec((32, 32), raw).unwrap();
        let out = decode_mask(&raw, &geometry, &image, &ContrastCurve::default(), refine).unwrap();
        prop_assert_eq!(out.dimensions(), image.dimensions());
        prop_assert!(same_rgb(&out, &image));
    }
}
