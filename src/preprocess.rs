use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::prelude::*;
use ndarray::Zip;
use nshare::AsNdarray3;

use crate::config::Normalization;
use crate::errors::{CutoutError, Result};
use crate::types::Image;

/// Placement of the resized image inside the square network canvas.
///
/// Recorded by [`to_tensor`] so the mask can be mapped back later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LetterboxGeometry {
    pub target_size: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl LetterboxGeometry {
    /// Uniform fit of `width`×`height` into a `target_size` square, centred.
    pub fn fit(width: u32, height: u32, target_size: u32) -> Self {
        let scale = (target_size as f64 / width as f64).min(target_size as f64 / height as f64);
        let scaled_width = ((width as f64 * scale).round() as u32).clamp(1, target_size);
        let scaled_height = ((height as f64 * scale).round() as u32).clamp(1, target_size);
        Self {
            target_size,
            offset_x: (target_size - scaled_width) / 2,
            offset_y: (target_size - scaled_height) / 2,
            scaled_width,
            scaled_height,
            source_width: width,
            source_height: height,
        }
    }

    /// Number of elements in one spatial plane of the network output.
    pub const fn plane_len(&self) -> usize {
        self.target_size as usize * self.target_size as usize
    }
}

/// Maps an RGBA image into the network's NCHW float tensor.
///
/// The image is composited over `pad_color` (so transparent input pixels read
/// as padding), resized with bilinear filtering to fit, and centred on a
/// `target_size` square filled with `pad_color`. Pure and deterministic.
pub fn to_tensor(
    image: &Image,
    target_size: u32,
    normalization: &Normalization,
    pad_color: [u8; 3],
) -> Result<(Array4<f32>, LetterboxGeometry)> {
    if target_size == 0 {
        return Err(CutoutError::configuration("target_size must be >= 1"));
    }
    let geometry = LetterboxGeometry::fit(image.width(), image.height(), target_size);

    let rgb = flatten_over(image, pad_color);
    let resized = imageops::resize(
        &rgb,
        geometry.scaled_width,
        geometry.scaled_height,
        FilterType::Triangle,
    );
    let mut canvas = RgbImage::from_pixel(target_size, target_size, Rgb(pad_color));
    imageops::replace(
        &mut canvas,
        &resized,
        i64::from(geometry.offset_x),
        i64::from(geometry.offset_y),
    );

    // (C, H, W) view over the canvas bytes
    let chw = canvas.as_ndarray3();
    let mut tensor = Array4::<f32>::zeros((1, 3, target_size as usize, target_size as usize));
    for (c, plane) in chw.outer_iter().enumerate() {
        Zip::from(tensor.slice_mut(s![0, c, .., ..]))
            .and(&plane)
            .for_each(|dst, &src| *dst = normalization.apply(c, src));
    }

    Ok((tensor, geometry))
}

/// Drops the alpha channel by compositing over a solid background.
fn flatten_over(image: &Image, background: [u8; 3]) -> RgbImage {
    let mut rgb = RgbImage::new(image.width(), image.height());
    for (dst, src) in rgb.pixels_mut().zip(image.pixels().chunks_exact(4)) {
        let alpha = u32::from(src[3]);
        for c in 0..3 {
            let v = u32::from(src[c]) * alpha + u32::from(background[c]) * (255 - alpha);
            dst.0[c] = ((v + 127) / 255) as u8;
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Image {
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[(x * 7) as u8, (y * 11) as u8, ((x + y) * 3) as u8, 255]);
            }
        }
        Image::new(width, height, pixels).unwrap()
    }

    #[test]
    fn test_square_input_has_no_padding() {
        let geometry = LetterboxGeometry::fit(640, 640, 320);
        assert_eq!((geometry.offset_x, geometry.offset_y), (0, 0));
        assert_eq!((geometry.scaled_width, geometry.scaled_height), (320, 320));
    }

    #[test]
    fn test_landscape_is_centred_vertically() {
        let geometry = LetterboxGeometry::fit(200, 100, 320);
        assert_eq!(geometry.scaled_width, 320);
        assert_eq!(geometry.scaled_height, 160);
        assert_eq!(geometry.offset_x, 0);
        assert_eq!(geometry.offset_y, 80);
    }

    #[test]
    fn test_extreme_aspect_keeps_one_pixel() {
        let geometry = LetterboxGeometry::fit(10_000, 1, 320);
        assert_eq!(geometry.scaled_height, 1);
        assert_eq!(geometry.scaled_width, 320);
    }

    #[test]
    fn test_to_tensor_is_deterministic() -> Result<()> {
        let image = gradient(37, 23);
        let (a, ga) = to_tensor(&image, 64, &Normalization::UnitRange, [255, 255, 255])?;
        let (b, gb) = to_tensor(&image, 64, &Normalization::UnitRange, [255, 255, 255])?;
        assert_eq!(ga, gb);
        assert_eq!(a.shape(), &[1, 3, 64, 64]);
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
        Ok(())
    }

    #[test]
    fn test_padding_uses_fill_colour() -> Result<()> {
        let image = Image::from_pixel(8, 4, [0, 0, 0, 255])?;
        let (tensor, geometry) = to_tensor(&image, 16, &Normalization::UnitRange, [255, 255, 255])?;
        assert_eq!(geometry.offset_y, 4);
        // margin rows are white, content rows are black
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 2, 15, 15]], 1.0);
        assert_eq!(tensor[[0, 1, 8, 8]], 0.0);
        Ok(())
    }

    #[test]
    fn test_mean_std_normalization_range() -> Result<()> {
        let image = gradient(16, 16);
        let norm = Normalization::MeanStd {
            mean: [0.5; 3],
            std: [0.5; 3],
        };
        let (tensor, _) = to_tensor(&image, 16, &norm, [255, 255, 255])?;
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn test_transparent_pixels_read_as_padding() -> Result<()> {
        let image = Image::from_pixel(4, 4, [0, 0, 0, 0])?;
        let (tensor, _) = to_tensor(&image, 4, &Normalization::UnitRange, [255, 255, 255])?;
        assert!(tensor.iter().all(|v| *v == 1.0));
        Ok(())
    }
}
