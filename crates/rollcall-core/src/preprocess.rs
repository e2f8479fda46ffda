//! Face crop preprocessing.
//!
//! Turns a detected face region into the fixed-size CHW tensor the
//! classifier's backbone expects: crop, resize to 224×224, scale each
//! RGB channel to [-1, 1]. Deterministic, and the source image is only
//! ever borrowed immutably.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array3;

use crate::backbone::INPUT_SIZE;
use crate::types::FaceBox;

// MobileNet-style normalization: x / 127.5 - 1.
const PIXEL_SCALE: f32 = 127.5;

/// Crop `face` out of `image` and produce the classifier input tensor,
/// shape `(3, 224, 224)`, RGB channel order, values in [-1, 1].
///
/// The box is clamped to the image bounds; a box that degenerates to
/// zero area after clamping yields a black (all `-1`) tensor.
pub fn extract_face(image: &DynamicImage, face: &FaceBox) -> Array3<f32> {
    let (img_w, img_h) = image.dimensions();

    let x = face.x.max(0.0).min(img_w.saturating_sub(1) as f32) as u32;
    let y = face.y.max(0.0).min(img_h.saturating_sub(1) as f32) as u32;
    let w = (face.width.max(0.0) as u32).min(img_w - x).max(1);
    let h = (face.height.max(0.0) as u32).min(img_h - y).max(1);

    let crop = image.crop_imm(x, y, w, h);
    let resized = crop
        .resize_exact(INPUT_SIZE as u32, INPUT_SIZE as u32, FilterType::Triangle)
        .to_rgb8();

    let mut tensor = Array3::from_elem((3, INPUT_SIZE, INPUT_SIZE), -1.0f32);
    for (px, py, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[c, py as usize, px as usize]] = pixel[c] as f32 / PIXEL_SCALE - 1.0;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid_image(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([value, value, value])))
    }

    fn full_box(w: u32, h: u32) -> FaceBox {
        FaceBox {
            x: 0.0,
            y: 0.0,
            width: w as f32,
            height: h as f32,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_output_shape() {
        let img = solid_image(100, 80, 128);
        let tensor = extract_face(&img, &full_box(100, 80));
        assert_eq!(tensor.shape(), &[3, INPUT_SIZE, INPUT_SIZE]);
    }

    #[test]
    fn test_normalization_range() {
        // 255 maps to 1.0, 0 maps to -1.0.
        let bright = extract_face(&solid_image(50, 50, 255), &full_box(50, 50));
        assert!((bright[[0, 0, 0]] - 1.0).abs() < 1e-5);

        let dark = extract_face(&solid_image(50, 50, 0), &full_box(50, 50));
        assert!((dark[[2, 100, 100]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_deterministic() {
        let img = solid_image(64, 64, 90);
        let face = FaceBox {
            x: 10.0,
            y: 10.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.9,
        };
        let a = extract_face(&img, &face);
        let b = extract_face(&img, &face);
        assert_eq!(a, b);
    }

    #[test]
    fn test_box_clamped_to_bounds() {
        let img = solid_image(30, 30, 128);
        let face = FaceBox {
            x: -10.0,
            y: 25.0,
            width: 100.0,
            height: 100.0,
            confidence: 0.5,
        };
        // Must not panic; produces a valid tensor from the clamped region.
        let tensor = extract_face(&img, &face);
        assert_eq!(tensor.shape(), &[3, INPUT_SIZE, INPUT_SIZE]);
        assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_source_unchanged() {
        let img = solid_image(40, 40, 77);
        let before = img.clone();
        let _ = extract_face(&img, &full_box(40, 40));
        assert_eq!(img.as_bytes(), before.as_bytes());
    }
}
