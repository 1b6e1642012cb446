//! Frame normalisation.
//!
//! Every frame is brought to the same 640x480 grayscale, lightly smoothed,
//! min-max stretched form before comparison, so exposure drift between the
//! reference capture and the live capture does not dominate the score.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};
use rbs_core::{FixtureError, FixtureResult, Frame, PixelFormat};

use crate::hardware::camera::Rotation;

/// Width of a normalised frame.
pub const PROCESS_WIDTH: u32 = 640;
/// Height of a normalised frame.
pub const PROCESS_HEIGHT: u32 = 480;
/// Default Gaussian sigma (matches a 5x5 kernel).
pub const DEFAULT_BLUR_SIGMA: f32 = 1.1;

/// Convert a camera frame into an `image` buffer.
pub fn frame_to_image(frame: &Frame) -> FixtureResult<DynamicImage> {
    if !frame.is_consistent() {
        return Err(FixtureError::Vision(format!(
            "frame buffer of {} bytes does not match {}x{} {:?}",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.format
        )));
    }
    let image = match frame.format {
        PixelFormat::Gray8 => GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
            .map(DynamicImage::ImageLuma8),
        PixelFormat::Rgb8 => RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .map(DynamicImage::ImageRgb8),
    };
    image.ok_or_else(|| FixtureError::Vision("frame buffer rejected by decoder".to_string()))
}

/// Convert a decoded image into a camera frame.
pub fn image_to_frame(image: &DynamicImage) -> Frame {
    match image {
        DynamicImage::ImageLuma8(gray) => Frame::gray(gray.width(), gray.height(), gray.as_raw().clone()),
        other => {
            let rgb = other.to_rgb8();
            Frame::rgb(rgb.width(), rgb.height(), rgb.into_raw())
        }
    }
}

/// Apply a camera's configured rotation.
pub fn rotate(image: DynamicImage, rotation: Rotation) -> DynamicImage {
    match rotation {
        Rotation::None => image,
        Rotation::Cw90 => image.rotate90(),
        Rotation::Cw180 => image.rotate180(),
        Rotation::Cw270 => image.rotate270(),
    }
}

/// Resize to 640x480, convert to grayscale, smooth, stretch to 0..=255.
///
/// Pure function of its input. Running it on its own output changes the
/// result only by the extra smoothing pass.
pub fn process_image(image: &DynamicImage, sigma: f32) -> GrayImage {
    let gray = if image.width() == PROCESS_WIDTH && image.height() == PROCESS_HEIGHT {
        image.to_luma8()
    } else {
        image
            .resize_exact(PROCESS_WIDTH, PROCESS_HEIGHT, FilterType::Triangle)
            .to_luma8()
    };
    let smoothed = if sigma > 0.0 {
        imageops::blur(&gray, sigma)
    } else {
        gray
    };
    normalize_min_max(&smoothed)
}

/// Linearly stretch intensities so the darkest pixel is 0 and the brightest
/// 255. A flat image is returned unchanged.
pub fn normalize_min_max(image: &GrayImage) -> GrayImage {
    let (min, max) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if max <= min {
        return image.clone();
    }
    let span = f32::from(max - min);
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let v = f32::from(image.get_pixel(x, y).0[0] - min);
        Luma([(v * 255.0 / span).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::synthetic_pattern;

    fn horizontal_gradient() -> DynamicImage {
        let img = ImageBuffer::from_fn(PROCESS_WIDTH, PROCESS_HEIGHT, |x, _| {
            Luma([((x * 255) / (PROCESS_WIDTH - 1)) as u8])
        });
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn output_has_fixed_geometry_and_full_range() {
        let frame = synthetic_pattern(200, 100, 2);
        let processed = process_image(&frame_to_image(&frame).unwrap(), DEFAULT_BLUR_SIGMA);
        assert_eq!(processed.dimensions(), (PROCESS_WIDTH, PROCESS_HEIGHT));
        let min = processed.pixels().map(|p| p.0[0]).min().unwrap();
        let max = processed.pixels().map(|p| p.0[0]).max().unwrap();
        assert_eq!((min, max), (0, 255));
    }

    #[test]
    fn processing_is_idempotent_on_normalized_frames() {
        let once = process_image(&horizontal_gradient(), DEFAULT_BLUR_SIGMA);
        let twice = process_image(&DynamicImage::ImageLuma8(once.clone()), DEFAULT_BLUR_SIGMA);

        let total: u64 = once
            .pixels()
            .zip(twice.pixels())
            .map(|(a, b)| u64::from(a.0[0].abs_diff(b.0[0])))
            .sum();
        let mean = total as f64 / f64::from(PROCESS_WIDTH * PROCESS_HEIGHT);
        assert!(mean < 1.0, "mean abs difference {mean}");
    }

    #[test]
    fn processing_is_deterministic() {
        let image = frame_to_image(&synthetic_pattern(64, 48, 5)).unwrap();
        assert_eq!(process_image(&image, 1.1), process_image(&image, 1.1));
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let image = frame_to_image(&synthetic_pattern(40, 20, 1)).unwrap();
        let rotated = rotate(image, Rotation::Cw90);
        assert_eq!((rotated.width(), rotated.height()), (20, 40));
    }

    #[test]
    fn inconsistent_frames_are_rejected() {
        let frame = Frame::rgb(10, 10, vec![0; 10]);
        assert!(frame_to_image(&frame).is_err());
    }

    #[test]
    fn frame_round_trips_through_image() {
        let frame = synthetic_pattern(12, 8, 3);
        let back = image_to_frame(&frame_to_image(&frame).unwrap());
        assert_eq!(back.data, frame.data);
    }
}
