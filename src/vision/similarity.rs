//! Similarity scores between a live frame and its reference.

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Weights of the two scores in the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    /// Weight of the normalised cross-correlation.
    pub template: f64,
    /// Weight of the histogram correlation.
    pub histogram: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            template: 0.7,
            histogram: 0.3,
        }
    }
}

/// Scores for one comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityScores {
    /// Normalised cross-correlation, clamped to `>= 0`.
    pub template: f64,
    /// Correlation of the 256-bin intensity histograms.
    pub histogram: f64,
    /// Weighted combination.
    pub combined: f64,
}

/// Compare two normalised frames. The reference is resized to the test
/// frame's dimensions when they differ.
pub fn similarity(test: &GrayImage, reference: &GrayImage, weights: SimilarityWeights) -> SimilarityScores {
    let resized;
    let reference = if reference.dimensions() == test.dimensions() {
        reference
    } else {
        resized = imageops::resize(reference, test.width(), test.height(), FilterType::Triangle);
        &resized
    };

    let template = template_score(test, reference);
    let histogram = histogram_score(test, reference);
    SimilarityScores {
        template,
        histogram,
        combined: weights.template * template + weights.histogram * histogram,
    }
}

/// Zero-mean normalised cross-correlation of two equally sized images,
/// clamped to `[0, 1]`.
pub fn template_score(a: &GrayImage, b: &GrayImage) -> f64 {
    let xs: Vec<f64> = a.pixels().map(|p| f64::from(p.0[0])).collect();
    let ys: Vec<f64> = b.pixels().map(|p| f64::from(p.0[0])).collect();
    pearson(&xs, &ys).clamp(0.0, 1.0)
}

/// Intensity histogram normalised to sum to one.
pub fn histogram(image: &GrayImage) -> [f64; 256] {
    let mut bins = [0f64; 256];
    for pixel in image.pixels() {
        bins[usize::from(pixel.0[0])] += 1.0;
    }
    let total: f64 = bins.iter().sum();
    if total > 0.0 {
        for bin in &mut bins {
            *bin /= total;
        }
    }
    bins
}

/// Correlation between the two images' histograms, in `[-1, 1]`.
pub fn histogram_score(a: &GrayImage, b: &GrayImage) -> f64 {
    pearson(&histogram(a), &histogram(b))
}

/// Pearson correlation. Two constant series correlate perfectly when equal
/// and not at all otherwise.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return 0.0;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        let equal = xs[..n].iter().zip(&ys[..n]).all(|(x, y)| (x - y).abs() <= f64::EPSILON);
        return if equal { 1.0 } else { 0.0 };
    }
    (cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::synthetic_pattern;
    use crate::vision::process::{frame_to_image, process_image, DEFAULT_BLUR_SIGMA};
    use image::{ImageBuffer, Luma};

    fn processed(seed: u32) -> GrayImage {
        let image = frame_to_image(&synthetic_pattern(160, 120, seed)).unwrap();
        process_image(&image, DEFAULT_BLUR_SIGMA)
    }

    #[test]
    fn frame_compared_to_itself_scores_one() {
        let img = processed(1);
        let scores = similarity(&img, &img, SimilarityWeights::default());
        assert!((scores.template - 1.0).abs() < 1e-9);
        assert!((scores.histogram - 1.0).abs() < 1e-9);
        assert!((scores.combined - 1.0).abs() < 1e-9);
    }

    #[test]
    fn different_frames_score_lower() {
        let scores = similarity(&processed(1), &processed(2), SimilarityWeights::default());
        assert!(scores.combined < 0.95, "combined {}", scores.combined);
        assert!(scores.template >= 0.0);
    }

    #[test]
    fn inverted_image_clamps_template_to_zero() {
        let a = ImageBuffer::from_fn(32, 32, |x, _| Luma([(x * 8) as u8]));
        let b = ImageBuffer::from_fn(32, 32, |x, _| Luma([255 - (x * 8) as u8]));
        assert_eq!(template_score(&a, &b), 0.0);
    }

    #[test]
    fn reference_is_resized_to_match() {
        let test = processed(3);
        let small = imageops::resize(&test, 320, 240, FilterType::Triangle);
        let scores = similarity(&test, &small, SimilarityWeights::default());
        assert!(scores.template > 0.9);
    }

    #[test]
    fn flat_images_compare_by_equality() {
        let gray = GrayImage::from_pixel(8, 8, Luma([90]));
        let other = GrayImage::from_pixel(8, 8, Luma([10]));
        assert_eq!(template_score(&gray, &gray), 1.0);
        assert_eq!(template_score(&gray, &other), 0.0);
    }

    #[test]
    fn histogram_sums_to_one() {
        let sum: f64 = histogram(&processed(4)).iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
