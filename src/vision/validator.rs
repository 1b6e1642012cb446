//! Per-camera validation of live frames against reference images.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use rbs_core::{FixtureError, FixtureResult, Frame};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::process::{frame_to_image, process_image, rotate, DEFAULT_BLUR_SIGMA};
use super::reference::find_reference;
use super::similarity::{similarity, SimilarityWeights};
use crate::hardware::camera::Rotation;

/// Combined score a camera must reach for the button to pass on it.
///
/// Distinct from the group-level mean similarity threshold applied by the
/// report aggregator.
pub const BUTTON_APPROVAL_THRESHOLD: f64 = 0.75;

/// Outcome of validating one camera's frame for one button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// One-based camera index.
    pub camera: u8,
    /// Normalised cross-correlation.
    pub template_score: f64,
    /// Histogram correlation.
    pub histogram_score: f64,
    /// Weighted combination of both scores.
    pub combined_score: f64,
    /// Whether the combined score reached the threshold.
    #[serde(rename = "aprovado")]
    pub approved: bool,
    /// Reference image used, if one was found.
    pub reference_path: Option<PathBuf>,
    /// Whether a reference image was found and compared.
    #[serde(rename = "imagem_referencia_encontrada")]
    pub reference_found: bool,
    /// Why the camera could not be validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    /// Result for a camera that could not be compared.
    ///
    /// Neither approved nor rejected; excluded from rates.
    pub fn unvalidated(camera: u8, reference_path: Option<PathBuf>, reason: Option<String>) -> Self {
        Self {
            camera,
            template_score: 0.0,
            histogram_score: 0.0,
            combined_score: 0.0,
            approved: false,
            reference_path,
            reference_found: false,
            error: reason,
        }
    }
}

/// Compares live frames against reference images.
#[derive(Debug, Clone)]
pub struct ImageValidator {
    reference_dir: PathBuf,
    threshold: f64,
    weights: SimilarityWeights,
    blur_sigma: f32,
}

impl ImageValidator {
    /// Validator reading references from `reference_dir` with default
    /// threshold, weights and smoothing.
    pub fn new(reference_dir: impl Into<PathBuf>) -> Self {
        Self {
            reference_dir: reference_dir.into(),
            threshold: BUTTON_APPROVAL_THRESHOLD,
            weights: SimilarityWeights::default(),
            blur_sigma: DEFAULT_BLUR_SIGMA,
        }
    }

    /// Override the per-button threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Override the score weights.
    #[must_use]
    pub fn with_weights(mut self, weights: SimilarityWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Override the smoothing sigma.
    #[must_use]
    pub fn with_blur_sigma(mut self, sigma: f32) -> Self {
        self.blur_sigma = sigma;
        self
    }

    /// Directory references are read from.
    pub fn reference_dir(&self) -> &Path {
        &self.reference_dir
    }

    /// Validate `frame` from `camera` against the reference for the button.
    ///
    /// Never fails: a missing reference or an unreadable image is recorded
    /// in the result.
    pub fn validate(
        &self,
        frame: &Frame,
        rotation: Rotation,
        button_index: usize,
        button_name: &str,
        camera: u8,
    ) -> ValidationResult {
        let Some(reference_path) = find_reference(button_index, button_name, camera, &self.reference_dir) else {
            let missing = FixtureError::ReferenceMissing {
                button: button_index,
                camera,
            };
            debug!(button = button_name, camera, "{missing}");
            return ValidationResult::unvalidated(camera, None, None);
        };

        match self.compare(frame, rotation, &reference_path) {
            Ok((template, histogram, combined)) => {
                let approved = combined >= self.threshold;
                debug!(
                    button = button_name,
                    camera,
                    template,
                    histogram,
                    combined,
                    approved,
                    "frame validated"
                );
                ValidationResult {
                    camera,
                    template_score: template,
                    histogram_score: histogram,
                    combined_score: combined,
                    approved,
                    reference_path: Some(reference_path),
                    reference_found: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!(button = button_name, camera, error = %e, "validation failed");
                ValidationResult::unvalidated(camera, Some(reference_path), Some(e.to_string()))
            }
        }
    }

    fn compare(&self, frame: &Frame, rotation: Rotation, reference_path: &Path) -> FixtureResult<(f64, f64, f64)> {
        let live = rotate(frame_to_image(frame)?, rotation);
        let reference: DynamicImage = image::open(reference_path)
            .map_err(|e| FixtureError::Vision(format!("{}: {e}", reference_path.display())))?;

        let scores = similarity(
            &process_image(&live, self.blur_sigma),
            &process_image(&reference, self.blur_sigma),
            self.weights,
        );
        Ok((scores.template, scores.histogram, scores.combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::synthetic_pattern;
    use crate::vision::reference::reference_stem;

    fn save_reference(dir: &Path, button: usize, name: &str, camera: u8, seed: u32) {
        let image = frame_to_image(&synthetic_pattern(160, 120, seed)).unwrap();
        image
            .save(dir.join(format!("{}.png", reference_stem(button, name, camera))))
            .unwrap();
    }

    #[test]
    fn matching_frame_is_approved() {
        let dir = tempfile::tempdir().unwrap();
        save_reference(dir.path(), 0, "Power", 1, 7);

        let validator = ImageValidator::new(dir.path());
        let result = validator.validate(&synthetic_pattern(160, 120, 7), Rotation::None, 0, "Power", 1);
        assert!(result.reference_found);
        assert!(result.approved);
        assert!(result.combined_score > 0.99);
    }

    #[test]
    fn different_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_reference(dir.path(), 0, "Power", 1, 7);

        let validator = ImageValidator::new(dir.path());
        let result = validator.validate(&synthetic_pattern(160, 120, 2), Rotation::None, 0, "Power", 1);
        assert!(result.reference_found);
        assert!(!result.approved);
    }

    #[test]
    fn missing_reference_is_unvalidated() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ImageValidator::new(dir.path());
        let result = validator.validate(&synthetic_pattern(16, 16, 1), Rotation::None, 4, "Mute", 3);
        assert!(!result.reference_found);
        assert!(!result.approved);
        assert!(result.reference_path.is_none());
        assert!(result.error.is_none());
    }

    #[test]
    fn unreadable_reference_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("btn01_power_cam1.png"), b"not a png").unwrap();
        let validator = ImageValidator::new(dir.path());
        let result = validator.validate(&synthetic_pattern(16, 16, 1), Rotation::None, 0, "power", 1);
        assert!(!result.reference_found);
        assert!(result.error.is_some());
        assert!(result.reference_path.is_some());
    }

    #[test]
    fn serializes_dashboard_field_names() {
        let result = ValidationResult::unvalidated(2, None, None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["imagem_referencia_encontrada"], false);
        assert_eq!(json["aprovado"], false);
    }
}
