//! On-disk artifacts of a run.
//!
//! ```text
//! <output_dir>/runs/run_0003_20261019_142501/
//!     btn01_power_cam1.png
//!     btn01_power_cam2.png
//!     ...
//!     report.json
//! <scratch_dir>/IMAGEM_1.png      latest frame per camera
//! ```
//!
//! The scratch area is cleared at the start of every run. The reference
//! directory is never written to and must not overlap the scratch area.

use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use image::ImageFormat;
use rbs_core::{FixtureError, FixtureResult, Frame};
use tracing::{debug, info, warn};

use super::RunReport;
use crate::hardware::camera::Rotation;
use crate::vision::process::{frame_to_image, rotate};
use crate::vision::reference::reference_stem;

/// File name of the persisted report inside a run directory.
pub const REPORT_FILE: &str = "report.json";

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Writes run directories, frames and reports.
#[derive(Debug, Clone)]
pub struct RunArchive {
    output_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl RunArchive {
    /// Archive rooted at `output_dir` using `scratch_dir` for the latest
    /// frames.
    ///
    /// Fails if the scratch area and `reference_dir` are the same directory
    /// or one contains the other.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        reference_dir: &Path,
    ) -> FixtureResult<Self> {
        let scratch_dir = scratch_dir.into();
        if overlaps(&scratch_dir, reference_dir) {
            return Err(FixtureError::Configuration(format!(
                "scratch directory {} overlaps reference directory {}",
                scratch_dir.display(),
                reference_dir.display()
            )));
        }
        Ok(Self {
            output_dir: output_dir.into(),
            scratch_dir,
        })
    }

    /// Root of all run directories.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Scratch directory holding the latest frame per camera.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Delete the previous run's images from the scratch area.
    ///
    /// Only image files directly inside the scratch directory are removed.
    pub fn clear_scratch(&self) -> FixtureResult<usize> {
        fs::create_dir_all(&self.scratch_dir)?;
        let mut removed = 0;
        for entry in fs::read_dir(&self.scratch_dir)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch image"),
                }
            }
        }
        debug!(removed, dir = %self.scratch_dir.display(), "scratch area cleared");
        Ok(removed)
    }

    /// Create the directory for run `run_index`.
    pub fn begin_run(&self, run_index: u64, started_at: DateTime<Utc>) -> FixtureResult<PathBuf> {
        let dir = self
            .output_dir
            .join("runs")
            .join(format!("run_{run_index:04}_{}", started_at.format("%Y%m%d_%H%M%S")));
        fs::create_dir_all(&dir)?;
        info!(run = run_index, dir = %dir.display(), "run directory created");
        Ok(dir)
    }

    /// Save a captured frame into `run_dir` and mirror it to the scratch
    /// area.
    ///
    /// Frames use the reference naming convention so a known-good capture
    /// can be promoted to a reference by copying it.
    pub fn save_frame(
        &self,
        run_dir: &Path,
        button_index: usize,
        button_name: &str,
        camera: u8,
        frame: &Frame,
        rotation: Rotation,
    ) -> FixtureResult<PathBuf> {
        let image = rotate(frame_to_image(frame)?, rotation);
        let path = run_dir.join(format!("{}.png", reference_stem(button_index, button_name, camera)));
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| FixtureError::Vision(format!("{}: {e}", path.display())))?;

        let mirror = self.scratch_dir.join(format!("IMAGEM_{camera}.png"));
        if let Err(e) = fs::create_dir_all(&self.scratch_dir)
            .map_err(FixtureError::from)
            .and_then(|()| {
                image
                    .save_with_format(&mirror, ImageFormat::Png)
                    .map_err(|e| FixtureError::Vision(e.to_string()))
            })
        {
            warn!(camera, error = %e, "failed to mirror frame to scratch area");
        }
        Ok(path)
    }

    /// Write `report` as pretty JSON into its run directory.
    pub fn persist(&self, report: &RunReport) -> FixtureResult<PathBuf> {
        let dir = &report.metadata.photo_dir;
        fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(report).map_err(|e| FixtureError::Serialization(e.to_string()))?;
        fs::write(&path, json)?;
        info!(
            run = report.metadata.run_index,
            path = %path.display(),
            summary = %report.summary.text,
            "run report persisted"
        );
        Ok(path)
    }

    /// Read a persisted report back.
    pub fn load(path: &Path) -> FixtureResult<RunReport> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| FixtureError::Serialization(e.to_string()))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn overlaps(scratch: &Path, reference: &Path) -> bool {
    let scratch = normalize(scratch);
    let reference = normalize(reference);
    reference.starts_with(&scratch) || scratch.starts_with(&reference)
}

/// Absolute path with `.` and `..` folded and symlinks resolved on the part
/// that already exists.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = fs::canonicalize(existing).unwrap_or_else(|_| existing.to_path_buf());
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}
