//! Fixture configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/fixture.toml` (or an explicit path)
//! 2. environment variables prefixed `RBS_`, nested with `__`
//!
//! Every section has defaults, so an empty file describes a fixture with no
//! channels, no cameras and the production timings.
//!
//! ```no_run
//! use rbs_fixture::config::FixtureConfig;
//!
//! let config = FixtureConfig::load()?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! `RBS_CHANNELS__MOTION__DEVICE=/dev/ttyUSB1` overrides
//! `[channels.motion] device`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::hardware::camera::{CameraSettings, Rotation};
use crate::hardware::dispatcher::MotionProtocol;
use crate::report::GroupPolicy;
use crate::sequencer::engine::millis;
use crate::sequencer::{Homing, SequencerSettings};
use crate::trigger::TriggerSettings;
use crate::vision::similarity::SimilarityWeights;
use crate::vision::BUTTON_APPROVAL_THRESHOLD;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fixture.toml";

/// Environment prefix.
pub const ENV_PREFIX: &str = "RBS_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Directories.
    pub storage: StorageConfig,
    /// Serial channels.
    pub channels: ChannelsConfig,
    /// Registered cameras.
    pub cameras: Vec<CameraConfig>,
    /// Acquisition timing shared by all cameras.
    pub camera: CameraTiming,
    /// Run loop.
    pub sequencer: SequencerConfig,
    /// Motion controller vocabulary.
    pub motion: MotionConfig,
    /// Per-button validation.
    pub validation: ValidationConfig,
    /// Group verdicts.
    pub report: GroupPolicy,
    /// Infrared capture.
    pub infrared: InfraredConfig,
    /// Physical trigger.
    pub trigger: TriggerSettings,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured.
    #[default]
    Pretty,
    /// Single line, no colour.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Logging format.
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "RBS Fixture".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Directory layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of run directories.
    pub output_dir: PathBuf,
    /// Latest-frame area, cleared at every run start.
    pub scratch_dir: PathBuf,
    /// Read-only reference images.
    pub reference_dir: PathBuf,
    /// Test plan file.
    pub plan_file: PathBuf,
}

impl StorageConfig {
    /// File holding operator camera rotations.
    pub fn rotation_file(&self) -> PathBuf {
        self.output_dir.join("camera_rotation.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            scratch_dir: PathBuf::from("data/scratch"),
            reference_dir: PathBuf::from("references"),
            plan_file: PathBuf::from("config/plan.toml"),
        }
    }
}

/// One serial channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Device path; the channel stays closed without one.
    pub device: Option<String>,
    /// Baud rate.
    pub baud: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device: None,
            baud: 115_200,
        }
    }
}

/// The serial channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Motion controller.
    pub motion: ChannelConfig,
    /// Relay / actuator controller.
    pub relay: ChannelConfig,
    /// Directly attached infrared receiver.
    pub infrared: ChannelConfig,
    /// Bound on a single write.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            motion: ChannelConfig::default(),
            relay: ChannelConfig::default(),
            infrared: ChannelConfig::default(),
            write_timeout: Duration::from_millis(2000),
        }
    }
}

/// Where a camera's frames come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CameraSource {
    /// Snapshot file kept current by an external grabber.
    File {
        /// Snapshot path.
        path: PathBuf,
    },
    /// Local camera device (needs the `camera_device` feature).
    Device {
        /// Zero-based device index, as the OS lists them.
        index: u32,
    },
    /// Generated test pattern.
    Synthetic {
        /// Pattern seed.
        seed: u32,
    },
    /// A camera that never opens.
    Offline,
}

/// One registered camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// One-based camera index.
    pub index: u8,
    /// Frame source.
    pub source: CameraSource,
    /// Initial rotation in degrees.
    #[serde(default)]
    pub rotation: Rotation,
}

/// Camera acquisition timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraTiming {
    /// Attempts before a camera is reported degraded.
    pub reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    #[serde(with = "millis")]
    pub reconnect_backoff: Duration,
    /// Minimum delay between reads.
    #[serde(with = "millis")]
    pub frame_interval: Duration,
    /// Bound on joining an acquisition thread.
    #[serde(with = "millis")]
    pub stop_timeout: Duration,
}

impl Default for CameraTiming {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(2000),
            frame_interval: Duration::from_millis(33),
            stop_timeout: Duration::from_millis(2000),
        }
    }
}

impl CameraTiming {
    /// Settings for one camera with `rotation`.
    pub fn settings(&self, rotation: Rotation) -> CameraSettings {
        CameraSettings {
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: self.reconnect_backoff,
            frame_interval: self.frame_interval,
            stop_timeout: self.stop_timeout,
            rotation,
        }
    }
}

/// Run loop plus homing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Loop timings and tokens.
    #[serde(flatten)]
    pub run: SequencerSettings,
    /// Camera stage homing.
    pub homing: Homing,
}

/// Motion controller vocabulary.
pub type MotionConfig = MotionProtocol;

/// Per-button validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Combined score a camera must reach.
    pub threshold: f64,
    /// Template score weight.
    pub template_weight: f64,
    /// Histogram score weight.
    pub histogram_weight: f64,
    /// Gaussian smoothing sigma.
    pub blur_sigma: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        let weights = SimilarityWeights::default();
        Self {
            threshold: BUTTON_APPROVAL_THRESHOLD,
            template_weight: weights.template,
            histogram_weight: weights.histogram,
            blur_sigma: crate::vision::process::DEFAULT_BLUR_SIGMA,
        }
    }
}

/// Infrared backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraredBackend {
    /// Receiver service over HTTP.
    #[default]
    Http,
    /// Receiver on the infrared serial channel.
    Serial,
}

/// Infrared capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraredConfig {
    /// Capture on every button.
    pub enabled: bool,
    /// Backend.
    pub backend: InfraredBackend,
    /// Receiver service URL.
    pub base_url: String,
    /// Receiver identifier.
    pub target: String,
    /// Capture window requested from the receiver.
    #[serde(with = "millis")]
    pub capture_timeout: Duration,
    /// How long a button waits for the capture after validation.
    #[serde(with = "millis")]
    pub join_timeout: Duration,
    /// Known-good codes, one hex code per line.
    pub known_codes: Option<PathBuf>,
}

impl Default for InfraredConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: InfraredBackend::Http,
            base_url: "http://localhost:3001".to_string(),
            target: "nano1".to_string(),
            capture_timeout: Duration::from_millis(10_000),
            join_timeout: Duration::from_millis(2_000),
            known_codes: None,
        }
    }
}

impl FixtureConfig {
    /// Load from `config/fixture.toml` and `RBS_` environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// Provider chain, exposed for inspection.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_ascii_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            ));
        }

        if self.report.group_count == 0 {
            return Err("report.group_count must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.report.approval_rate) || !(0.0..=1.0).contains(&self.report.similarity_threshold) {
            return Err("report thresholds must be within 0..=1".to_string());
        }
        if !(0.0..=1.0).contains(&self.validation.threshold) {
            return Err(format!("validation.threshold {} must be within 0..=1", self.validation.threshold));
        }

        let storage = &self.storage;
        if storage.reference_dir.starts_with(&storage.scratch_dir)
            || storage.scratch_dir.starts_with(&storage.reference_dir)
        {
            return Err(format!(
                "storage.scratch_dir {} must not overlap storage.reference_dir {}",
                storage.scratch_dir.display(),
                storage.reference_dir.display()
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.index == 0 {
                return Err("camera indices are one-based".to_string());
            }
            if !seen.insert(camera.index) {
                return Err(format!("Duplicate camera index: {}", camera.index));
            }
        }

        if self.infrared.enabled && self.infrared.backend == InfraredBackend::Serial && self.channels.infrared.device.is_none() {
            return Err("infrared.backend = \"serial\" requires channels.infrared.device".to_string());
        }
        Ok(())
    }

    /// Validation weights as used by the image validator.
    pub fn similarity_weights(&self) -> SimilarityWeights {
        SimilarityWeights {
            template: self.validation.template_weight,
            histogram: self.validation.histogram_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::FixtureSide;
    use figment::Jail;

    #[test]
    fn empty_file_gives_production_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("fixture.toml", "")?;
            let config = FixtureConfig::load_from("fixture.toml")?;
            assert!(config.validate().is_ok());
            assert_eq!(config.report.group_count, 4);
            assert_eq!(config.channels.motion.baud, 115_200);
            assert_eq!(config.camera.reconnect_backoff, Duration::from_secs(2));
            assert_eq!(config.trigger.token, "start");
            assert_eq!(config.validation.threshold, 0.75);
            assert_eq!(config.report.similarity_threshold, 0.70);
            assert_eq!(config.motion.unlock, "$X");
            Ok(())
        });
    }

    #[test]
    fn file_and_environment_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "fixture.toml",
                r#"
                [application]
                log_level = "debug"
                log_format = "json"

                [channels.motion]
                device = "/dev/ttyUSB0"

                [[cameras]]
                index = 1
                rotation = 90
                source = { kind = "file", path = "snap1.png" }

                [[cameras]]
                index = 2
                source = { kind = "offline" }

                [[cameras]]
                index = 3
                rotation = 180
                source = { kind = "device", index = 0 }

                [sequencer]
                side = 2
                press_hold = 250

                [sequencer.homing]
                second_pass = false
                "#,
            )?;
            jail.set_env("RBS_CHANNELS__RELAY__DEVICE", "/dev/ttyACM0");
            jail.set_env("RBS_TRIGGER__TOKEN", "go");

            let config = FixtureConfig::load_from("fixture.toml")?;
            assert_eq!(config.application.log_format, LogFormat::Json);
            assert_eq!(config.channels.motion.device.as_deref(), Some("/dev/ttyUSB0"));
            assert_eq!(config.channels.relay.device.as_deref(), Some("/dev/ttyACM0"));
            assert_eq!(config.trigger.token, "go");
            assert_eq!(config.cameras.len(), 3);
            assert_eq!(config.cameras[2].source, CameraSource::Device { index: 0 });
            assert_eq!(config.cameras[0].rotation, Rotation::Cw90);
            assert_eq!(config.cameras[1].source, CameraSource::Offline);
            assert_eq!(config.sequencer.run.side, FixtureSide::Two);
            assert_eq!(config.sequencer.run.press_hold, Duration::from_millis(250));
            assert!(!config.sequencer.homing.second_pass);
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = FixtureConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = FixtureConfig::default();
        config.storage.scratch_dir = PathBuf::from("refs");
        config.storage.reference_dir = PathBuf::from("refs/golden");
        assert!(config.validate().is_err());

        let mut config = FixtureConfig::default();
        config.storage.scratch_dir = PathBuf::from("references/latest");
        assert!(config.validate().is_err());

        let mut config = FixtureConfig::default();
        config.report.group_count = 0;
        assert!(config.validate().is_err());

        let mut config = FixtureConfig::default();
        config.cameras = vec![
            CameraConfig {
                index: 1,
                source: CameraSource::Offline,
                rotation: Rotation::None,
            },
            CameraConfig {
                index: 1,
                source: CameraSource::Synthetic { seed: 1 },
                rotation: Rotation::None,
            },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_side_and_rotation_fail_to_parse() {
        Jail::expect_with(|jail| {
            jail.create_file("side.toml", "[sequencer]\nside = 3\n")?;
            assert!(FixtureConfig::load_from("side.toml").is_err());
            jail.create_file(
                "rot.toml",
                "[[cameras]]\nindex = 1\nrotation = 45\nsource = { kind = \"offline\" }\n",
            )?;
            assert!(FixtureConfig::load_from("rot.toml").is_err());
            Ok(())
        });
    }
}
