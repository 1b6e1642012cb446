//! The shipped configuration samples load and validate.

use std::path::Path;
use std::time::Duration;

use rbs_fixture::config::{CameraSource, FixtureConfig};
use rbs_fixture::hardware::camera::Rotation;
use rbs_fixture::plan::TestPlan;

fn sample(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join(name)
}

#[test]
fn fixture_sample_is_valid() {
    let config = FixtureConfig::load_from(sample("fixture.toml")).unwrap();
    config.validate().unwrap();

    assert_eq!(config.channels.motion.device.as_deref(), Some("/dev/ttyUSB0"));
    assert_eq!(config.channels.infrared.device, None);
    assert_eq!(config.cameras.len(), 2);
    assert!(matches!(config.cameras[0].source, CameraSource::File { .. }));
    assert_eq!(config.cameras[1].rotation, Rotation::Cw180);
    assert_eq!(config.motion.soft_reset, "\u{18}");
    assert_eq!(config.sequencer.run.park_settle, Duration::from_millis(3000));
    assert!(config.sequencer.homing.second_pass);
    assert_eq!(config.report.group_count, 4);
    assert_eq!(config.trigger.read_window, Duration::from_millis(10));
    assert!(!config.infrared.enabled);
}

#[test]
fn plan_sample_is_valid() {
    let plan = TestPlan::load(&sample("plan.toml")).unwrap();
    assert_eq!(plan.len(), 16);
    assert_eq!(
        plan.buttons[0].motion_command(0, &plan.command_template).unwrap(),
        "G90 X29.787 Y82.987"
    );
}
