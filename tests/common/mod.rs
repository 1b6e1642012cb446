//! Shared fixture harness for integration tests.
//!
//! Builds a [`Controller`] over temporary directories, simulated motion and
//! relay controllers and synthetic cameras, with every loop delay zeroed so
//! a run completes quickly.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rbs_fixture::config::FixtureConfig;
use rbs_fixture::controller::Controller;
use rbs_fixture::hardware::camera::{CameraManager, CameraSettings, Rotation};
use rbs_fixture::hardware::infrared::InfraredCapture;
use rbs_fixture::hardware::mock::{synthetic_pattern, MockController, MockControllerOptions, SyntheticFrameSource};
use rbs_fixture::plan::{ButtonTarget, TestPlan};
use rbs_fixture::vision::process::frame_to_image;
use rbs_fixture::vision::reference::reference_stem;
use rbs_fixture::ChannelRole;
use tempfile::TempDir;

/// Frame size of the synthetic cameras.
pub const WIDTH: u32 = 96;
/// Frame size of the synthetic cameras.
pub const HEIGHT: u32 = 72;

/// How a simulated camera behaves.
#[derive(Debug, Clone, Copy)]
pub enum CameraSpec {
    /// Always delivers the pattern for `seed`.
    Live(u32),
    /// Never opens.
    Offline,
}

/// Options for [`TestFixture::start`].
pub struct FixtureOptions {
    /// Buttons in the plan.
    pub buttons: usize,
    /// Cameras, indexed from 1.
    pub cameras: Vec<CameraSpec>,
    /// Motion controller behaviour.
    pub motion: MockControllerOptions,
    /// Write reference images matching the live cameras.
    pub references: bool,
    /// Config adjustments applied before the controller is built.
    pub configure: fn(&mut FixtureConfig),
    /// Infrared backend captured on every button.
    pub infrared: Option<Arc<dyn InfraredCapture>>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            buttons: 16,
            cameras: vec![CameraSpec::Live(1), CameraSpec::Live(2)],
            motion: MockControllerOptions::default(),
            references: true,
            configure: |_| {},
            infrared: None,
        }
    }
}

/// A running simulated fixture.
pub struct TestFixture {
    pub controller: Controller,
    pub motion: MockController,
    pub relay: MockController,
    pub dir: TempDir,
}

/// Plan of `count` buttons on a regular grid.
pub fn grid_plan(count: usize) -> TestPlan {
    TestPlan::new(
        (0..count)
            .map(|i| ButtonTarget::new(format!("Button {}", i + 1), 10.0 + (i % 4) as f64 * 25.0, 20.0 + (i / 4) as f64 * 15.0))
            .collect(),
    )
}

/// Config over `root` with every loop delay zeroed.
pub fn fast_config(root: &Path) -> FixtureConfig {
    let mut config = FixtureConfig::default();
    config.storage.output_dir = root.join("data");
    config.storage.scratch_dir = root.join("data/scratch");
    config.storage.reference_dir = root.join("references");
    config.storage.plan_file = root.join("plan.toml");

    let run = &mut config.sequencer.run;
    run.move_settle = Duration::ZERO;
    run.press_hold = Duration::ZERO;
    run.release_settle = Duration::ZERO;
    run.inter_button_delay = Duration::ZERO;
    run.park_settle = Duration::ZERO;

    config.motion.status_window_ms = 20;
    config.camera.frame_interval = Duration::from_millis(5);
    config.camera.reconnect_attempts = 1;
    config.camera.reconnect_backoff = Duration::from_millis(10);
    config.camera.stop_timeout = Duration::from_millis(500);
    config.trigger.poll_interval = Duration::from_millis(20);
    config
}

fn camera_settings() -> CameraSettings {
    CameraSettings {
        reconnect_attempts: 1,
        reconnect_backoff: Duration::from_millis(10),
        frame_interval: Duration::from_millis(5),
        stop_timeout: Duration::from_millis(500),
        rotation: Rotation::None,
    }
}

/// Save the reference every button expects from a camera showing `seed`.
pub fn write_references(dir: &Path, plan: &TestPlan, camera: u8, seed: u32) {
    std::fs::create_dir_all(dir).unwrap();
    let image = frame_to_image(&synthetic_pattern(WIDTH, HEIGHT, seed)).unwrap();
    for (index, button) in plan.buttons.iter().enumerate() {
        let path = dir.join(format!("{}.png", reference_stem(index, &button.name, camera)));
        image.save(&path).unwrap();
    }
}

impl TestFixture {
    /// Build the controller, attach the mocks and start the cameras.
    ///
    /// Blocks until every live camera has delivered a frame.
    pub async fn start(options: FixtureOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config(dir.path());
        (options.configure)(&mut config);

        let plan = grid_plan(options.buttons);
        if options.references {
            for (i, spec) in options.cameras.iter().enumerate() {
                if let CameraSpec::Live(seed) = spec {
                    write_references(&config.storage.reference_dir, &plan, i as u8 + 1, *seed);
                }
            }
        }

        let cameras = options
            .cameras
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let source = match spec {
                    CameraSpec::Live(seed) => SyntheticFrameSource::new(synthetic_pattern(WIDTH, HEIGHT, *seed)),
                    CameraSpec::Offline => SyntheticFrameSource::offline(),
                };
                CameraManager::new(i as u8 + 1, Box::new(source), camera_settings())
            })
            .collect();

        let mut builder = Controller::builder(config).plan(plan).cameras(cameras);
        if let Some(infrared) = options.infrared {
            builder = builder.infrared(infrared);
        }
        let controller = builder.build().unwrap();

        let (port, motion) = MockController::spawn(ChannelRole::Motion, options.motion);
        controller.attach_channel(ChannelRole::Motion, port, "mock-motion").await;
        let (port, relay) = MockController::spawn(ChannelRole::Relay, MockControllerOptions::default());
        controller.attach_channel(ChannelRole::Relay, port, "mock-relay").await;

        controller.start_cameras();
        let live: Vec<u8> = options
            .cameras
            .iter()
            .enumerate()
            .filter(|(_, spec)| matches!(spec, CameraSpec::Live(_)))
            .map(|(i, _)| i as u8 + 1)
            .collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !live.iter().all(|i| controller.get_frame(*i).is_ok()) {
            assert!(Instant::now() < deadline, "cameras never delivered a frame");
            std::thread::sleep(Duration::from_millis(5));
        }

        Self {
            controller,
            motion,
            relay,
            dir,
        }
    }

    /// Stop cameras and close channels.
    pub async fn stop(self) {
        self.controller.shutdown().await;
    }
}
