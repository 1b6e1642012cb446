//! The fixture controller.
//!
//! A single [`Controller`] is built at process start and owns every piece
//! of shared state: the channel bank, the camera bank, the machine state,
//! the run flags and the sequencer. The daemon, the trigger listener and
//! any control surface hold it (or its parts) by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use rbs_core::serial::{list_serial_ports, PortInfo};
use rbs_core::{ChannelRole, DynSerial, FixtureError, FixtureResult, Frame};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{CameraSource, ChannelsConfig, FixtureConfig, InfraredBackend};
use crate::hardware::camera::{
    CameraBank, CameraManager, CameraStatus, FrameSource, ImageFileSource, Rotation, RotationStore,
};
use crate::hardware::channel::{ChannelBank, ChannelStatus};
use crate::hardware::dispatcher::CommandDispatcher;
use crate::hardware::infrared::{HttpInfraredClient, InfraredCapture, KnownCodes, SerialInfraredReader};
use crate::hardware::mock::{synthetic_pattern, SyntheticFrameSource};
use crate::plan::TestPlan;
use crate::report::archive::RunArchive;
use crate::report::RunReport;
use crate::sequencer::choreography::{self, ChoreographyOutcome, FailurePolicy, FixtureSide, Homing};
use crate::sequencer::{
    EmergencyController, InfraredStage, MachineState, MachineStateCell, RunFlags, RunHandle, Sequencer,
};
use crate::trigger::{TriggerHandle, TriggerListener, TriggerSettings};
use crate::vision::process::{PROCESS_HEIGHT, PROCESS_WIDTH};
use crate::vision::ImageValidator;

/// Extra time granted to an HTTP capture beyond the capture window.
const HTTP_MARGIN: Duration = Duration::from_secs(5);

/// Builds a [`Controller`] from configuration, with optional overrides for
/// simulation and tests.
pub struct ControllerBuilder {
    config: FixtureConfig,
    plan: TestPlan,
    cameras: Option<Vec<CameraManager>>,
    infrared: Option<Arc<dyn InfraredCapture>>,
}

impl ControllerBuilder {
    /// Builder over `config` with an empty plan.
    pub fn new(config: FixtureConfig) -> Self {
        Self {
            config,
            plan: TestPlan::default(),
            cameras: None,
            infrared: None,
        }
    }

    /// Test plan to run.
    #[must_use]
    pub fn plan(mut self, plan: TestPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Use these cameras instead of the configured ones.
    #[must_use]
    pub fn cameras(mut self, cameras: Vec<CameraManager>) -> Self {
        self.cameras = Some(cameras);
        self
    }

    /// Use this infrared backend instead of the configured one.
    #[must_use]
    pub fn infrared(mut self, capture: Arc<dyn InfraredCapture>) -> Self {
        self.infrared = Some(capture);
        self
    }

    /// Assemble the controller. Channels stay closed and cameras stopped.
    pub fn build(self) -> FixtureResult<Controller> {
        let config = self.config;
        config.validate().map_err(FixtureError::Configuration)?;
        self.plan.validate()?;

        let channels = Arc::new(ChannelBank::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&channels),
            config.motion.clone(),
            config.channels.write_timeout,
        ));
        let emergency = Arc::new(EmergencyController::new(
            Arc::clone(&dispatcher),
            Arc::new(MachineStateCell::new()),
            Arc::new(RunFlags::new()),
        ));

        let cameras = match self.cameras {
            Some(cameras) => cameras,
            None => config
                .cameras
                .iter()
                .map(|camera| {
                    Ok(CameraManager::new(
                        camera.index,
                        camera_source(&camera.source)?,
                        config.camera.settings(camera.rotation),
                    ))
                })
                .collect::<FixtureResult<Vec<_>>>()?,
        };
        let cameras = Arc::new(CameraBank::new(cameras));
        let rotations = RotationStore::new(config.storage.rotation_file());
        match rotations.load() {
            Ok(saved) => cameras.apply_rotations(&saved),
            Err(e) => warn!(path = %rotations.path().display(), error = %e, "ignoring saved camera rotations"),
        }

        let storage = &config.storage;
        let validator = ImageValidator::new(&storage.reference_dir)
            .with_threshold(config.validation.threshold)
            .with_weights(config.similarity_weights())
            .with_blur_sigma(config.validation.blur_sigma);
        let archive = RunArchive::new(&storage.output_dir, &storage.scratch_dir, &storage.reference_dir)?;

        let mut sequencer = Sequencer::new(
            Arc::clone(&emergency),
            Arc::clone(&cameras),
            validator,
            archive,
            self.plan,
            config.sequencer.run.clone(),
        )
        .with_policy(config.report);

        let infrared = &config.infrared;
        let capture = match self.infrared {
            Some(capture) => Some(capture),
            None if infrared.enabled => Some(configured_infrared(&config, &channels)?),
            None => None,
        };
        if let Some(capture) = capture {
            let known = match &infrared.known_codes {
                Some(path) => {
                    let codes = KnownCodes::load(path)?;
                    info!(path = %path.display(), codes = codes.len(), "known infrared codes loaded");
                    Some(Arc::new(codes))
                }
                None => None,
            };
            sequencer = sequencer.with_infrared(InfraredStage {
                capture,
                target: infrared.target.clone(),
                capture_timeout: infrared.capture_timeout,
                join_timeout: infrared.join_timeout,
                known,
            });
        }

        Ok(Controller {
            channels,
            dispatcher,
            cameras,
            rotations,
            emergency,
            sequencer: Arc::new(sequencer),
            channel_config: config.channels.clone(),
            homing: config.sequencer.homing.clone(),
            trigger: config.trigger.clone(),
        })
    }
}

fn camera_source(source: &CameraSource) -> FixtureResult<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match source {
        CameraSource::File { path } => Box::new(ImageFileSource::new(path.clone())),
        #[cfg(feature = "camera_device")]
        CameraSource::Device { index } => Box::new(crate::hardware::device_camera::DeviceFrameSource::new(*index)),
        #[cfg(not(feature = "camera_device"))]
        CameraSource::Device { index } => {
            return Err(FixtureError::Configuration(format!(
                "camera device {index} needs the `camera_device` feature"
            )))
        }
        CameraSource::Synthetic { seed } => Box::new(SyntheticFrameSource::new(synthetic_pattern(
            PROCESS_WIDTH,
            PROCESS_HEIGHT,
            *seed,
        ))),
        CameraSource::Offline => Box::new(SyntheticFrameSource::offline()),
    };
    Ok(source)
}

fn configured_infrared(config: &FixtureConfig, channels: &ChannelBank) -> FixtureResult<Arc<dyn InfraredCapture>> {
    let infrared = &config.infrared;
    let capture: Arc<dyn InfraredCapture> = match infrared.backend {
        InfraredBackend::Http => Arc::new(HttpInfraredClient::new(
            &infrared.base_url,
            infrared.capture_timeout + HTTP_MARGIN,
        )?),
        InfraredBackend::Serial => Arc::new(SerialInfraredReader::new(Arc::clone(
            channels.get(ChannelRole::Infrared),
        ))?),
    };
    Ok(capture)
}

/// Owns the fixture's shared state and exposes its operations.
pub struct Controller {
    channels: Arc<ChannelBank>,
    dispatcher: Arc<CommandDispatcher>,
    cameras: Arc<CameraBank>,
    rotations: RotationStore,
    emergency: Arc<EmergencyController>,
    sequencer: Arc<Sequencer>,
    channel_config: ChannelsConfig,
    homing: Homing,
    trigger: TriggerSettings,
}

impl Controller {
    /// Builder over `config`.
    pub fn builder(config: FixtureConfig) -> ControllerBuilder {
        ControllerBuilder::new(config)
    }

    /// The sequencer.
    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// The channel bank.
    pub fn channels(&self) -> &Arc<ChannelBank> {
        &self.channels
    }

    /// The camera bank.
    pub fn cameras(&self) -> &Arc<CameraBank> {
        &self.cameras
    }

    /// The emergency controller.
    pub fn emergency(&self) -> &Arc<EmergencyController> {
        &self.emergency
    }

    /// Current machine state.
    pub fn machine_state(&self) -> MachineState {
        self.emergency.state().get()
    }

    // -- run lifecycle -----------------------------------------------------

    /// Start a run on the configured side.
    pub fn start_run(&self) -> FixtureResult<RunHandle> {
        self.sequencer.start_run()
    }

    /// Start a run on `side`.
    pub fn start_run_on(&self, side: FixtureSide) -> FixtureResult<RunHandle> {
        self.sequencer.start_run_on(side)
    }

    /// Stop the active run at the next button boundary.
    pub fn interrupt(&self) {
        self.sequencer.interrupt();
    }

    /// Latch Emergency and drive the fixture to its safe state.
    pub async fn emergency_stop(&self) -> ChoreographyOutcome {
        self.emergency.trigger("emergency stop requested").await
    }

    /// Clear an Emergency latch. Returns whether one was set.
    pub fn reset(&self) -> bool {
        self.emergency.reset()
    }

    /// Report of the last finished run.
    pub fn latest_report(&self) -> Option<Arc<RunReport>> {
        self.sequencer.latest_report()
    }

    /// Home the camera stage under `Calibrating`.
    pub async fn home(&self) -> FixtureResult<ChoreographyOutcome> {
        self.exclusive(MachineState::Calibrating, choreography::home_camera(&self.homing))
            .await
    }

    /// Reset one board (release, power down, re-enable).
    pub async fn reset_board(&self, side: FixtureSide) -> FixtureResult<ChoreographyOutcome> {
        self.exclusive(MachineState::Idle, choreography::board_reset(side)).await
    }

    /// Power one board.
    pub async fn power_up(&self, side: FixtureSide) -> FixtureResult<ChoreographyOutcome> {
        self.exclusive(MachineState::Idle, choreography::power_up(side)).await
    }

    async fn exclusive(
        &self,
        during: MachineState,
        choreography: choreography::Choreography,
    ) -> FixtureResult<ChoreographyOutcome> {
        let _guard = self.emergency.flags().try_begin()?;
        let state = self.emergency.state();
        if state.get() != MachineState::Idle {
            return Err(FixtureError::MachineNotReady {
                state: state.get().to_string(),
            });
        }
        state.transition(during)?;
        let outcome = choreography.run(&self.dispatcher, FailurePolicy::BestEffort).await;
        if !state.is_emergency() {
            state.transition(MachineState::Idle)?;
        }
        outcome
    }

    // -- channels ----------------------------------------------------------

    /// Open `device` for `role`, closing any previous handle.
    pub async fn connect_channel(&self, role: ChannelRole, device: &str, baud: u32) -> FixtureResult<()> {
        self.channels.get(role).connect(device, baud).await
    }

    /// Attach an already open stream to `role`.
    pub async fn attach_channel(&self, role: ChannelRole, port: DynSerial, label: &str) {
        self.channels.get(role).attach(port, label).await;
    }

    /// Close `role`. Closing a closed channel is a no-op.
    pub async fn disconnect_channel(&self, role: ChannelRole) {
        self.channels.get(role).disconnect().await;
    }

    /// Open every channel that has a configured device. Failures are
    /// logged and leave the channel closed.
    pub async fn connect_configured(&self) -> usize {
        let mut connected = 0;
        for role in ChannelRole::ALL {
            let settings = match role {
                ChannelRole::Motion => &self.channel_config.motion,
                ChannelRole::Relay => &self.channel_config.relay,
                ChannelRole::Infrared => &self.channel_config.infrared,
            };
            let Some(device) = settings.device.as_deref() else {
                continue;
            };
            match self.connect_channel(role, device, settings.baud).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(%role, device, error = %e, "channel not connected"),
            }
        }
        connected
    }

    /// Status of every channel.
    pub async fn channel_status(&self) -> Vec<ChannelStatus> {
        self.channels.status().await
    }

    /// Candidate serial ports.
    pub fn list_ports(&self) -> FixtureResult<Vec<PortInfo>> {
        list_serial_ports().map_err(|e| FixtureError::Io(std::io::Error::other(e.to_string())))
    }

    /// Write `command` to `role` as-is.
    pub async fn send_raw(&self, role: ChannelRole, command: &str) -> FixtureResult<()> {
        self.dispatcher.send_raw(role, command).await
    }

    // -- cameras -----------------------------------------------------------

    /// Start every camera; returns how many are running.
    pub fn start_cameras(&self) -> usize {
        let running = self.cameras.start_all();
        info!(running, registered = self.cameras.cameras().len(), "cameras started");
        running
    }

    /// Latest frame of camera `index`.
    pub fn get_frame(&self, index: u8) -> FixtureResult<Frame> {
        self.cameras
            .get(index)
            .ok_or(FixtureError::CameraUnavailable { camera: index })?
            .require_frame()
    }

    /// Latest frame of camera `index`, or a placeholder for streaming.
    pub fn stream_frame(&self, index: u8) -> FixtureResult<Frame> {
        Ok(self
            .cameras
            .get(index)
            .ok_or(FixtureError::CameraUnavailable { camera: index })?
            .frame_or_placeholder())
    }

    /// Rotate camera `index` by 90 degrees and save every camera's
    /// rotation for the next start.
    ///
    /// A failed save is logged; the new rotation still applies.
    pub fn rotate_camera(&self, index: u8) -> FixtureResult<Rotation> {
        let rotation = self
            .cameras
            .get(index)
            .ok_or(FixtureError::CameraUnavailable { camera: index })?
            .rotate();
        if let Err(e) = self.rotations.save(&self.cameras.rotations()) {
            warn!(path = %self.rotations.path().display(), error = %e, "failed to save camera rotations");
        }
        Ok(rotation)
    }

    /// State of every camera.
    pub fn camera_status(&self) -> Vec<CameraStatus> {
        self.cameras.status()
    }

    /// Health report of the infrared collaborator.
    ///
    /// `None` when infrared is disabled or the backend has no health check.
    pub async fn infrared_status(&self) -> FixtureResult<Option<Value>> {
        match self.sequencer.infrared() {
            Some(stage) => stage.capture.status().await,
            None => Ok(None),
        }
    }

    // -- process lifecycle -------------------------------------------------

    /// Start the physical trigger listener on the relay channel.
    pub fn spawn_trigger_listener(&self) -> Option<TriggerHandle> {
        if !self.trigger.enabled {
            return None;
        }
        let listener = TriggerListener::new(
            Arc::clone(self.channels.get(ChannelRole::Relay)),
            Arc::clone(&self.sequencer),
            Arc::clone(&self.emergency),
            self.trigger.clone(),
        );
        Some(listener.spawn())
    }

    /// Stop any run, stop the cameras, send the safe state and close the
    /// channels.
    pub async fn shutdown(&self) {
        self.sequencer.interrupt();
        let cameras = Arc::clone(&self.cameras);
        if let Err(e) = tokio::task::spawn_blocking(move || cameras.stop_all()).await {
            warn!(error = %e, "camera shutdown failed");
        }
        self.emergency.safe_state().await;
        self.channels.close_all().await;
        info!("fixture shut down");
    }
}
