//! The run loop.
//!
//! One run, end to end:
//!
//! 1. claim the run slot (`RunAlreadyActive` otherwise)
//! 2. clear the scratch area, create the run directory
//! 3. initialise motion and relay controllers (best effort)
//! 4. prime the actuator and power the board
//! 5. for each button while the continue flag holds: move, press, release,
//!    capture and validate every camera, join the infrared capture
//! 6. aggregate, persist, finalize, safe state
//!
//! Anything escaping a button (a dead channel, a latched emergency) aborts
//! the run through the [`EmergencyController`] before the run slot is
//! released. A partial report is persisted when at least one button
//! completed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rbs_core::{ChannelRole, FixtureError, FixtureResult};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::choreography::{self, FailurePolicy, FixtureSide, PRESS, RELEASE};
use super::emergency::EmergencyController;
use super::state::{MachineState, MachineStateCell, RunFlags, RunGuard};
use crate::hardware::camera::CameraBank;
use crate::hardware::dispatcher::CommandDispatcher;
use crate::hardware::infrared::{InfraredCapture, InfraredOutcome, KnownCodes};
use crate::plan::{ButtonTarget, TestPlan};
use crate::report::archive::RunArchive;
use crate::report::{aggregate, ButtonResult, GroupPolicy, RunMetadata, RunOutcome, RunReport};
use crate::vision::{ImageValidator, ValidationResult};

/// Timing and tokens of the button loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSettings {
    /// Fixture side primed and powered by runs.
    pub side: FixtureSide,
    /// Relay press token.
    pub press_command: String,
    /// Relay release token.
    pub release_command: String,
    /// Settle after each positioning move.
    #[serde(with = "millis")]
    pub move_settle: Duration,
    /// Stabilisation delay between press and release.
    #[serde(with = "millis")]
    pub press_hold: Duration,
    /// Settle after release, before capture.
    #[serde(with = "millis")]
    pub release_settle: Duration,
    /// Pause between buttons.
    #[serde(with = "millis")]
    pub inter_button_delay: Duration,
    /// Settle after the final park move.
    #[serde(with = "millis")]
    pub park_settle: Duration,
    /// Power the board after priming.
    pub power_up: bool,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            side: FixtureSide::One,
            press_command: PRESS.to_string(),
            release_command: RELEASE.to_string(),
            move_settle: Duration::from_millis(1000),
            press_hold: Duration::from_millis(300),
            release_settle: Duration::from_millis(500),
            inter_button_delay: Duration::from_millis(200),
            park_settle: Duration::from_millis(3000),
            power_up: true,
        }
    }
}

/// Serde helper for `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Infrared capture attached to the button loop.
#[derive(Clone)]
pub struct InfraredStage {
    /// Capture backend.
    pub capture: Arc<dyn InfraredCapture>,
    /// Receiver identifier.
    pub target: String,
    /// Capture window requested from the receiver.
    pub capture_timeout: Duration,
    /// How long the loop waits for the capture after validation.
    pub join_timeout: Duration,
    /// Codes counted as recognised.
    pub known: Option<Arc<KnownCodes>>,
}

impl InfraredStage {
    fn spawn(&self, button: usize) -> JoinHandle<InfraredOutcome> {
        let capture = Arc::clone(&self.capture);
        let known = self.known.clone();
        let target = self.target.clone();
        let timeout = self.capture_timeout;
        tokio::spawn(async move {
            match capture.capture(&target, timeout).await {
                Ok(reading) => {
                    let outcome = InfraredOutcome::captured(&target, reading, known.as_deref());
                    debug!(button, codes = outcome.codes.len(), recognized = ?outcome.recognized, "infrared captured");
                    outcome
                }
                Err(e) => {
                    warn!(button, target = %target, error = %e, "infrared capture failed");
                    InfraredOutcome::failed(&target, e.to_string())
                }
            }
        })
    }

    async fn join(&self, mut task: JoinHandle<InfraredOutcome>) -> InfraredOutcome {
        match tokio::time::timeout(self.join_timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => InfraredOutcome::failed(&self.target, format!("capture task failed: {e}")),
            Err(_) => {
                task.abort();
                warn!(target = %self.target, "infrared capture still pending, abandoned");
                InfraredOutcome::failed(
                    &self.target,
                    format!("no result within {} ms", self.join_timeout.as_millis()),
                )
            }
        }
    }
}

/// Handle to a run started with [`Sequencer::start_run`].
#[derive(Debug)]
pub struct RunHandle {
    run_index: u64,
    run_id: Uuid,
    task: JoinHandle<FixtureResult<Arc<RunReport>>>,
}

impl RunHandle {
    /// Monotonic index of the run.
    pub fn run_index(&self) -> u64 {
        self.run_index
    }

    /// Unique id of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Whether the run task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> FixtureResult<Arc<RunReport>> {
        self.task.await.map_err(|e| FixtureError::SequenceAborted {
            reason: format!("run task ended abnormally: {e}"),
        })?
    }
}

struct RunContext {
    run_index: u64,
    run_id: Uuid,
    side: FixtureSide,
    started_at: DateTime<Utc>,
    photo_dir: PathBuf,
    plan: Arc<TestPlan>,
}

impl RunContext {
    fn metadata(&self, outcome: RunOutcome) -> RunMetadata {
        RunMetadata {
            run_id: self.run_id,
            run_index: self.run_index,
            side: self.side.number(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            photo_dir: self.photo_dir.clone(),
            outcome,
        }
    }
}

/// Drives runs over the test plan.
pub struct Sequencer {
    dispatcher: Arc<CommandDispatcher>,
    cameras: Arc<CameraBank>,
    emergency: Arc<EmergencyController>,
    validator: Arc<ImageValidator>,
    archive: RunArchive,
    plan: RwLock<Arc<TestPlan>>,
    settings: SequencerSettings,
    policy: GroupPolicy,
    infrared: Option<InfraredStage>,
    latest: RwLock<Option<Arc<RunReport>>>,
}

impl Sequencer {
    /// Sequencer sharing state and flags with `emergency`.
    pub fn new(
        emergency: Arc<EmergencyController>,
        cameras: Arc<CameraBank>,
        validator: ImageValidator,
        archive: RunArchive,
        plan: TestPlan,
        settings: SequencerSettings,
    ) -> Self {
        Self {
            dispatcher: Arc::clone(emergency.dispatcher()),
            cameras,
            emergency,
            validator: Arc::new(validator),
            archive,
            plan: RwLock::new(Arc::new(plan)),
            settings,
            policy: GroupPolicy::default(),
            infrared: None,
            latest: RwLock::new(None),
        }
    }

    /// Override the group policy.
    #[must_use]
    pub fn with_policy(mut self, policy: GroupPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Infrared stage, when configured.
    pub fn infrared(&self) -> Option<&InfraredStage> {
        self.infrared.as_ref()
    }

    /// Capture infrared on every button.
    #[must_use]
    pub fn with_infrared(mut self, stage: InfraredStage) -> Self {
        self.infrared = Some(stage);
        self
    }

    fn state(&self) -> &Arc<MachineStateCell> {
        self.emergency.state()
    }

    fn flags(&self) -> &Arc<RunFlags> {
        self.emergency.flags()
    }

    /// Loop settings.
    pub fn settings(&self) -> &SequencerSettings {
        &self.settings
    }

    /// Current test plan.
    pub fn plan(&self) -> Arc<TestPlan> {
        Arc::clone(&self.plan.read())
    }

    /// Replace the test plan. Rejected while a run is active.
    pub fn set_plan(&self, plan: TestPlan) -> FixtureResult<()> {
        plan.validate()?;
        if self.flags().is_running() {
            return Err(FixtureError::RunAlreadyActive);
        }
        *self.plan.write() = Arc::new(plan);
        Ok(())
    }

    /// Report of the last finished run.
    pub fn latest_report(&self) -> Option<Arc<RunReport>> {
        self.latest.read().clone()
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.flags().is_running()
    }

    /// Ask the active run to stop after the current button.
    pub fn interrupt(&self) {
        if self.flags().is_running() {
            info!("run interruption requested");
        }
        self.flags().interrupt();
    }

    /// Start a run in the background.
    ///
    /// # Errors
    ///
    /// `RunAlreadyActive` if a run holds the slot, `MachineNotReady` if the
    /// fixture is not idle (latched emergency, homing).
    pub fn start_run(self: &Arc<Self>) -> FixtureResult<RunHandle> {
        self.start_run_on(self.settings.side)
    }

    /// Start a run priming `side` instead of the configured one.
    pub fn start_run_on(self: &Arc<Self>, side: FixtureSide) -> FixtureResult<RunHandle> {
        let guard = self.flags().try_begin()?;
        let state = self.state().get();
        if state != MachineState::Idle {
            return Err(FixtureError::MachineNotReady {
                state: state.to_string(),
            });
        }

        let run_index = guard.assign_index();
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run = run_index, %side);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.execute(guard, run_index, run_id, side).await }.instrument(span));
        info!(run = run_index, %run_id, "run started");
        Ok(RunHandle {
            run_index,
            run_id,
            task,
        })
    }

    async fn execute(
        &self,
        guard: RunGuard,
        run_index: u64,
        run_id: Uuid,
        side: FixtureSide,
    ) -> FixtureResult<Arc<RunReport>> {
        let started_at = Utc::now();
        let plan = self.plan();

        if let Err(e) = self.archive.clear_scratch() {
            warn!(error = %e, "could not clear scratch area");
        }
        let photo_dir = match self.archive.begin_run(run_index, started_at) {
            Ok(dir) => dir,
            Err(e) => {
                drop(guard);
                error!(error = %e, "could not create run directory");
                return Err(e);
            }
        };

        let ctx = RunContext {
            run_index,
            run_id,
            side,
            started_at,
            photo_dir,
            plan,
        };

        let mut buttons = Vec::with_capacity(ctx.plan.len());
        let verdict = match self.drive(&ctx, &mut buttons).await {
            Ok(()) if self.state().is_emergency() => Err(FixtureError::SequenceAborted {
                reason: self
                    .emergency
                    .reason()
                    .unwrap_or_else(|| "emergency stop".to_string()),
            }),
            Ok(()) => self.complete(&ctx, &buttons).await,
            Err(e) => Err(e),
        };

        let result = match verdict {
            Ok(report) => Ok(report),
            Err(e) => Err(self.abort(&ctx, buttons, e).await),
        };
        drop(guard);
        result
    }

    async fn drive(&self, ctx: &RunContext, buttons: &mut Vec<ButtonResult>) -> FixtureResult<()> {
        let d = self.dispatcher.as_ref();
        self.state().transition(MachineState::Moving)?;

        choreography::motion_init(d.motion_protocol())
            .run(d, FailurePolicy::BestEffort)
            .await?;
        choreography::relay_init(ctx.side)
            .run(d, FailurePolicy::BestEffort)
            .await?;

        choreography::priming(ctx.side)
            .run(d, FailurePolicy::Strict)
            .await?;
        if self.settings.power_up {
            choreography::power_up(ctx.side)
                .run(d, FailurePolicy::Strict)
                .await?;
        }

        for (index, target) in ctx.plan.buttons.iter().enumerate() {
            if !self.flags().should_continue() {
                info!(completed = buttons.len(), total = ctx.plan.len(), "run interrupted");
                break;
            }
            let result = self
                .run_button(ctx, index, target)
                .instrument(info_span!("button", button = index + 1, name = %target.name))
                .await?;
            info!(
                button = index + 1,
                approved = result.approved,
                similarity = ?result.similarity,
                "button done"
            );
            buttons.push(result);

            if !self.settings.inter_button_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_button_delay).await;
            }
        }
        Ok(())
    }

    async fn run_button(&self, ctx: &RunContext, index: usize, target: &ButtonTarget) -> FixtureResult<ButtonResult> {
        let command = target.motion_command(index, &ctx.plan.command_template)?;

        self.state().transition(MachineState::Moving)?;
        self.dispatcher
            .send(ChannelRole::Motion, &command, self.settings.move_settle)
            .await?;

        let infrared = self.infrared.as_ref().map(|stage| (stage, stage.spawn(index)));

        self.state().transition(MachineState::Pressing)?;
        self.dispatcher
            .send(ChannelRole::Relay, &self.settings.press_command, self.settings.press_hold)
            .await?;
        self.dispatcher
            .send(ChannelRole::Relay, &self.settings.release_command, self.settings.release_settle)
            .await?;
        self.state().transition(MachineState::Moving)?;

        let cameras = self.capture(ctx, index, target).await;
        let infrared = match infrared {
            Some((stage, task)) => Some(stage.join(task).await),
            None => None,
        };

        Ok(ButtonResult::new(index, target.clone(), cameras, infrared))
    }

    /// Snapshot every camera and validate the frames off the control plane.
    async fn capture(&self, ctx: &RunContext, index: usize, target: &ButtonTarget) -> Vec<ValidationResult> {
        let mut jobs = Vec::with_capacity(self.cameras.cameras().len());
        for camera in self.cameras.cameras() {
            let camera_index = camera.index();
            let frame = match camera.require_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(camera = camera_index, "no frame: {e}");
                    jobs.push((camera_index, None));
                    continue;
                }
            };

            let rotation = camera.rotation();
            let validator = Arc::clone(&self.validator);
            let archive = self.archive.clone();
            let run_dir = ctx.photo_dir.clone();
            let name = target.name.clone();
            let job = tokio::task::spawn_blocking(move || {
                if let Err(e) = archive.save_frame(&run_dir, index, &name, camera_index, &frame, rotation) {
                    warn!(camera = camera_index, error = %e, "failed to save frame");
                }
                validator.validate(&frame, rotation, index, &name, camera_index)
            });
            jobs.push((camera_index, Some(job)));
        }

        let mut results = Vec::with_capacity(jobs.len());
        for (camera, job) in jobs {
            let result = match job {
                None => ValidationResult::unvalidated(
                    camera,
                    None,
                    Some(FixtureError::CameraUnavailable { camera }.to_string()),
                ),
                Some(job) => job.await.unwrap_or_else(|e| {
                    warn!(camera, error = %e, "validation task failed");
                    ValidationResult::unvalidated(camera, None, Some(e.to_string()))
                }),
            };
            results.push(result);
        }
        results
    }

    async fn complete(&self, ctx: &RunContext, buttons: &[ButtonResult]) -> FixtureResult<Arc<RunReport>> {
        let outcome = if buttons.len() == ctx.plan.len() {
            RunOutcome::Completed
        } else {
            RunOutcome::Interrupted
        };
        let report = Arc::new(aggregate(ctx.metadata(outcome), buttons.to_vec(), &self.policy));
        self.archive.persist(&report)?;
        *self.latest.write() = Some(Arc::clone(&report));

        choreography::finalize(&self.settings.release_command, duration_ms(self.settings.park_settle))
            .run(&self.dispatcher, FailurePolicy::Strict)
            .await?;
        self.state().transition(MachineState::Idle)?;
        self.emergency.safe_state().await;

        info!(
            outcome = ?report.metadata.outcome,
            summary = %report.summary.text,
            "run finished"
        );
        Ok(report)
    }

    async fn abort(&self, ctx: &RunContext, buttons: Vec<ButtonResult>, cause: FixtureError) -> FixtureError {
        let reason = if self.state().is_emergency() {
            self.emergency.reason().unwrap_or_else(|| cause.to_string())
        } else {
            if cause.is_channel_fault() {
                error!(error = %cause, "hardware channel lost, aborting run");
            } else {
                error!(error = %cause, "run failed, aborting");
            }
            self.emergency.trigger(cause.to_string()).await;
            cause.to_string()
        };

        if !buttons.is_empty() {
            let report = aggregate(
                ctx.metadata(RunOutcome::Aborted {
                    reason: reason.clone(),
                }),
                buttons,
                &self.policy,
            );
            match self.archive.persist(&report) {
                Ok(_) => *self.latest.write() = Some(Arc::new(report)),
                Err(e) => error!(error = %e, "failed to persist partial report"),
            }
        }
        FixtureError::SequenceAborted { reason }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
