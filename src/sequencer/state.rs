//! Machine state and run flags.
//!
//! Both live on the [`Controller`](crate::controller::Controller) and are
//! shared by reference with the sequencer, the trigger listener and the
//! emergency controller. Each has its own lock or atomics; nothing here
//! serialises camera acquisition against motion.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rbs_core::{FixtureError, FixtureResult};
use serde::Serialize;
use tracing::{debug, warn};

/// What the fixture is physically doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Ready for a run.
    #[default]
    Idle,
    /// Positioning the actuator.
    Moving,
    /// Actuating a button.
    Pressing,
    /// Latched after a failure or an operator stop; cleared by reset.
    Emergency,
    /// Homing the camera stage.
    Calibrating,
}

impl MachineState {
    /// Whether `self -> to` is a legal transition.
    ///
    /// Emergency is reachable from anywhere and leaves only through
    /// [`MachineStateCell::reset`].
    pub fn can_transition_to(self, to: MachineState) -> bool {
        use MachineState::*;
        match (self, to) {
            (_, Emergency) => true,
            (Emergency, _) => false,
            (from, to) if from == to => true,
            (Idle, Moving | Calibrating) => true,
            (Moving, Pressing | Idle) => true,
            (Pressing, Moving | Idle) => true,
            (Calibrating, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Idle => "idle",
            MachineState::Moving => "moving",
            MachineState::Pressing => "pressing",
            MachineState::Emergency => "emergency",
            MachineState::Calibrating => "calibrating",
        };
        f.write_str(name)
    }
}

/// Lock-protected [`MachineState`].
#[derive(Debug, Default)]
pub struct MachineStateCell {
    state: Mutex<MachineState>,
}

impl MachineStateCell {
    /// Cell starting in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn get(&self) -> MachineState {
        *self.state.lock()
    }

    /// Whether the fixture is latched in Emergency.
    pub fn is_emergency(&self) -> bool {
        self.get() == MachineState::Emergency
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&self, to: MachineState) -> FixtureResult<MachineState> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(FixtureError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if from != to {
            debug!(%from, %to, "machine state");
        }
        *state = to;
        Ok(from)
    }

    /// Latch Emergency from any state, returning the previous state.
    pub fn enter_emergency(&self) -> MachineState {
        let mut state = self.state.lock();
        let from = std::mem::replace(&mut *state, MachineState::Emergency);
        if from != MachineState::Emergency {
            warn!(%from, "machine state latched to emergency");
        }
        from
    }

    /// Leave Emergency for Idle. Returns whether a latch was cleared.
    pub fn reset(&self) -> bool {
        let mut state = self.state.lock();
        if *state != MachineState::Emergency {
            return false;
        }
        *state = MachineState::Idle;
        true
    }
}

/// Run-active and continue flags plus the run counter.
#[derive(Debug, Default)]
pub struct RunFlags {
    running: AtomicBool,
    keep_going: AtomicBool,
    runs: AtomicU64,
}

impl RunFlags {
    /// Flags with no run active.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the run slot.
    ///
    /// Fails with `RunAlreadyActive` without touching the active run's
    /// flags or the counter.
    pub fn try_begin(self: &Arc<Self>) -> FixtureResult<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FixtureError::RunAlreadyActive)?;
        self.keep_going.store(true, Ordering::Release);
        Ok(RunGuard {
            flags: Arc::clone(self),
        })
    }

    /// Whether a run holds the slot.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the active run should process another button.
    pub fn should_continue(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }

    /// Ask the active run to stop at the next button boundary.
    pub fn interrupt(&self) {
        self.keep_going.store(false, Ordering::Release);
    }

    /// Runs started since process start.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    fn next_run_index(&self) -> u64 {
        self.runs.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Holds the run slot; releases it on drop, including on panic or when the
/// run task is aborted.
#[derive(Debug)]
pub struct RunGuard {
    flags: Arc<RunFlags>,
}

impl RunGuard {
    /// Increment the run counter for the run this guard admits.
    pub fn assign_index(&self) -> u64 {
        self.flags.next_run_index()
    }

    /// The guarded flags.
    pub fn flags(&self) -> &Arc<RunFlags> {
        &self.flags
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("run guard released during panic");
        }
        self.flags.keep_going.store(false, Ordering::Release);
        self.flags.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_table() {
        let cell = MachineStateCell::new();
        assert_eq!(cell.transition(MachineState::Moving).unwrap(), MachineState::Idle);
        cell.transition(MachineState::Pressing).unwrap();
        cell.transition(MachineState::Moving).unwrap();
        assert!(cell.transition(MachineState::Calibrating).is_err());
        cell.transition(MachineState::Idle).unwrap();
        cell.transition(MachineState::Calibrating).unwrap();
        assert!(matches!(
            cell.transition(MachineState::Pressing),
            Err(FixtureError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn emergency_latches_until_reset() {
        let cell = MachineStateCell::new();
        cell.transition(MachineState::Moving).unwrap();
        assert_eq!(cell.enter_emergency(), MachineState::Moving);
        assert!(cell.transition(MachineState::Idle).is_err());
        assert!(cell.transition(MachineState::Moving).is_err());
        assert!(cell.transition(MachineState::Emergency).is_ok());

        assert!(cell.reset());
        assert_eq!(cell.get(), MachineState::Idle);
        assert!(!cell.reset());
    }

    #[test]
    fn second_begin_is_rejected_without_side_effects() {
        let flags = Arc::new(RunFlags::new());
        let guard = flags.try_begin().unwrap();
        assert_eq!(guard.assign_index(), 1);

        assert!(matches!(flags.try_begin(), Err(FixtureError::RunAlreadyActive)));
        assert!(flags.is_running());
        assert!(flags.should_continue());
        assert_eq!(flags.run_count(), 1);

        flags.interrupt();
        assert!(!flags.should_continue());
        drop(guard);
        assert!(!flags.is_running());

        let again = flags.try_begin().unwrap();
        assert!(again.flags().should_continue());
        assert_eq!(again.assign_index(), 2);
    }

    #[test]
    fn guard_releases_on_panic() {
        let flags = Arc::new(RunFlags::new());
        let inner = Arc::clone(&flags);
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.try_begin().unwrap();
            panic!("button loop blew up");
        });
        assert!(result.is_err());
        assert!(!flags.is_running());
    }
}
