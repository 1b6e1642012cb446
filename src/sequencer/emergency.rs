//! Emergency and recovery.
//!
//! One code path reachable from every failure: latch the machine state,
//! stop the active run at its next boundary and drive every open channel
//! through the safe-state choreography. Only an explicit [`reset`] leaves
//! the latch.
//!
//! [`reset`]: EmergencyController::reset

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use super::choreography::{self, Choreography, ChoreographyOutcome, FailurePolicy};
use super::state::{MachineStateCell, RunFlags};
use crate::hardware::dispatcher::CommandDispatcher;

/// Drives the fixture to its safe state.
pub struct EmergencyController {
    dispatcher: Arc<CommandDispatcher>,
    state: Arc<MachineStateCell>,
    flags: Arc<RunFlags>,
    safe_state: Choreography,
    reason: RwLock<Option<String>>,
}

impl EmergencyController {
    /// Controller over shared state, using the dispatcher's motion
    /// vocabulary for the safe-state sequence.
    pub fn new(dispatcher: Arc<CommandDispatcher>, state: Arc<MachineStateCell>, flags: Arc<RunFlags>) -> Self {
        let safe_state = choreography::safe_state(dispatcher.motion_protocol());
        Self {
            dispatcher,
            state,
            flags,
            safe_state,
            reason: RwLock::new(None),
        }
    }

    /// Shared machine state.
    pub fn state(&self) -> &Arc<MachineStateCell> {
        &self.state
    }

    /// Shared run flags.
    pub fn flags(&self) -> &Arc<RunFlags> {
        &self.flags
    }

    /// Dispatcher used for the safe-state sequence.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Why the latch was last set.
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Send the safe-state sequence to every open channel without latching.
    pub async fn safe_state(&self) -> ChoreographyOutcome {
        match self.safe_state.run(&self.dispatcher, FailurePolicy::BestEffort).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Best-effort runs report failures in the outcome.
                error!(error = %e, "safe-state sequence failed");
                ChoreographyOutcome {
                    failures: vec![e.to_string()],
                    ..ChoreographyOutcome::default()
                }
            }
        }
    }

    /// Latch Emergency, interrupt any run and send the safe state.
    pub async fn trigger(&self, reason: impl Into<String>) -> ChoreographyOutcome {
        let reason = reason.into();
        let previous = self.state.enter_emergency();
        self.flags.interrupt();
        warn!(%previous, %reason, running = self.flags.is_running(), "emergency triggered");
        *self.reason.write() = Some(reason);

        let outcome = self.safe_state().await;
        info!(
            executed = outcome.executed,
            skipped = outcome.skipped,
            failed = outcome.failures.len(),
            "fixture driven to safe state"
        );
        outcome
    }

    /// Clear the latch. Returns whether the fixture was in Emergency.
    pub fn reset(&self) -> bool {
        let cleared = self.state.reset();
        if cleared {
            info!(reason = ?self.reason.read().as_deref(), "emergency latch cleared");
            *self.reason.write() = None;
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel::ChannelBank;
    use crate::hardware::dispatcher::MotionProtocol;
    use crate::hardware::mock::{MockController, MockControllerOptions};
    use crate::sequencer::state::MachineState;
    use rbs_core::ChannelRole;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn controller() -> (EmergencyController, MockController, MockController) {
        let channels = Arc::new(ChannelBank::new());
        let (motion_port, motion) = MockController::spawn(ChannelRole::Motion, MockControllerOptions::default());
        let (relay_port, relay) = MockController::spawn(ChannelRole::Relay, MockControllerOptions::default());
        channels.get(ChannelRole::Motion).attach(motion_port, "mock-motion").await;
        channels.get(ChannelRole::Relay).attach(relay_port, "mock-relay").await;
        let dispatcher = Arc::new(CommandDispatcher::new(
            channels,
            MotionProtocol::default(),
            Duration::from_secs(1),
        ));
        let emergency = EmergencyController::new(
            dispatcher,
            Arc::new(MachineStateCell::new()),
            Arc::new(RunFlags::new()),
        );
        (emergency, motion, relay)
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_latches_and_sends_safe_state() {
        let (emergency, motion, relay) = controller().await;
        let guard = emergency.flags().try_begin().unwrap();
        emergency.state().transition(MachineState::Moving).unwrap();

        let outcome = emergency.trigger("operator stop").await;
        assert!(outcome.is_clean());
        assert!(emergency.state().is_emergency());
        assert!(!emergency.flags().should_continue());
        assert_eq!(emergency.reason().as_deref(), Some("operator stop"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(motion.commands(), vec!["\u{18}", "$X"]);
        assert_eq!(
            relay.commands(),
            vec!["P_0", "B1_0", "K2_0", "ENA", "P_0", "B2_0", "K1_0", "ENA"]
        );

        drop(guard);
        assert!(emergency.reset());
        assert_eq!(emergency.state().get(), MachineState::Idle);
        assert_eq!(emergency.reason(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_state_skips_disconnected_channels() {
        let (emergency, _motion, relay) = controller().await;
        emergency.dispatcher().channels().get(ChannelRole::Motion).disconnect().await;

        let outcome = emergency.safe_state().await;
        assert_eq!(outcome.skipped, 2);
        assert!(!emergency.state().is_emergency());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.commands().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn trigger_is_logged_with_its_reason() {
        let (emergency, _motion, _relay) = controller().await;
        emergency.trigger("motion link lost").await;
        assert!(logs_contain("emergency triggered"));
        assert!(logs_contain("motion link lost"));
        assert!(logs_contain("fixture driven to safe state"));
    }
}
