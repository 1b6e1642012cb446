//! Declarative hardware choreographies.
//!
//! The fixture has no command acknowledgement: every action is a command
//! followed by a fixed settle delay. Sequences are therefore data, a list
//! of `(channel, command, settle)` steps run by [`Choreography::run`].
//! The token strings are the firmware contract and must not change.

use std::fmt;
use std::time::Duration;

use rbs_core::{ChannelRole, FixtureError, FixtureResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hardware::dispatcher::{CommandDispatcher, MotionProtocol};

/// Press token on the relay controller.
pub const PRESS: &str = "P_1";
/// Release token on the relay controller.
pub const RELEASE: &str = "P_0";
/// Relay controller enable.
pub const ENABLE: &str = "ENA";
/// Motion park position.
pub const PARK: &str = "G90 X0 Y0";

/// Which half of the fixture a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FixtureSide {
    /// Board 1.
    #[default]
    One,
    /// Board 2.
    Two,
}

impl FixtureSide {
    /// Board number used in relay tokens.
    pub fn number(self) -> u8 {
        match self {
            FixtureSide::One => 1,
            FixtureSide::Two => 2,
        }
    }
}

impl TryFrom<u8> for FixtureSide {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FixtureSide::One),
            2 => Ok(FixtureSide::Two),
            other => Err(format!("fixture side must be 1 or 2, got {other}")),
        }
    }
}

impl From<FixtureSide> for u8 {
    fn from(side: FixtureSide) -> Self {
        side.number()
    }
}

impl fmt::Display for FixtureSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// One choreography step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send `command` on `role`, then wait `settle`.
    Send {
        /// Target channel.
        role: ChannelRole,
        /// Command text without terminator.
        command: String,
        /// Open-loop delay after the write.
        settle: Duration,
    },
    /// Pause without sending anything.
    Wait(Duration),
}

/// How [`Choreography::run`] treats a failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and continue. Steps on closed channels are skipped.
    BestEffort,
    /// Stop at the first failing step and return its error.
    Strict,
}

/// What a best-effort run got through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChoreographyOutcome {
    /// Steps that completed.
    pub executed: usize,
    /// Send steps whose channel was closed.
    pub skipped: usize,
    /// Failed steps as `command: error`.
    pub failures: Vec<String>,
}

impl ChoreographyOutcome {
    /// Whether every step completed.
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failures.is_empty()
    }
}

/// A named list of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choreography {
    name: String,
    steps: Vec<Step>,
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl Choreography {
    /// Empty choreography.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a send step.
    #[must_use]
    pub fn send(mut self, role: ChannelRole, command: impl Into<String>, settle: Duration) -> Self {
        self.steps.push(Step::Send {
            role,
            command: command.into(),
            settle,
        });
        self
    }

    /// Append a relay command with a settle in milliseconds.
    #[must_use]
    pub fn relay(self, command: impl Into<String>, settle_ms: u64) -> Self {
        self.send(ChannelRole::Relay, command, millis(settle_ms))
    }

    /// Append a motion command with a settle in milliseconds.
    #[must_use]
    pub fn motion(self, command: impl Into<String>, settle_ms: u64) -> Self {
        self.send(ChannelRole::Motion, command, millis(settle_ms))
    }

    /// Append a pause.
    #[must_use]
    pub fn wait(mut self, ms: u64) -> Self {
        self.steps.push(Step::Wait(millis(ms)));
        self
    }

    /// Append every step of `other`.
    #[must_use]
    pub fn then(mut self, other: Choreography) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The steps in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Commands sent to `role`, in order.
    pub fn commands_for(&self, role: ChannelRole) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Send { role: r, command, .. } if *r == role => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Sum of all settle delays and pauses.
    pub fn duration(&self) -> Duration {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Send { settle, .. } => *settle,
                Step::Wait(d) => *d,
            })
            .sum()
    }

    /// Execute the steps through `dispatcher`.
    pub async fn run(
        &self,
        dispatcher: &CommandDispatcher,
        policy: FailurePolicy,
    ) -> FixtureResult<ChoreographyOutcome> {
        debug!(choreography = %self.name, steps = self.steps.len(), "choreography started");
        let mut outcome = ChoreographyOutcome::default();
        for step in &self.steps {
            match step {
                Step::Wait(d) => {
                    tokio::time::sleep(*d).await;
                    outcome.executed += 1;
                }
                Step::Send { role, command, settle } => match dispatcher.send(*role, command, *settle).await {
                    Ok(()) => outcome.executed += 1,
                    Err(e) if policy == FailurePolicy::Strict => return Err(e),
                    Err(FixtureError::ChannelUnavailable { .. }) => {
                        debug!(choreography = %self.name, %role, command = %command.escape_debug(), "channel closed, step skipped");
                        outcome.skipped += 1;
                    }
                    Err(e) => {
                        warn!(choreography = %self.name, %role, command = %command.escape_debug(), error = %e, "step failed");
                        outcome.failures.push(format!("{}: {e}", command.escape_debug()));
                    }
                },
            }
        }
        if outcome.is_clean() {
            debug!(choreography = %self.name, "choreography finished");
        } else {
            info!(
                choreography = %self.name,
                skipped = outcome.skipped,
                failed = outcome.failures.len(),
                "choreography finished with gaps"
            );
        }
        Ok(outcome)
    }
}

/// Motion homing commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Homing {
    /// First homing command.
    pub home_1: String,
    /// Second homing command.
    pub home_2: String,
    /// Whether the second pass is allowed (camera free to move and finger
    /// piston retracted).
    pub second_pass: bool,
}

impl Default for Homing {
    fn default() -> Self {
        Self {
            home_1: "G28".to_string(),
            home_2: "G28".to_string(),
            second_pass: true,
        }
    }
}

/// Controller initialisation: soft reset, unlock, absolute mode, mm.
pub fn motion_init(protocol: &MotionProtocol) -> Choreography {
    Choreography::new("motion-init")
        .motion(protocol.soft_reset.as_str(), 500)
        .motion(protocol.unlock.as_str(), 200)
        .motion("G90", 100)
        .motion("G21", 100)
}

/// Relay initialisation: release and board disable.
pub fn relay_init(side: FixtureSide) -> Choreography {
    Choreography::new("relay-init")
        .relay(RELEASE, 100)
        .relay(format!("B{side}_0"), 100)
}

/// Bring the actuator into contact with the device on `side`.
pub fn priming(side: FixtureSide) -> Choreography {
    match side {
        FixtureSide::One => Choreography::new("priming-1")
            .relay("K2_1", 2000)
            .motion("G90 X29.787 Y82.987", 3000)
            .relay(PRESS, 1000)
            .relay("K4_1", 500)
            .relay("K7_1", 300)
            .relay("K7_1", 500)
            .relay(RELEASE, 1500),
        FixtureSide::Two => Choreography::new("priming-2")
            .relay("K6_1", 300)
            .relay("K6_1", 500)
            .relay("K1_1", 1000)
            .motion("G90 X394.805 Y77.726", 1000)
            .relay(PRESS, 1000)
            .relay("K3_1", 300)
            .relay(RELEASE, 1500),
    }
}

/// Power the board on `side`.
pub fn power_up(side: FixtureSide) -> Choreography {
    Choreography::new(format!("power-up-{side}"))
        .relay(format!("B{side}_1"), 100)
        .relay(format!("B{side}_1"), 2900)
}

/// Release, power down and re-enable one board.
pub fn board_reset(side: FixtureSide) -> Choreography {
    let lock = match side {
        FixtureSide::One => "K2_0",
        FixtureSide::Two => "K1_0",
    };
    Choreography::new(format!("board-reset-{side}"))
        .relay(RELEASE, 100)
        .relay(format!("B{side}_0"), 500)
        .relay(lock, 500)
        .relay(ENABLE, 0)
}

/// Home the camera stage and park it.
pub fn home_camera(homing: &Homing) -> Choreography {
    let mut choreography = Choreography::new("home-camera")
        .relay("K5_0", 100)
        .relay(RELEASE, 0)
        .motion(homing.home_1.as_str(), 4000)
        .relay("K5_1", 2000);
    if homing.second_pass {
        choreography = choreography
            .motion(homing.home_2.as_str(), 4000)
            .relay("K5_0", 0);
    }
    choreography.wait(300).motion(PARK, 0)
}

/// End of run: release and park.
pub fn finalize(release: &str, park_settle_ms: u64) -> Choreography {
    Choreography::new("finalize")
        .relay(release, 200)
        .motion(PARK, park_settle_ms)
}

/// Known-safe state: stop and unlock motion, reset both boards.
pub fn safe_state(protocol: &MotionProtocol) -> Choreography {
    Choreography::new("safe-state")
        .motion(protocol.soft_reset.as_str(), 200)
        .motion(protocol.unlock.as_str(), 100)
        .then(board_reset(FixtureSide::One))
        .then(board_reset(FixtureSide::Two))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::channel::ChannelBank;
    use crate::hardware::mock::{MockController, MockControllerOptions};
    use std::sync::Arc;

    #[test]
    fn priming_tokens_are_preserved() {
        let side1 = priming(FixtureSide::One);
        assert_eq!(
            side1.commands_for(ChannelRole::Relay),
            vec!["K2_1", "P_1", "K4_1", "K7_1", "K7_1", "P_0"]
        );
        assert_eq!(side1.commands_for(ChannelRole::Motion), vec!["G90 X29.787 Y82.987"]);
        assert_eq!(side1.duration(), Duration::from_millis(8800));

        let side2 = priming(FixtureSide::Two);
        assert_eq!(
            side2.commands_for(ChannelRole::Relay),
            vec!["K6_1", "K6_1", "K1_1", "P_1", "K3_1", "P_0"]
        );
        assert_eq!(side2.commands_for(ChannelRole::Motion), vec!["G90 X394.805 Y77.726"]);
    }

    #[test]
    fn board_resets_differ_by_lock_relay() {
        assert_eq!(
            board_reset(FixtureSide::One).commands_for(ChannelRole::Relay),
            vec!["P_0", "B1_0", "K2_0", "ENA"]
        );
        assert_eq!(
            board_reset(FixtureSide::Two).commands_for(ChannelRole::Relay),
            vec!["P_0", "B2_0", "K1_0", "ENA"]
        );
        assert_eq!(
            power_up(FixtureSide::Two).commands_for(ChannelRole::Relay),
            vec!["B2_1", "B2_1"]
        );
    }

    #[test]
    fn safe_state_unlocks_then_resets_both_boards() {
        let safe = safe_state(&MotionProtocol::default());
        assert_eq!(safe.commands_for(ChannelRole::Motion), vec!["\u{18}", "$X"]);
        assert_eq!(
            safe.commands_for(ChannelRole::Relay),
            vec!["P_0", "B1_0", "K2_0", "ENA", "P_0", "B2_0", "K1_0", "ENA"]
        );
    }

    #[test]
    fn home_camera_second_pass_is_optional() {
        let full = home_camera(&Homing::default());
        assert_eq!(full.commands_for(ChannelRole::Motion), vec!["G28", "G28", "G90 X0 Y0"]);
        assert_eq!(full.commands_for(ChannelRole::Relay), vec!["K5_0", "P_0", "K5_1", "K5_0"]);

        let single = home_camera(&Homing {
            second_pass: false,
            ..Homing::default()
        });
        assert_eq!(single.commands_for(ChannelRole::Motion), vec!["G28", "G90 X0 Y0"]);
    }

    #[test]
    fn finalize_releases_then_parks() {
        let finalize = finalize(RELEASE, 3000);
        assert_eq!(finalize.commands_for(ChannelRole::Relay), vec!["P_0"]);
        assert_eq!(finalize.commands_for(ChannelRole::Motion), vec!["G90 X0 Y0"]);
        assert_eq!(finalize.duration(), Duration::from_millis(3200));
    }

    #[test]
    fn side_parses_from_config_numbers() {
        assert_eq!(FixtureSide::try_from(2).unwrap(), FixtureSide::Two);
        assert!(FixtureSide::try_from(3).is_err());
        assert_eq!(relay_init(FixtureSide::Two).commands_for(ChannelRole::Relay), vec!["P_0", "B2_0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_skips_closed_channels() {
        let channels = Arc::new(ChannelBank::new());
        let (port, relay) = MockController::spawn(ChannelRole::Relay, MockControllerOptions::default());
        channels.get(ChannelRole::Relay).attach(port, "mock-relay").await;
        let dispatcher = CommandDispatcher::new(channels, MotionProtocol::default(), Duration::from_secs(1));

        let outcome = safe_state(&MotionProtocol::default())
            .run(&dispatcher, FailurePolicy::BestEffort)
            .await
            .unwrap();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.executed, 8);
        assert!(outcome.failures.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(relay.commands().len(), 8);

        let strict = safe_state(&MotionProtocol::default())
            .run(&dispatcher, FailurePolicy::Strict)
            .await;
        assert!(matches!(strict, Err(FixtureError::ChannelUnavailable { role: ChannelRole::Motion })));
    }
}
