//! Error taxonomy for the fixture.
//!
//! `FixtureError` is the single error type shared by every subsystem, from the
//! serial transport up to the sequencer. Using `thiserror`, it keeps the
//! failure categories explicit so callers can decide how far an error is
//! allowed to travel:
//!
//! - **Channel faults** (`ChannelUnavailable`, `CommandTimeout`, `Io`) are
//!   swallowed during initialisation and priming, but escape the per-button
//!   boundary of a run and abort it.
//! - **Capture faults** (`CameraUnavailable`, `ReferenceMissing`, `Vision`,
//!   `Infrared`) degrade a single button result and never stop a run.
//! - **Guard rejections** (`RunAlreadyActive`, `MachineNotReady`,
//!   `InvalidTransition`) are returned to the control surface unchanged.
//!
//! `SequenceAborted` is what a run's caller sees when the run ended in the
//! Emergency state.

use thiserror::Error;

use crate::serial::ChannelRole;

/// Convenience alias for results using the fixture error type.
pub type FixtureResult<T> = std::result::Result<T, FixtureError>;

/// Primary error type for the fixture.
#[derive(Error, Debug)]
pub enum FixtureError {
    /// The addressed device channel is not open.
    ///
    /// Returned by the command dispatcher before anything is written. During
    /// a run this means the controller was never connected or was dropped
    /// after an I/O failure.
    #[error("{role} channel is not open")]
    ChannelUnavailable {
        /// Role of the channel that was addressed.
        role: ChannelRole,
    },

    /// A command could not be delivered before its deadline.
    ///
    /// The write side of a serial port can stall when the controller stops
    /// draining its receive buffer; the dispatcher bounds every write.
    #[error("{role} command '{command}' timed out")]
    CommandTimeout {
        /// Channel the command was sent to.
        role: ChannelRole,
        /// The command text, without line terminator.
        command: String,
    },

    /// A camera has no open handle or has not produced a frame yet.
    #[error("camera {camera} unavailable")]
    CameraUnavailable {
        /// One-based camera index.
        camera: u8,
    },

    /// No reference image exists for a button/camera pair.
    ///
    /// Validation is skipped, not failed. The result is recorded as
    /// unvalidated and excluded from approval rates.
    #[error("no reference image for button {button} on camera {camera}")]
    ReferenceMissing {
        /// Zero-based button index.
        button: usize,
        /// One-based camera index.
        camera: u8,
    },

    /// A run was requested while another run holds the run-active flag.
    #[error("a test run is already active")]
    RunAlreadyActive,

    /// The run was aborted into the Emergency state.
    #[error("sequence aborted: {reason}")]
    SequenceAborted {
        /// Human-readable cause, usually the channel fault that escaped.
        reason: String,
    },

    /// The machine state guard refused a transition.
    #[error("invalid machine state transition from {from} to {to}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The machine is not idle (e.g. latched in Emergency until reset).
    #[error("machine is not ready (state: {state})")]
    MachineNotReady {
        /// Current machine state.
        state: String,
    },

    /// Underlying I/O failure (serial port, filesystem).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Semantically invalid configuration or test plan.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Image decoding or processing failed.
    #[error("vision error: {0}")]
    Vision(String),

    /// The infrared collaborator reported a failure.
    #[error("infrared capture failed: {0}")]
    Infrared(String),

    /// Report or payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FixtureError {
    /// Whether this error means a hardware channel can no longer be trusted.
    ///
    /// The sequencer aborts the whole run on these instead of degrading the
    /// current button.
    #[must_use]
    pub fn is_channel_fault(&self) -> bool {
        matches!(
            self,
            FixtureError::ChannelUnavailable { .. }
                | FixtureError::CommandTimeout { .. }
                | FixtureError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_faults_are_classified() {
        assert!(FixtureError::ChannelUnavailable {
            role: ChannelRole::Motion
        }
        .is_channel_fault());
        assert!(FixtureError::Io(std::io::ErrorKind::BrokenPipe.into()).is_channel_fault());
        assert!(!FixtureError::CameraUnavailable { camera: 2 }.is_channel_fault());
        assert!(!FixtureError::RunAlreadyActive.is_channel_fault());
    }

    #[test]
    fn messages_name_the_channel() {
        let err = FixtureError::CommandTimeout {
            role: ChannelRole::Relay,
            command: "P_1".into(),
        };
        assert_eq!(err.to_string(), "relay command 'P_1' timed out");
    }
}
