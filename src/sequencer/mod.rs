//! Test orchestration: machine state, choreographies, the run loop and
//! emergency recovery.

pub mod choreography;
pub mod emergency;
pub mod engine;
pub mod state;

pub use choreography::{Choreography, FailurePolicy, FixtureSide, Homing};
pub use emergency::EmergencyController;
pub use engine::{InfraredStage, RunHandle, Sequencer, SequencerSettings};
pub use state::{MachineState, MachineStateCell, RunFlags, RunGuard};
