//! # RBS fixture core
//!
//! Orchestration for the automated remote-control test fixture: a motion
//! stage positions a pneumatic actuator over each button of a remote,
//! cameras photograph the device under test, frames are compared against
//! reference images and the results are aggregated into a per-run report.
//!
//! ## Crate structure
//!
//! - **`config`**: Figment-backed configuration (`config/fixture.toml` plus
//!   `RBS_` environment overrides).
//! - **`controller`**: the [`Controller`](controller::Controller) that owns
//!   all shared state and exposes the fixture's operations.
//! - **`hardware`**: serial channels, command dispatch, camera acquisition,
//!   infrared capture and mock devices.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`plan`**: the ordered list of buttons visited by a run.
//! - **`report`**: per-button results, group aggregation and run archives.
//! - **`sequencer`**: machine state, choreographies, the emergency path and
//!   the run engine.
//! - **`trigger`**: the physical start-button listener.
//! - **`vision`**: frame normalisation and similarity scoring.

pub mod config;
pub mod controller;
pub mod hardware;
pub mod logging;
pub mod plan;
pub mod report;
pub mod sequencer;
pub mod trigger;
pub mod vision;

pub use rbs_core::{ChannelRole, FixtureError, FixtureResult, Frame, PixelFormat};
