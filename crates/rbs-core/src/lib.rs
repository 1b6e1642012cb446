//! Core types shared by the RBS fixture crates.
//!
//! - [`error`]: the fixture error taxonomy
//! - [`serial`]: serial transport and channel roles
//! - [`data`]: camera frame type

pub mod data;
pub mod error;
pub mod serial;

pub use data::{Frame, PixelFormat};
pub use error::{FixtureError, FixtureResult};
pub use serial::{ChannelRole, DynSerial, SerialPortIO};
