//! Fixture hardware.
//!
//! - [`channel`]: line-oriented serial channels, one per controller role
//! - [`dispatcher`]: command dispatch with motion-controller readiness checks
//! - [`camera`]: per-camera acquisition threads
//! - `device_camera`: local camera devices (feature `camera_device`)
//! - [`infrared`]: infrared capture backends
//! - [`mock`]: simulated controllers and cameras

pub mod camera;
pub mod channel;
#[cfg(feature = "camera_device")]
pub mod device_camera;
pub mod dispatcher;
pub mod infrared;
pub mod mock;

pub use camera::{CameraBank, CameraManager, CameraState, CameraStatus, FrameSource, Rotation};
pub use channel::{ChannelBank, ChannelStatus, DeviceChannel};
pub use dispatcher::{CommandDispatcher, MotionProtocol, MotionStatus};
pub use infrared::{InfraredCapture, InfraredOutcome, KnownCodes};
