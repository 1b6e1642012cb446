//! Image validation.
//!
//! - [`process`]: frame normalisation
//! - [`similarity`]: template and histogram scores
//! - [`reference`]: reference image naming and lookup
//! - [`validator`]: per-camera pass/fail decision

pub mod process;
pub mod reference;
pub mod similarity;
pub mod validator;

pub use validator::{ImageValidator, ValidationResult, BUTTON_APPROVAL_THRESHOLD};
