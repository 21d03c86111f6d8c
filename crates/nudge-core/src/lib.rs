//! # Nudge Core
//!
//! Configuration and error types shared by the scheduler, the gateway and
//! the `nudge` binary.

pub mod config;
pub mod error;

pub use config::NudgeConfig;
pub use error::{NudgeError, Result};
