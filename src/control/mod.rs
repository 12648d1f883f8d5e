//! Closed-loop control for the remote actuator

pub mod pid;

pub use pid::{PidController, PidGains, PidLimits, PidOutput};
