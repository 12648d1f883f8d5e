//! ServoLink - relay daemon bridging browser operators to a remote
//! actuator controller
//!
//! Operators send angle setpoints and watch live position; the single
//! authenticated controller streams position feedback and receives PWM
//! commands computed by a closed-loop PID engine. Commands travel back
//! either over the controller's own connection or as fire-and-forget
//! datagrams, selected by configuration.
//!
//! Deployments needing an encrypted wire implement [`framing::FrameCodec`]
//! and hand it to [`app::ServoLinkApp::with_codec`].

pub mod app;
pub mod config;
pub mod control;
pub mod error;
pub mod framing;
pub mod router;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use app::ServoLinkApp;
pub use config::AppConfig;
pub use error::{Error, Result};
