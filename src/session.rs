//! Device session: single-slot authentication and liveness state for the
//! one actuator controller
//!
//! Lifecycle: created empty at startup, populated on successful
//! authentication, torn down wholesale when the controller connection
//! closes. Exactly one session exists; a new connection presenting valid
//! credentials becomes the session owner, silently superseding bookkeeping
//! left over from a dead connection. There is no takeover negotiation.
//!
//! The session owns the PID engine's runtime state: a dropped controller
//! clears the target as a fail-safe, so a silent reconnect can never
//! resume driving the actuator toward a stale setpoint.

use crate::config::AuthConfig;
use crate::control::{PidController, PidOutput};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Instant;

/// Plaintext acknowledgement sent to a freshly authenticated controller
pub const AUTH_ACK: &str = "Authentication successful";

/// Structured credential payload
///
/// Controllers normally send JSON; older firmware sends the same fields
/// form-encoded (`name=...&password=...`), which is accepted as a
/// fallback.
#[derive(Debug, Deserialize)]
struct Credentials {
    name: String,
    password: String,
}

impl Credentials {
    fn parse(payload: &str) -> Result<Self> {
        if let Ok(creds) = serde_json::from_str::<Credentials>(payload) {
            return Ok(creds);
        }

        // Form-encoded fallback
        if payload.contains('=') {
            let mut name = None;
            let mut password = None;
            for part in payload.split('&') {
                if let Some((key, value)) = part.split_once('=') {
                    match key {
                        "name" => name = Some(value.to_string()),
                        "password" => password = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
            if let (Some(name), Some(password)) = (name, password) {
                return Ok(Credentials { name, password });
            }
        }

        Err(Error::Auth("malformed credential payload".to_string()))
    }
}

/// Single-slot controller session, owner of the PID runtime state
pub struct DeviceSession {
    authenticated: bool,
    peer: Option<SocketAddr>,
    has_target: bool,
    pid: PidController,
}

impl DeviceSession {
    /// Create an empty, unauthenticated session slot
    pub fn new(pid: PidController) -> Self {
        Self {
            authenticated: false,
            peer: None,
            has_target: false,
            pid,
        }
    }

    /// Attempt authentication from a controller's credential payload
    ///
    /// On success the peer address is recorded and the session becomes
    /// authenticated; the caller sends [`AUTH_ACK`] back in plaintext.
    /// On mismatch or malformed payload the caller must close the
    /// connection; the session state is untouched.
    pub fn authenticate(
        &mut self,
        payload: &str,
        peer: SocketAddr,
        expected: &AuthConfig,
    ) -> Result<()> {
        let creds = Credentials::parse(payload)?;
        if creds.name != expected.identity || creds.password != expected.secret {
            return Err(Error::Auth(format!(
                "credential mismatch for identity {:?}",
                creds.name
            )));
        }

        self.authenticated = true;
        self.peer = Some(peer);
        log::info!("Controller authenticated from {}", peer);
        Ok(())
    }

    /// Whether a controller is currently authenticated
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Network address of the authenticated controller
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether an operator target has been set
    pub fn has_target(&self) -> bool {
        self.has_target
    }

    /// Apply a new operator target (radians) and reset PID transients
    pub fn set_target(&mut self, radians: f64, now: Instant) {
        self.pid.set_target(radians, now);
        self.has_target = true;
    }

    /// Record a controller feedback measurement (radians)
    pub fn record_feedback(&mut self, radians: f64) {
        self.pid.set_measurement(radians);
    }

    /// Run one PID step against the latest measurement
    pub fn compute(&mut self, now: Instant) -> PidOutput {
        self.pid.compute(now)
    }

    /// Tear the session down after the controller connection closed
    ///
    /// Clears authentication, the target flag, and the PID target, leaving
    /// a fresh unauthenticated slot.
    pub fn close(&mut self) {
        if self.authenticated {
            log::info!("Controller session closed ({:?})", self.peer);
        }
        self.authenticated = false;
        self.peer = None;
        self.has_target = false;
        self.pid.clear_target();
    }
}
