//! Message router: the single owner of all mutable control state
//!
//! The router consumes typed connection events from one channel and
//! drives the device session, the PID engine, and the observer registry.
//! Because every event is handled to completion on the router thread,
//! PID state transitions are linearizable: no two measurement-driven or
//! target-driven recomputations can interleave.
//!
//! The one deliberate exception is the post-reset settling delay. It is
//! realized as a detached timer thread posting a [`RouterEvent::SettleExpired`]
//! event, so the router keeps processing controller feedback during the
//! window; such feedback computes against the already-applied new target.
//!
//! Every error in this module is recovered locally: the offending message
//! is logged and dropped, and only an authentication failure additionally
//! closes the connection. Nothing here is fatal to the process.

use crate::config::{AppConfig, AuthConfig};
use crate::control::{PidController, PidGains, PidLimits};
use crate::error::Error;
use crate::framing::FrameCodec;
use crate::session::{DeviceSession, AUTH_ACK};
use crate::transport::{
    Downlink, ObserverRegistry, PeerHandle, PeerId, Role, RouterEvent,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Sentinel broadcast to the controller when a new setpoint arrives, so
/// its firmware can clear its own transient state
pub const RESET_COMMAND: &str = "RESET";

/// Literal sentinel a controller sends to acknowledge a reset; recognized
/// and discarded without further processing
pub const RESET_ACK: &str = "Position Reset";

/// Dispatcher reacting to typed connection events
pub struct Router {
    session: DeviceSession,
    observers: ObserverRegistry,
    /// Connection handle of the current session owner
    controller: Option<PeerHandle>,
    /// All live peers, for role lookup on message events
    peers: HashMap<PeerId, PeerHandle>,
    downlink: Downlink,
    codec: Option<Box<dyn FrameCodec>>,
    plaintext_fallback: bool,
    settle: Duration,
    /// Bumped on every new setpoint; expiry events from superseded
    /// settle timers are ignored
    settle_generation: u64,
    auth: AuthConfig,
    events_tx: Sender<RouterEvent>,
}

impl Router {
    /// Create a router from the deployment configuration
    ///
    /// `codec` is the externally injected cipher capability; `None` is a
    /// plaintext deployment that skips the framing boundary entirely.
    pub fn new(
        config: &AppConfig,
        downlink: Downlink,
        codec: Option<Box<dyn FrameCodec>>,
        events_tx: Sender<RouterEvent>,
    ) -> Self {
        let pid = PidController::new(
            PidGains {
                kp: config.control.kp,
                ki: config.control.ki,
                kd: config.control.kd,
            },
            PidLimits {
                min_pwm: config.control.min_pwm,
                max_pwm: config.control.max_pwm,
                stop_margin: config.control.stop_margin,
                max_integral: config.control.max_integral,
            },
        );

        Self {
            session: DeviceSession::new(pid),
            observers: ObserverRegistry::new(),
            controller: None,
            peers: HashMap::new(),
            downlink,
            codec,
            plaintext_fallback: config.framing.plaintext_fallback,
            settle: Duration::from_millis(config.network.reset_settle_ms),
            settle_generation: 0,
            auth: config.auth.clone(),
            events_tx,
        }
    }

    /// Consume events until shutdown or the event channel closes
    pub fn run(&mut self, events: Receiver<RouterEvent>, running: Arc<AtomicBool>) {
        log::info!("Router started");

        while running.load(Ordering::Relaxed) {
            match events.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::info!("Router stopped");
    }

    /// Handle one event to completion
    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Connected(handle) => {
                self.peers.insert(handle.id, handle.clone());
                if handle.role == Role::Operator {
                    self.observers.insert(handle);
                }
            }
            RouterEvent::Message { peer, text } => {
                let Some(handle) = self.peers.get(&peer).cloned() else {
                    log::debug!("Message from unknown peer {}", peer);
                    return;
                };
                match handle.role {
                    Role::Operator => self.handle_operator_message(&text),
                    Role::Controller => self.handle_controller_message(handle, &text),
                }
            }
            RouterEvent::Closed(id) => self.handle_closed(id),
            RouterEvent::SettleExpired { generation } => {
                // Ignore timers superseded by a newer setpoint
                if generation != self.settle_generation {
                    return;
                }
                if self.session.is_authenticated() && self.session.has_target() {
                    let output = self.session.compute(Instant::now());
                    self.dispatch_command(output.pwm);
                }
            }
        }
    }

    /// Operator setpoint: numeric degrees, converted to radians here so
    /// the whole control core works in one unit
    fn handle_operator_message(&mut self, text: &str) {
        let payload = self.unwrap_setpoint(text);
        let degrees: f64 = match payload.trim().parse() {
            Ok(v) if f64::is_finite(v) => v,
            _ => {
                log::warn!(
                    "{}",
                    Error::Parse(format!("setpoint {:?} is not numeric", payload))
                );
                return;
            }
        };

        log::info!("Received setpoint: {}°", degrees);
        let now = Instant::now();
        self.session.set_target(degrees.to_radians(), now);

        if !self.session.is_authenticated() {
            log::debug!("No authenticated controller; target stored until one connects");
            return;
        }

        if self.settle > Duration::ZERO {
            // Tell the actuator firmware to clear its own transient
            // state, then defer the first post-reset command. Only this
            // dispatch waits; feedback keeps flowing through the router.
            self.broadcast_reset();
            self.settle_generation += 1;
            let generation = self.settle_generation;
            let delay = self.settle;
            let tx = self.events_tx.clone();
            let timer = thread::Builder::new()
                .name("settle-timer".to_string())
                .spawn(move || {
                    thread::sleep(delay);
                    let _ = tx.send(RouterEvent::SettleExpired { generation });
                });
            if let Err(e) = timer {
                log::error!("Failed to spawn settle timer: {}", e);
            }
        } else {
            let output = self.session.compute(now);
            self.dispatch_command(output.pwm);
        }
    }

    /// Controller traffic: authentication until this connection owns the
    /// session, feedback afterwards
    fn handle_controller_message(&mut self, handle: PeerHandle, text: &str) {
        let is_owner = self.session.is_authenticated()
            && self.controller.as_ref().map(|h| h.id) == Some(handle.id);
        if !is_owner {
            self.handle_auth_attempt(handle, text);
            return;
        }

        // Reset acknowledgement is always plaintext
        if text == RESET_ACK {
            log::debug!("Position reset confirmed by controller");
            return;
        }

        let payload = match &self.codec {
            Some(codec) => match codec.decode(text) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::warn!("Feedback dropped: {}", e);
                    return;
                }
            },
            None => text.to_string(),
        };

        let radians: f64 = match payload.trim().parse() {
            Ok(v) if f64::is_finite(v) => v,
            _ => {
                log::warn!(
                    "{}",
                    Error::Parse(format!("feedback {:?} is not numeric", payload))
                );
                return;
            }
        };

        self.session.record_feedback(radians);
        log::debug!("Position feedback: {:.2}°", radians.to_degrees());

        // Observers always receive the raw measurement
        self.observers.broadcast(&radians.to_string());

        if self.session.has_target() {
            let output = self.session.compute(Instant::now());
            self.dispatch_command(output.pwm);
        }
    }

    /// First message from a connection that does not own the session:
    /// treat as credentials. Valid credentials become the new session
    /// owner, superseding any bookkeeping left by a dead connection.
    fn handle_auth_attempt(&mut self, handle: PeerHandle, text: &str) {
        let payload = match &self.codec {
            Some(codec) => match codec.decode(text) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::warn!("Credential frame from {} rejected: {}", handle.addr, e);
                    handle.shutdown();
                    return;
                }
            },
            None => text.to_string(),
        };

        match self.session.authenticate(&payload, handle.addr, &self.auth) {
            Ok(()) => {
                handle.send_line(AUTH_ACK);
                self.controller = Some(handle);
            }
            Err(e) => {
                log::warn!("{} (peer {})", e, handle.addr);
                handle.shutdown();
            }
        }
    }

    /// Connection close: the only cancellation primitive. Tears down the
    /// role-specific state unconditionally.
    fn handle_closed(&mut self, id: PeerId) {
        let Some(handle) = self.peers.remove(&id) else {
            return;
        };
        match handle.role {
            Role::Operator => {
                self.observers.remove(id);
                log::info!("Operator client disconnected: {}", handle.addr);
            }
            Role::Controller => {
                if self.controller.as_ref().map(|h| h.id) == Some(id) {
                    self.controller = None;
                    // Fail-safe: a dropped controller never leaves a stale
                    // target that would resume driving on reconnect
                    self.session.close();
                } else {
                    log::debug!("Non-session controller connection {} closed", handle.addr);
                }
            }
        }
    }

    /// Unwrap an operator setpoint. Framed deployments still accept raw
    /// numeric payloads from older operator pages, so a failed decode
    /// falls back to parsing the text as-is.
    fn unwrap_setpoint(&self, text: &str) -> String {
        match &self.codec {
            Some(codec) => match codec.decode(text) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    log::debug!("Setpoint decode failed ({}), trying raw parse", e);
                    text.to_string()
                }
            },
            None => text.to_string(),
        }
    }

    /// Send the RESET sentinel to the session owner
    fn broadcast_reset(&self) {
        let Some(handle) = &self.controller else {
            return;
        };
        let wire = match &self.codec {
            Some(codec) => match codec.encode(RESET_COMMAND) {
                Ok(token) => token,
                Err(e) => {
                    if self.plaintext_fallback {
                        log::warn!("Frame encode failed ({}), sending plaintext RESET", e);
                        RESET_COMMAND.to_string()
                    } else {
                        log::error!("Frame encode failed, RESET dropped: {}", e);
                        return;
                    }
                }
            },
            None => RESET_COMMAND.to_string(),
        };
        if !handle.send_line(wire) {
            log::warn!("Controller {} unreachable for RESET", handle.addr);
        }
    }

    /// Dispatch one PWM command over the configured downlink
    ///
    /// Send failures are logged and never retried; the next feedback
    /// cycle naturally re-attempts dispatch.
    fn dispatch_command(&mut self, pwm: i32) {
        let payload = pwm.to_string();
        let wire = match &self.codec {
            Some(codec) => match codec.encode(&payload) {
                Ok(token) => token,
                Err(e) => {
                    if self.plaintext_fallback {
                        log::warn!("Frame encode failed ({}), sending plaintext command", e);
                        payload
                    } else {
                        log::error!("Frame encode failed, command dropped: {}", e);
                        return;
                    }
                }
            },
            None => payload,
        };

        let result = self.downlink.dispatch(
            self.controller.as_ref(),
            self.session.peer().map(|addr| addr.ip()),
            &wire,
        );
        if let Err(e) = result {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::tests::{BrokenEncoder, HexCodec};
    use crate::transport::Outbound;
    use crossbeam_channel::Receiver;

    const CREDS: &str = r#"{"name": "Sean", "password": "bayar10rb"}"#;

    fn test_router(settle_ms: u64, codec: Option<Box<dyn FrameCodec>>) -> Router {
        let mut config = AppConfig::rig_defaults();
        config.network.reset_settle_ms = settle_ms;
        test_router_cfg(config, codec)
    }

    fn test_router_cfg(config: AppConfig, codec: Option<Box<dyn FrameCodec>>) -> Router {
        let (tx, _rx) = crossbeam_channel::unbounded();
        Router::new(&config, Downlink::Socket, codec, tx)
    }

    fn connect(router: &mut Router, id: PeerId, role: Role) -> Receiver<Outbound> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let addr = format!("127.0.0.1:{}", 41000 + id).parse().unwrap();
        let handle = PeerHandle::new(id, addr, role, tx);
        router.handle_event(RouterEvent::Connected(handle));
        rx
    }

    fn message(router: &mut Router, id: PeerId, text: &str) {
        router.handle_event(RouterEvent::Message {
            peer: id,
            text: text.to_string(),
        });
    }

    fn next_line(rx: &Receiver<Outbound>) -> Option<String> {
        match rx.try_recv() {
            Ok(Outbound::Line(line)) => Some(line),
            _ => None,
        }
    }

    #[test]
    fn controller_authenticates_and_gets_ack() {
        let mut router = test_router(0, None);
        let rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);

        assert_eq!(next_line(&rx).as_deref(), Some(AUTH_ACK));
        assert!(router.session.is_authenticated());
    }

    #[test]
    fn bad_credentials_close_the_connection() {
        let mut router = test_router(0, None);
        let rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, r#"{"name": "Sean", "password": "wrong"}"#);

        assert!(matches!(rx.try_recv(), Ok(Outbound::Shutdown)));
        assert!(!router.session.is_authenticated());
        assert!(!router.session.has_target());
    }

    #[test]
    fn setpoint_then_feedback_drives_commands() {
        let mut router = test_router(0, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 1, CREDS);
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(AUTH_ACK));

        // 90 degree setpoint from 0: first command is the friction floor
        message(&mut router, 2, "90");
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some("10"));

        // Feedback updates observers and produces a fresh command
        message(&mut router, 1, "0.5");
        assert_eq!(next_line(&obs_rx).as_deref(), Some("0.5"));
        let cmd = next_line(&ctrl_rx).expect("command after feedback");
        cmd.parse::<i32>().expect("command is an integer PWM");
    }

    #[test]
    fn setpoint_without_controller_is_stored() {
        let mut router = test_router(0, None);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "45");
        assert!(router.session.has_target());
        assert!(next_line(&obs_rx).is_none());

        // Controller arrives later; its first feedback gets a command
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(AUTH_ACK));
        message(&mut router, 1, "0.0");
        assert!(next_line(&ctrl_rx).is_some());
    }

    #[test]
    fn reset_ack_is_discarded() {
        let mut router = test_router(0, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        message(&mut router, 1, RESET_ACK);
        assert!(next_line(&obs_rx).is_none());
        assert!(next_line(&ctrl_rx).is_none());
    }

    #[test]
    fn malformed_feedback_is_dropped() {
        let mut router = test_router(0, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        message(&mut router, 1, "definitely not an angle");
        assert!(next_line(&obs_rx).is_none());
        assert!(next_line(&ctrl_rx).is_none());
        assert!(router.session.is_authenticated());
    }

    #[test]
    fn malformed_setpoint_is_dropped() {
        let mut router = test_router(0, None);
        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "ninety");
        assert!(!router.session.has_target());
    }

    #[test]
    fn controller_close_clears_session_and_target() {
        let mut router = test_router(0, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);
        message(&mut router, 2, "90");
        next_line(&ctrl_rx);
        assert!(router.session.has_target());

        router.handle_event(RouterEvent::Closed(1));
        assert!(!router.session.is_authenticated());
        assert!(!router.session.has_target());
        drop(obs_rx);
    }

    #[test]
    fn broadcast_after_observer_disconnect_reaches_only_remaining() {
        let mut router = test_router(0, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_a = connect(&mut router, 2, Role::Operator);
        let obs_b = connect(&mut router, 3, Role::Operator);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        router.handle_event(RouterEvent::Closed(3));
        drop(obs_b);

        message(&mut router, 1, "0.25");
        assert_eq!(next_line(&obs_a).as_deref(), Some("0.25"));
    }

    #[test]
    fn settle_delay_defers_first_dispatch() {
        let mut router = test_router(500, None);
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        message(&mut router, 1, "0.0");
        message(&mut router, 1, "0.0"); // establish prev state
        while next_line(&ctrl_rx).is_some() {}

        let obs = connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "90");

        // RESET goes out immediately; the command waits for the timer
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(RESET_COMMAND));
        assert!(next_line(&ctrl_rx).is_none());

        // Feedback during the window is still processed
        message(&mut router, 1, "0.1");
        assert_eq!(next_line(&obs).as_deref(), Some("0.1"));
        assert!(next_line(&ctrl_rx).is_some());

        // Expiry of the current generation dispatches; stale ones do not
        router.handle_event(RouterEvent::SettleExpired { generation: 0 });
        assert!(next_line(&ctrl_rx).is_none());
        let generation = router.settle_generation;
        router.handle_event(RouterEvent::SettleExpired { generation });
        assert!(next_line(&ctrl_rx).is_some());
    }

    #[test]
    fn framed_deployment_encodes_commands_and_decodes_feedback() {
        let codec = HexCodec;
        let mut router = test_router(0, Some(Box::new(HexCodec)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);

        let framed_creds = codec.encode(CREDS).unwrap();
        message(&mut router, 1, &framed_creds);
        // Acknowledgement stays plaintext
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(AUTH_ACK));

        message(&mut router, 2, &codec.encode("90").unwrap());
        let cmd = next_line(&ctrl_rx).expect("framed command");
        assert_eq!(codec.decode(&cmd).unwrap(), "10");

        // Framed feedback round-trips; observers still get the raw angle
        message(&mut router, 1, &codec.encode("0.5").unwrap());
        assert_eq!(next_line(&obs_rx).as_deref(), Some("0.5"));
    }

    #[test]
    fn corrupted_feedback_frame_is_dropped_not_fatal() {
        let codec = HexCodec;
        let mut router = test_router(0, Some(Box::new(HexCodec)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        let obs_rx = connect(&mut router, 2, Role::Operator);
        message(&mut router, 1, &codec.encode(CREDS).unwrap());
        next_line(&ctrl_rx);

        message(&mut router, 1, "hx:zzzz");
        assert!(next_line(&obs_rx).is_none());
        assert!(router.session.is_authenticated());
    }

    #[test]
    fn corrupted_credential_frame_closes_connection() {
        let mut router = test_router(0, Some(Box::new(HexCodec)));
        let rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, "hx:zz");
        assert!(matches!(rx.try_recv(), Ok(Outbound::Shutdown)));
        assert!(!router.session.is_authenticated());
    }

    #[test]
    fn encode_failure_with_fallback_sends_plaintext_command() {
        let mut router = test_router(0, Some(Box::new(BrokenEncoder)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(AUTH_ACK));

        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "90");
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some("10"));
    }

    #[test]
    fn encode_failure_without_fallback_drops_command() {
        let mut config = AppConfig::rig_defaults();
        config.network.reset_settle_ms = 0;
        config.framing.plaintext_fallback = false;
        let mut router = test_router_cfg(config, Some(Box::new(BrokenEncoder)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(AUTH_ACK));

        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "90");
        // Target is applied, but nothing plaintext leaks onto the wire
        assert!(next_line(&ctrl_rx).is_none());
        assert!(router.session.has_target());
    }

    #[test]
    fn encode_failure_with_fallback_sends_plaintext_reset() {
        let mut router = test_router(500, Some(Box::new(BrokenEncoder)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "90");
        assert_eq!(next_line(&ctrl_rx).as_deref(), Some(RESET_COMMAND));
    }

    #[test]
    fn encode_failure_without_fallback_drops_reset() {
        let mut config = AppConfig::rig_defaults();
        config.framing.plaintext_fallback = false;
        let mut router = test_router_cfg(config, Some(Box::new(BrokenEncoder)));
        let ctrl_rx = connect(&mut router, 1, Role::Controller);
        message(&mut router, 1, CREDS);
        next_line(&ctrl_rx);

        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "90");
        assert!(next_line(&ctrl_rx).is_none());
    }

    #[test]
    fn plaintext_setpoint_accepted_on_framed_deployment() {
        let mut router = test_router(0, Some(Box::new(HexCodec)));
        connect(&mut router, 2, Role::Operator);
        message(&mut router, 2, "45");
        assert!(router.session.has_target());
    }
}
