//! PID computation engine
//!
//! Pure computation: target + measurement + elapsed time in, integer PWM
//! command out. No I/O happens here; the router feeds measurements and
//! timestamps in and dispatches the resulting commands.
//!
//! # Control behavior
//!
//! - **Windowed integral**: the integral term is re-summed each step over a
//!   bounded window of recent `(error, dt)` samples, with an anti-windup
//!   magnitude clamp. Sustained large error (transients right after a new
//!   target) resets the accumulator entirely.
//! - **Dynamic ceiling**: the effective output ceiling shrinks as the error
//!   shrinks, giving coarse-then-fine control.
//! - **Minimum-drive floor**: outside the deadband, output magnitude is
//!   raised to the minimum PWM that overcomes static friction, always in
//!   the direction of the error.
//! - **Deadband**: inside the stop margin the output is exactly zero. The
//!   zero command is still dispatched so the actuator receives an explicit
//!   stop rather than silence.

use std::collections::VecDeque;
use std::time::Instant;

/// Number of (error, dt) samples kept in the sliding integral window
const INTEGRAL_WINDOW_LEN: usize = 30;

/// |error| (radians, ~57 degrees) at or above which the integral
/// accumulator and window reset, preventing windup during large-step
/// transients
const LARGE_ERROR_CUTOFF: f64 = 1.0;

/// Numerical-stability floor on dt (seconds). A compute call arriving
/// sooner than this after the previous one is a no-op rather than a
/// division by a near-zero interval. dt of exactly zero (same-instant
/// compute right after a target change) is still computed, with the
/// derivative term forced to zero.
const MIN_DT: f64 = 0.001;

/// Error band (degrees) above which the full PWM ceiling applies
const FULL_POWER_BAND_DEG: f64 = 30.0;

/// Error band (degrees) above which the medium PWM ceiling applies
const MEDIUM_POWER_BAND_DEG: f64 = 10.0;

/// Ceiling factor for the medium error band
const MEDIUM_POWER_FACTOR: f64 = 0.7;

/// Ceiling factor for the fine-control band
const FINE_POWER_FACTOR: f64 = 0.4;

/// PID gain constants, fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Output limits and deadband, fixed at construction
#[derive(Debug, Clone, Copy)]
pub struct PidLimits {
    /// Minimum PWM magnitude needed to overcome static friction
    pub min_pwm: f64,
    /// Maximum PWM magnitude
    pub max_pwm: f64,
    /// Deadband radius (radians) around the target
    pub stop_margin: f64,
    /// Anti-windup clamp on the integral accumulator
    pub max_integral: f64,
}

/// Result of one compute step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidOutput {
    /// Integer PWM magnitude with implicit sign (direction)
    pub pwm: i32,
    /// target - current, radians
    pub error: f64,
    /// True when the error is inside the deadband
    pub at_target: bool,
}

impl PidOutput {
    fn zero() -> Self {
        Self {
            pwm: 0,
            error: 0.0,
            at_target: false,
        }
    }
}

/// PID controller runtime state
///
/// Owned exclusively by the device session; mutated only through the
/// operations below.
pub struct PidController {
    gains: PidGains,
    limits: PidLimits,
    /// Sliding window of (error, dt) samples for the windowed integral
    window: VecDeque<(f64, f64)>,
    integral: f64,
    prev_error: f64,
    prev_time: Option<Instant>,
    /// Unset until the first operator command arrives
    target: Option<f64>,
    /// Last known measurement (radians)
    current: f64,
}

/// Direction of a value: -1, 0, or +1 (zero stays zero, unlike
/// `f64::signum`)
fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl PidController {
    /// Create a new controller with no target set
    pub fn new(gains: PidGains, limits: PidLimits) -> Self {
        Self {
            gains,
            limits,
            window: VecDeque::with_capacity(INTEGRAL_WINDOW_LEN),
            integral: 0.0,
            prev_error: 0.0,
            prev_time: None,
            target: None,
            current: 0.0,
        }
    }

    /// Set a new target angle (radians) and reset transient state
    ///
    /// Clears the integral window and previous-error history so the
    /// derivative term cannot spike from stale samples across a setpoint
    /// change, and anchors the timestamp at `now`.
    pub fn set_target(&mut self, radians: f64, now: Instant) {
        self.target = Some(radians);
        self.integral = 0.0;
        self.window.clear();
        self.prev_error = 0.0;
        self.prev_time = Some(now);
    }

    /// Clear the target and all transient state
    ///
    /// Called when the controller connection drops, so a stale target can
    /// never resume driving the actuator after a silent reconnect.
    pub fn clear_target(&mut self) {
        self.target = None;
        self.integral = 0.0;
        self.window.clear();
        self.prev_error = 0.0;
        self.prev_time = None;
    }

    /// Current target angle (radians), if one has been set
    pub fn target(&self) -> Option<f64> {
        self.target
    }

    /// Record the latest measured angle (radians)
    pub fn set_measurement(&mut self, radians: f64) {
        self.current = radians;
    }

    /// Last known measured angle (radians)
    pub fn measurement(&self) -> f64 {
        self.current
    }

    /// Current value of the windowed integral accumulator
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Run one PID step against the last recorded measurement
    ///
    /// Returns a zero command without touching any state when no target
    /// has been set yet ("no operator input yet").
    pub fn compute(&mut self, now: Instant) -> PidOutput {
        let Some(target) = self.target else {
            return PidOutput::zero();
        };

        let error = target - self.current;
        let at_target = error.abs() < self.limits.stop_margin;

        let dt = self
            .prev_time
            .map(|t| now.saturating_duration_since(t).as_secs_f64())
            .unwrap_or(0.0);

        // Guard against dividing by a near-zero interval: a compute call
        // landing inside the stability floor is a no-op. dt == 0 (the
        // same-instant compute immediately after set_target) still runs,
        // with derivative and integral contributions of zero.
        if dt > 0.0 && dt < MIN_DT {
            return PidOutput {
                pwm: 0,
                error,
                at_target,
            };
        }

        // Windowed integral with anti-windup: accumulate only while the
        // error is inside the cutoff, otherwise reset entirely.
        if error.abs() < LARGE_ERROR_CUTOFF {
            if self.window.len() == INTEGRAL_WINDOW_LEN {
                self.window.pop_front();
            }
            self.window.push_back((error, dt));
            let sum: f64 = self.window.iter().map(|(e, dt)| e * dt).sum();
            self.integral = sum.clamp(-self.limits.max_integral, self.limits.max_integral);
        } else {
            self.integral = 0.0;
            self.window.clear();
        }

        let derivative = if dt > 0.0 {
            (error - self.prev_error) / dt
        } else {
            0.0
        };

        let mut output = self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * derivative;

        // Dynamic ceiling: full power for large errors, reduced power as
        // the actuator closes in
        let error_deg = error.abs().to_degrees();
        let ceiling = if error_deg > FULL_POWER_BAND_DEG {
            self.limits.max_pwm
        } else if error_deg > MEDIUM_POWER_BAND_DEG {
            self.limits.max_pwm * MEDIUM_POWER_FACTOR
        } else {
            self.limits.max_pwm * FINE_POWER_FACTOR
        };

        if error.abs() > self.limits.stop_margin {
            // Minimum drive to overcome static friction
            if output.abs() < self.limits.min_pwm {
                output = sign(output) * self.limits.min_pwm;
            }
            // A degenerate near-zero output can point the wrong way;
            // the drive direction must match the error direction
            if sign(output) != sign(error) {
                output = sign(error) * self.limits.min_pwm;
            }
        }

        output = output.clamp(-ceiling, ceiling);

        // Deadband: exactly zero inside the stop margin. The caller still
        // dispatches this command as an explicit stop.
        if at_target {
            output = 0.0;
        }

        self.prev_error = error;
        self.prev_time = Some(now);

        PidOutput {
            pwm: output.round() as i32,
            error,
            at_target,
        }
    }
}
