//! Configuration for the ServoLink relay daemon
//!
//! Loads configuration from a TOML file: network endpoints and downlink
//! shape, PID tuning constants, controller credentials, secure framing
//! flags, and logging.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub control: ControlConfig,
    pub auth: AuthConfig,
    pub framing: FramingConfig,
    pub logging: LoggingConfig,
}

/// Which transport carries commands back to the controller
///
/// Selected by deployment configuration, never at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownlinkMode {
    /// Commands go back over the controller's own bidirectional connection
    Socket,
    /// Commands go out as fire-and-forget datagrams to the controller's
    /// address and the fixed `command_port`
    Datagram,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// TCP bind address for operator and controller connections
    ///
    /// Examples:
    /// - `0.0.0.0:8765` - Bind to all interfaces on port 8765
    /// - `127.0.0.1:8765` - Localhost only
    pub listen_address: String,

    /// Downlink transport shape
    pub downlink: DownlinkMode,

    /// Destination port for datagram commands (datagram downlink only)
    pub command_port: u16,

    /// Settling delay after broadcasting a RESET to the controller,
    /// before the first post-reset command is dispatched. 0 disables
    /// the RESET/settle sequence entirely.
    pub reset_settle_ms: u64,
}

/// PID tuning constants
///
/// Defaults are the calibrated values for the reference actuator rig.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Minimum PWM magnitude needed to overcome static friction
    pub min_pwm: f64,
    /// Maximum PWM magnitude
    pub max_pwm: f64,
    /// Deadband radius around the target (radians) inside which the
    /// output is forced to zero
    pub stop_margin: f64,
    /// Anti-windup clamp on the integral accumulator
    pub max_integral: f64,
}

/// Controller credentials, compared by exact value
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub identity: String,
    pub secret: String,
}

/// Secure framing boundary flags
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Wrap outbound commands / unwrap inbound payloads with the
    /// injected frame codec. Plaintext deployments leave this off.
    pub enabled: bool,
    /// Fall back to sending a plaintext command if encoding fails
    pub plaintext_fallback: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub output: String,
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for the reference single-actuator rig
    ///
    /// Suitable for testing and development. Production deployments
    /// should use a proper TOML configuration file.
    pub fn rig_defaults() -> Self {
        Self {
            network: NetworkConfig {
                listen_address: "0.0.0.0:8765".to_string(),
                downlink: DownlinkMode::Socket,
                command_port: 8766,
                reset_settle_ms: 500,
            },
            control: ControlConfig {
                kp: 1.7,
                ki: 0.3,
                kd: 0.4,
                min_pwm: 10.0,
                max_pwm: 50.0,
                stop_margin: 0.017, // ~1 degree
                max_integral: 5.0,
            },
            auth: AuthConfig {
                identity: "Sean".to_string(),
                secret: "bayar10rb".to_string(),
            },
            framing: FramingConfig {
                enabled: false,
                plaintext_fallback: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                output: "stdout".to_string(),
            },
        }
    }

    /// Sanity-check values that would misconfigure the control loop
    pub fn validate(&self) -> Result<()> {
        if self.control.min_pwm < 0.0 || self.control.max_pwm <= 0.0 {
            return Err(Error::Config(
                "control.min_pwm must be >= 0 and control.max_pwm > 0".to_string(),
            ));
        }
        if self.control.min_pwm > self.control.max_pwm {
            return Err(Error::Config(
                "control.min_pwm must not exceed control.max_pwm".to_string(),
            ));
        }
        if self.control.stop_margin < 0.0 {
            return Err(Error::Config(
                "control.stop_margin must be non-negative".to_string(),
            ));
        }
        if self.control.max_integral < 0.0 {
            return Err(Error::Config(
                "control.max_integral must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::rig_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::rig_defaults();
        assert_eq!(config.network.listen_address, "0.0.0.0:8765");
        assert_eq!(config.network.downlink, DownlinkMode::Socket);
        assert_eq!(config.network.command_port, 8766);
        assert_eq!(config.control.kp, 1.7);
        assert_eq!(config.control.max_pwm, 50.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::rig_defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        // Should contain all sections
        assert!(toml_string.contains("[network]"));
        assert!(toml_string.contains("[control]"));
        assert!(toml_string.contains("[auth]"));
        assert!(toml_string.contains("[framing]"));
        assert!(toml_string.contains("[logging]"));

        // Should contain key values
        assert!(toml_string.contains("kp = 1.7"));
        assert!(toml_string.contains("downlink = \"socket\""));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[network]
listen_address = "127.0.0.1:9000"
downlink = "datagram"
command_port = 9001
reset_settle_ms = 0

[control]
kp = 2.0
ki = 0.1
kd = 0.05
min_pwm = 5.0
max_pwm = 100.0
stop_margin = 0.01
max_integral = 4.0

[auth]
identity = "controller-1"
secret = "hunter2"

[framing]
enabled = false
plaintext_fallback = false

[logging]
level = "debug"
output = "stdout"
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.network.downlink, DownlinkMode::Datagram);
        assert_eq!(config.network.command_port, 9001);
        assert_eq!(config.control.kp, 2.0);
        assert_eq!(config.auth.identity, "controller-1");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_rejects_inverted_pwm_limits() {
        let mut config = AppConfig::rig_defaults();
        config.control.min_pwm = 60.0;
        assert!(config.validate().is_err());
    }
}
