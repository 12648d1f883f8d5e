//! ServoLink daemon entry point
//!
//! ## Protocol Architecture
//!
//! - **TCP (port 8765)**: Operator and controller connections (setpoints,
//!   credentials, feedback, broadcasts)
//! - **UDP (port 8766)**: Optional datagram downlink for PWM commands
//!   (fire-and-forget)
//!
//! The first line of each TCP connection classifies its role: browser
//! operator clients announce themselves with an origin marker, anything
//! else is treated as the actuator controller.

use servolink::config::AppConfig;
use servolink::error::{Error, Result};
use servolink::ServoLinkApp;
use std::env;
use std::sync::atomic::Ordering;

/// Parse config path from command line arguments.
///
/// Supports:
/// - `servolink <path>` (positional)
/// - `servolink --config <path>` (flag-based)
/// - `servolink -c <path>` (short flag)
///
/// Defaults to `/etc/servolink.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    // Look for --config or -c flag
    for i in 1..args.len() {
        if (args[i] == "--config" || args[i] == "-c") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }

    // Fall back to first positional argument (if it doesn't start with -)
    if args.len() > 1 && !args[1].starts_with('-') {
        return args[1].clone();
    }

    // Default path
    "/etc/servolink.toml".to_string()
}

fn main() -> Result<()> {
    let config_path = parse_config_path();
    let config = AppConfig::from_file(&config_path)?;

    // RUST_LOG still wins over the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    log::info!("ServoLink v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {}", config_path);

    // The cipher capability can only be injected programmatically, so the
    // stock binary cannot honor a framed deployment
    if config.framing.enabled {
        return Err(Error::Config(
            "framing.enabled requires a frame codec; build a binary that \
             injects one via ServoLinkApp::with_codec"
                .to_string(),
        ));
    }

    let app = ServoLinkApp::new(config);

    let running = app.running_flag();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    app.run()?;

    log::info!("ServoLink stopped");
    Ok(())
}
