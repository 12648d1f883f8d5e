//! Application orchestration for the ServoLink relay daemon
//!
//! Wires the pieces together: binds the listener, spawns the router
//! thread, and runs the accept loop that hands each incoming connection
//! its reader/writer thread pair. Shutdown is cooperative through a
//! shared atomic flag; the process signal handler lives in the binary.

use crate::config::{AppConfig, DownlinkMode};
use crate::error::{Error, Result};
use crate::framing::FrameCodec;
use crate::router::Router;
use crate::transport::{spawn_connection, Downlink, PeerId};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Relay daemon: one listener, one router thread, two threads per
/// connection
pub struct ServoLinkApp {
    config: AppConfig,
    codec: Option<Box<dyn FrameCodec>>,
    running: Arc<AtomicBool>,
}

impl ServoLinkApp {
    /// Create a plaintext relay
    pub fn new(config: AppConfig) -> Self {
        Self::with_codec(config, None)
    }

    /// Create a relay with an injected frame codec
    ///
    /// The codec is the deployment's cipher capability; every outbound
    /// command is encoded through it and inbound payloads are decoded
    /// before interpretation.
    pub fn with_codec(config: AppConfig, codec: Option<Box<dyn FrameCodec>>) -> Self {
        Self {
            config,
            codec,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared shutdown flag; store `false` to stop [`run`](Self::run)
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the relay until the shutdown flag is cleared
    pub fn run(self) -> Result<()> {
        let downlink = match self.config.network.downlink {
            DownlinkMode::Socket => {
                log::info!("Downlink: socket (commands over the controller connection)");
                Downlink::Socket
            }
            DownlinkMode::Datagram => {
                log::info!(
                    "Downlink: datagram (commands to controller port {})",
                    self.config.network.command_port
                );
                Downlink::datagram(self.config.network.command_port)?
            }
        };

        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut router = Router::new(&self.config, downlink, self.codec, events_tx.clone());
        let router_running = Arc::clone(&self.running);
        let router_handle = thread::Builder::new()
            .name("router".to_string())
            .spawn(move || router.run(events_rx, router_running))?;

        let bind_addr = &self.config.network.listen_address;
        let listener = TcpListener::bind(bind_addr)
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", bind_addr, e)))?;
        listener.set_nonblocking(true)?;

        log::info!("Listening on {}", bind_addr);
        let mut next_id: PeerId = 0;

        while self.running.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let id = next_id;
                    next_id += 1;
                    log::debug!("Accepted connection {} from {}", id, addr);

                    // Reader threads use a read timeout to poll the
                    // shutdown flag; the stream itself stays blocking
                    if let Err(e) = stream.set_nonblocking(false) {
                        log::error!("Failed to set socket to blocking mode: {}", e);
                        continue;
                    }
                    if let Err(e) = spawn_connection(
                        stream,
                        id,
                        events_tx.clone(),
                        Arc::clone(&self.running),
                    ) {
                        log::error!("Failed to start connection threads for {}: {}", addr, e);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                }
            }
        }

        log::info!("Shutting down...");
        drop(events_tx);
        if router_handle.join().is_err() {
            log::error!("Router thread panicked during shutdown");
        }

        Ok(())
    }
}
