//! Per-connection reader and writer threads
//!
//! Messages are newline-delimited UTF-8 lines over a persistent TCP
//! connection, for both operator and controller roles.
//!
//! # Role classification
//!
//! The role of a connection is decided once, from the very first line it
//! sends, and never changes:
//!
//! - A line starting with the origin marker identifies a browser-based
//!   operator client (the connection gateway injects it from the browser
//!   origin it observed at connect time). The marker line itself is
//!   consumed here and never reaches the router.
//! - Anything else identifies the actuator controller, and that first
//!   line is delivered as the controller's first message — typically its
//!   credential payload.
//!
//! # Connection lifecycle
//!
//! ```text
//! 1. Accept loop hands the stream and a fresh peer id to spawn_connection
//! 2. Reader thread classifies the role and posts Connected
//! 3. Inbound lines become Message events until disconnect
//! 4. On EOF or error the reader posts Closed and the router drops the
//!    peer's send capability, which ends the writer thread
//! ```
//!
//! A 500 ms read timeout lets the reader notice daemon shutdown; the
//! writer uses the same interval on its queue.

use crate::error::Result;
use crate::transport::{Outbound, PeerHandle, PeerId, Role, RouterEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Prefix of the connect-time marker line identifying a browser client
pub const ORIGIN_MARKER: &str = "ORIGIN ";

/// Poll interval for shutdown-flag checks in both threads
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Spawn the reader and writer threads for a freshly accepted connection
pub fn spawn_connection(
    stream: TcpStream,
    id: PeerId,
    events: Sender<RouterEvent>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let addr = stream.peer_addr()?;
    let (out_tx, out_rx) = crossbeam_channel::unbounded::<Outbound>();

    let writer_stream = stream.try_clone()?;
    let writer_running = Arc::clone(&running);
    thread::Builder::new()
        .name(format!("peer-{}-writer", id))
        .spawn(move || writer_loop(writer_stream, out_rx, writer_running))?;

    thread::Builder::new()
        .name(format!("peer-{}-reader", id))
        .spawn(move || {
            if let Err(e) = reader_loop(stream, id, addr, out_tx, &events, running) {
                log::debug!("Reader for peer {} ended: {}", id, e);
            }
            let _ = events.send(RouterEvent::Closed(id));
        })?;

    Ok(())
}

/// Reader loop: classify the role from the first line, then forward every
/// subsequent line as a message event
fn reader_loop(
    stream: TcpStream,
    id: PeerId,
    addr: std::net::SocketAddr,
    out_tx: Sender<Outbound>,
    events: &Sender<RouterEvent>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut role: Option<Role> = None;

    while running.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {
                let text = line.trim().to_string();
                line.clear();
                if text.is_empty() {
                    continue;
                }

                match role {
                    None => {
                        let classified = if text.starts_with(ORIGIN_MARKER) {
                            Role::Operator
                        } else {
                            Role::Controller
                        };
                        role = Some(classified);
                        log::info!("New {:?} client connected from {}", classified, addr);

                        let handle = PeerHandle::new(id, addr, classified, out_tx.clone());
                        if events.send(RouterEvent::Connected(handle)).is_err() {
                            break; // router gone, daemon is shutting down
                        }
                        // The controller's first line is a real message
                        // (its credential payload); the operator marker
                        // line is only the classification signal.
                        if classified == Role::Controller
                            && events
                                .send(RouterEvent::Message { peer: id, text })
                                .is_err()
                        {
                            break;
                        }
                    }
                    Some(_) => {
                        if events
                            .send(RouterEvent::Message { peer: id, text })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            // Timeouts just mean no traffic; partially read bytes stay
            // buffered in `line` for the next pass
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Writer loop: drain the outbound queue onto the socket
fn writer_loop(mut stream: TcpStream, rx: Receiver<Outbound>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Outbound::Line(text)) => {
                if stream
                    .write_all(text.as_bytes())
                    .and_then(|_| stream.write_all(b"\n"))
                    .and_then(|_| stream.flush())
                    .is_err()
                {
                    break;
                }
            }
            Ok(Outbound::Shutdown) => {
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            // Router dropped this peer's handle
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
