//! Downlink dispatch: how commands travel back to the controller
//!
//! Two shapes, selected by deployment configuration:
//!
//! - **Socket**: the command goes back over the same persistent
//!   bidirectional connection the controller uses for feedback.
//! - **Datagram**: feedback still arrives over the bidirectional
//!   connection, but commands go out as connectionless datagrams to the
//!   controller's known address and a fixed command port. Sends are
//!   fire-and-forget: failures are logged as transport errors and never
//!   retried — the next feedback cycle naturally re-attempts dispatch.

use crate::error::{Error, Result};
use crate::transport::PeerHandle;
use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Command transport back to the controller
pub enum Downlink {
    /// Reply over the controller's own bidirectional connection
    Socket,
    /// Push datagrams to the controller's address on `command_port`
    Datagram {
        socket: UdpSocket,
        command_port: u16,
    },
}

impl Downlink {
    /// Create a datagram downlink bound to an ephemeral local port
    /// (send-only socket)
    pub fn datagram(command_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Downlink::Datagram {
            socket,
            command_port,
        })
    }

    /// Send one command payload toward the controller
    ///
    /// `controller` is the session owner's connection handle (socket
    /// downlink); `controller_ip` is its known network address (datagram
    /// downlink).
    pub fn dispatch(
        &self,
        controller: Option<&PeerHandle>,
        controller_ip: Option<IpAddr>,
        payload: &str,
    ) -> Result<()> {
        match self {
            Downlink::Socket => {
                let handle = controller.ok_or_else(|| {
                    Error::Transport("no controller connection for command".to_string())
                })?;
                if !handle.send_line(payload) {
                    return Err(Error::Transport(format!(
                        "controller {} unreachable",
                        handle.addr
                    )));
                }
                Ok(())
            }
            Downlink::Datagram {
                socket,
                command_port,
            } => {
                let ip = controller_ip.ok_or_else(|| {
                    Error::Transport("controller address not yet known".to_string())
                })?;
                let target = SocketAddr::new(ip, *command_port);
                socket
                    .send_to(payload.as_bytes(), target)
                    .map_err(|e| Error::Transport(format!("datagram to {}: {}", target, e)))?;
                log::debug!("Command sent to {}: {}", target, payload);
                Ok(())
            }
        }
    }
}
