//! Registration listener
//!
//! Consumers announce themselves with a hello datagram sent from the socket
//! they receive on; the sender address becomes (or refreshes) an implicit
//! endpoint. Runs on its own thread until the shutdown flag is raised.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::registry::EndpointRegistry;
use crate::error::{FocusError, FocusResult};
use crate::types::RelayMode;
use crate::wire::{Control, MAX_DATAGRAM};

/// How often the listener re-checks the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bind the registration socket and start the listener thread.
///
/// Returns the bound address (useful with port 0) and the thread handle.
pub fn spawn_listener(
    bind: SocketAddr,
    mode: RelayMode,
    registry: Arc<EndpointRegistry>,
    shutdown: Arc<AtomicBool>,
) -> FocusResult<(SocketAddr, JoinHandle<()>)> {
    let socket = UdpSocket::bind(bind)
        .map_err(|e| FocusError::InvalidConfig(format!("cannot bind registration port {bind}: {e}")))?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    let local = socket.local_addr()?;
    info!(listen = %local, "accepting consumer registrations");

    let handle = thread::Builder::new()
        .name("registration".to_string())
        .spawn(move || listen(socket, mode, registry, shutdown))?;
    Ok((local, handle))
}

fn listen(socket: UdpSocket, mode: RelayMode, registry: Arc<EndpointRegistry>, shutdown: Arc<AtomicBool>) {
    let mut buffer = [0u8; MAX_DATAGRAM];
    let mut rejected: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let (len, peer) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            // ICMP port-unreachable from an earlier send can surface here
            Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
            Err(e) => {
                warn!(error = %e, "registration socket failed");
                break;
            }
        };

        match Control::decode(&buffer[..len]) {
            Ok(Control::Hello { role }) if mode.serves(role) => {
                if let Err(e) = registry.register(role, peer, false) {
                    warn!(endpoint = %peer, error = %e, "registration failed");
                }
            }
            Ok(Control::Hello { role }) => {
                debug!(endpoint = %peer, role = %role, "hello for a role this relay does not serve");
            }
            Err(e) => {
                rejected += 1;
                debug!(endpoint = %peer, rejected, error = %e, "ignoring datagram on registration port");
            }
        }
    }
    debug!("registration listener stopped");
}
