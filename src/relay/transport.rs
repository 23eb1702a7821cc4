//! Datagram transport used by the per-endpoint senders

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{FocusError, FocusResult};

/// Best-effort, unacknowledged datagram delivery
pub trait Transport: Send + Sync {
    /// Send one datagram; may block for at most the transport's send timeout
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> FocusResult<()>;
}

/// One unconnected UDP socket shared by all endpoint senders
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral socket with a bounded write timeout
    pub fn bind(bind_addr: &str, send_timeout: Duration) -> FocusResult<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_write_timeout(Some(send_timeout.max(Duration::from_millis(1))))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> FocusResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> FocusResult<()> {
        match self.socket.send_to(payload, target) {
            Ok(_) => Ok(()),
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => "send timed out".to_string(),
                    _ => e.to_string(),
                };
                Err(FocusError::EndpointUnreachable {
                    endpoint: target,
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) use memory::MemoryTransport;

#[cfg(test)]
mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Instant;

    /// Records datagrams in memory; selected targets are slow or refuse
    #[derive(Default)]
    pub(crate) struct MemoryTransport {
        pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        pub slow: HashSet<SocketAddr>,
        pub refused: HashSet<SocketAddr>,
        pub delay: Duration,
    }

    impl MemoryTransport {
        pub fn sent_to(&self, target: SocketAddr) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .iter()
                .filter(|(addr, _)| *addr == target)
                .map(|(_, payload)| payload.clone())
                .collect()
        }

        /// Poll until `target` has received `count` datagrams or `deadline` passes
        pub fn wait_for(&self, target: SocketAddr, count: usize, deadline: Duration) -> bool {
            let started = Instant::now();
            while started.elapsed() < deadline {
                if self.sent_to(target).len() >= count {
                    return true;
                }
                thread::sleep(Duration::from_millis(2));
            }
            false
        }
    }

    impl Transport for MemoryTransport {
        fn send_to(&self, payload: &[u8], target: SocketAddr) -> FocusResult<()> {
            if self.refused.contains(&target) {
                return Err(FocusError::EndpointUnreachable {
                    endpoint: target,
                    reason: "connection refused".into(),
                });
            }
            if self.slow.contains(&target) {
                thread::sleep(self.delay);
            }
            self.sent.lock().push((target, payload.to_vec()));
            Ok(())
        }
    }
}
