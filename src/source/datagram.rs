//! UDP datagram source
//!
//! Binds a socket and reads one frame per datagram. Frames that fail to parse
//! are reported as invalid samples and the socket keeps receiving.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::{Duration, Instant};
use tracing::info;

use super::{parse_frame, Source, SourceEvent};
use crate::error::{FocusError, FocusResult};
use crate::wire::MAX_DATAGRAM;

pub struct DatagramSource {
    bind_addr: String,
    socket: UdpSocket,
    buffer: Vec<u8>,
    started: Instant,
}

impl DatagramSource {
    pub fn bind(bind_addr: &str) -> FocusResult<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| FocusError::SourceInit(format!("UDP bind {bind_addr} failed: {e}")))?;
        info!(bind = bind_addr, "listening for upstream datagrams");
        Ok(Self {
            bind_addr: bind_addr.to_string(),
            socket,
            buffer: vec![0u8; MAX_DATAGRAM],
            started: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> FocusResult<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Source for DatagramSource {
    fn name(&self) -> &str {
        &self.bind_addr
    }

    fn next_sample(&mut self, timeout: Duration) -> FocusResult<SourceEvent> {
        // a zero read timeout means "block forever" to the OS
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv_from(&mut self.buffer) {
            Ok((len, _peer)) => {
                let text = String::from_utf8_lossy(&self.buffer[..len]);
                let sample = parse_frame(&text, self.started.elapsed().as_secs_f64())?;
                Ok(SourceEvent::Sample(sample))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(SourceEvent::Timeout)
            }
            Err(e) => Err(FocusError::UpstreamDisconnected(format!(
                "UDP receive on {} failed: {e}",
                self.bind_addr
            ))),
        }
    }

    fn reconnect(&mut self) -> FocusResult<()> {
        let local = self.socket.local_addr()?;
        // release the port before binding it again
        let placeholder = UdpSocket::bind("127.0.0.1:0")?;
        drop(std::mem::replace(&mut self.socket, placeholder));
        self.socket = UdpSocket::bind(local)
            .map_err(|e| FocusError::UpstreamDisconnected(format!("rebind {local} failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;

    #[test]
    fn test_receives_frames() {
        let mut source = DatagramSource::bind("127.0.0.1:0").unwrap();
        let target = source.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(b"2.0,55.5", target).unwrap();
        sender.send_to(b"not a frame", target).unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(
            source.next_sample(timeout).unwrap(),
            SourceEvent::Sample(Sample::new(55.5, 2.0))
        );
        assert!(matches!(
            source.next_sample(timeout),
            Err(FocusError::InvalidSample(_))
        ));
        assert_eq!(
            source.next_sample(Duration::from_millis(20)).unwrap(),
            SourceEvent::Timeout
        );
    }

    #[test]
    fn test_bind_conflict_is_init_error() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let err = DatagramSource::bind(&addr).err().unwrap();
        assert!(matches!(err, FocusError::SourceInit(_)));
    }
}
