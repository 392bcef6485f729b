//! Destinations for channel-ordered device buffers.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{LedWallError, Result};

/// Largest payload sent in a single datagram.
pub const MAX_DATAGRAM: usize = 1440;

/// Receives one complete device buffer per transmission.
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
}

/// Sends buffers verbatim over UDP, split into datagrams of at most
/// [`MAX_DATAGRAM`] bytes.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    pub fn connect(target: &str) -> Result<Self> {
        let target = target
            .to_socket_addrs()
            .map_err(|err| LedWallError::Transport(format!("invalid target `{target}`: {err}")))?
            .next()
            .ok_or_else(|| LedWallError::Transport(format!("target `{target}` did not resolve")))?;

        let bind: SocketAddr = if target.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_broadcast(target.is_ipv4())?;
        socket.set_write_timeout(Some(Duration::from_millis(100)))?;

        tracing::info!(%target, "udp transport ready");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        for chunk in frame.chunks(MAX_DATAGRAM) {
            self.socket
                .send_to(chunk, self.target)
                .map_err(|err| LedWallError::Transport(format!("send to {}: {err}", self.target)))?;
        }
        Ok(())
    }
}

/// Shared log of every buffer a [`MemoryTransport`] received.
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FrameLog {
    pub fn len(&self) -> usize {
        self.frames.lock().map(|frames| frames.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.frames
            .lock()
            .ok()
            .and_then(|frames| frames.last().cloned())
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .map(|mut frames| std::mem::take(&mut *frames))
            .unwrap_or_default()
    }
}

/// In-process transport that records frames, optionally failing or
/// stalling on every send.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    log: FrameLog,
    delay: Option<Duration>,
    fail: bool,
}

impl MemoryTransport {
    pub fn new() -> (Self, FrameLog) {
        let transport = Self::default();
        let log = transport.log.clone();
        (transport, log)
    }

    /// Blocks for `delay` inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Rejects every send after recording it.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.log
            .frames
            .lock()
            .map_err(|_| LedWallError::msg("frame log has been poisoned"))?
            .push(frame.to_vec());
        if self.fail {
            return Err(LedWallError::Transport("memory transport set to fail".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_transport_splits_large_frames() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap().to_string();

        let mut transport = UdpTransport::connect(&target).unwrap();
        let frame: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
        transport.send(&frame).unwrap();

        let mut buf = [0u8; 2048];
        let (first, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(first, MAX_DATAGRAM);
        assert_eq!(&buf[..first], &frame[..MAX_DATAGRAM]);
        let (second, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(second, 2000 - MAX_DATAGRAM);
    }

    #[test]
    fn rejects_unresolvable_targets() {
        assert!(matches!(
            UdpTransport::connect("not an address").unwrap_err(),
            LedWallError::Transport(_)
        ));
    }

    #[test]
    fn memory_transport_records_frames() {
        let (mut transport, log) = MemoryTransport::new();
        transport.send(&[1, 2, 3]).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.last(), Some(vec![1, 2, 3]));

        let mut failing = transport.clone().failing();
        assert!(failing.send(&[4]).is_err());
        assert_eq!(log.take().len(), 2);
        assert!(log.is_empty());
    }
}
