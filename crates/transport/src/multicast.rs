use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{DatagramSource, TransportError};

/// Multicast group the energy meter broadcasts to.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interface: Ipv4Addr,
    pub recv_timeout_ms: u64,
    pub max_datagram_len: usize,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 12, 255, 254),
            port: 9_522,
            interface: Ipv4Addr::UNSPECIFIED,
            recv_timeout_ms: 2_000,
            max_datagram_len: 600,
        }
    }
}

#[derive(Debug)]
pub struct MulticastReceiver {
    config: MulticastConfig,
    socket: Option<UdpSocket>,
}

impl MulticastReceiver {
    pub fn new(config: MulticastConfig) -> Self {
        Self {
            config,
            socket: None,
        }
    }
}

/// Binds the group port with `SO_REUSEADDR` so a restart or a second listener
/// on the same host does not fail with "address in use".
fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    UdpSocket::from_std(socket.into())
}

#[async_trait]
impl DatagramSource for MulticastReceiver {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.close().await;
        let socket = bind_reusable(self.config.port)?;
        socket.join_multicast_v4(self.config.group, self.config.interface)?;
        info!(group = %self.config.group, port = self.config.port, "joined multicast group");
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let mut buf = vec![0u8; self.config.max_datagram_len];
        let len = timeout(
            Duration::from_millis(self.config.recv_timeout_ms),
            socket.recv(&mut buf),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            timeout_ms: self.config.recv_timeout_ms,
        })??;
        buf.truncate(len);
        Ok(buf)
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let mut buf = vec![0u8; self.config.max_datagram_len];
        match socket.try_recv(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.leave_multicast_v4(self.config.group, self.config.interface);
            debug!(group = %self.config.group, "left multicast group");
        }
    }
}
