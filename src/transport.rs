//! Datagram transport
//!
//! One multicast socket joined to the configured group (heartbeats, catalog
//! propagation, ownership broadcast) and one unicast socket on an ephemeral
//! port for point-to-point exchange. Both are read with a short timeout so a
//! receive never blocks past `recv_timeout`; an expired wait yields the
//! `TIMED_OUT` pseudo-message.
//!
//! Sends never fail from the caller's point of view: errors are logged and
//! the protocol's idle-period retries take care of recovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::SwarmConfig;
use crate::error::{NetworkErrorKind, Result, SwarmError};
use crate::message::{Envelope, Message, MessageKind};

/// Outbound half of the transport, as used by every protocol component.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send to the multicast group
    async fn multicast(&self, message: &Message);

    /// Send to one peer; `None` targets the peer's multicast port
    async fn unicast(&self, message: &Message, peer: IpAddr, port: Option<u16>);
}

/// Which socket to read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Multicast,
    Unicast,
}

/// UDP implementation backed by real sockets
pub struct UdpTransport {
    multicast_socket: UdpSocket,
    unicast_socket: UdpSocket,
    group: SocketAddrV4,
    local_ip: IpAddr,
    config: SwarmConfig,
}

impl UdpTransport {
    /// Bind both sockets and join the multicast group.
    pub async fn bind(config: &SwarmConfig) -> Result<Self> {
        let local_ip = match config.local_addr {
            Some(addr) => IpAddr::V4(addr),
            None => detect_local_ip(config)?,
        };

        let multicast_socket = create_multicast_socket(config)?;
        let unicast_socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| {
                SwarmError::network(
                    NetworkErrorKind::Bind,
                    format!("Failed to bind unicast socket: {}", e),
                )
            })?;

        tracing::info!(
            "Joined {}:{} as {} (unicast port {})",
            config.multicast_group,
            config.port,
            local_ip,
            unicast_socket.local_addr().map(|a| a.port()).unwrap_or(0)
        );

        Ok(Self {
            multicast_socket,
            unicast_socket,
            group: SocketAddrV4::new(config.multicast_group, config.port),
            local_ip,
            config: config.clone(),
        })
    }

    /// Address this peer is known by on the LAN
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Port of the unicast socket
    pub fn unicast_port(&self) -> Result<u16> {
        Ok(self.unicast_socket.local_addr()?.port())
    }

    /// Wait for one datagram on `channel`, up to the configured timeout.
    ///
    /// A timeout is not an error: it comes back as `Message::TimedOut` from
    /// this peer. Undecodable datagrams surface as format errors.
    pub async fn receive(&self, channel: Channel, buf: &mut [u8]) -> Result<Envelope> {
        let socket = match channel {
            Channel::Multicast => &self.multicast_socket,
            Channel::Unicast => &self.unicast_socket,
        };

        match tokio::time::timeout(self.config.recv_timeout(), socket.recv_from(buf)).await {
            Err(_) => Ok(Envelope::new(Message::TimedOut, self.local_ip, 0)),
            Ok(Err(e)) => Err(SwarmError::network(
                NetworkErrorKind::Receive,
                format!("{:?} receive failed: {}", channel, e),
            )),
            Ok(Ok((len, source))) => {
                let message = Message::decode(&buf[..len])?;
                Ok(Envelope::new(message, source.ip(), source.port()))
            }
        }
    }

    async fn send_to(&self, socket: &UdpSocket, message: &Message, target: SocketAddr) {
        let datagram = message.encode();
        if let Err(e) = socket.send_to(&datagram, target).await {
            let err = SwarmError::network(NetworkErrorKind::Send, e.to_string());
            tracing::warn!("Failed to send {} to {}: {}", message.kind(), target, err);
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn multicast(&self, message: &Message) {
        self.send_to(&self.multicast_socket, message, SocketAddr::V4(self.group))
            .await;
    }

    async fn unicast(&self, message: &Message, peer: IpAddr, port: Option<u16>) {
        let target = SocketAddr::new(peer, port.unwrap_or(self.config.port));
        self.send_to(&self.unicast_socket, message, target).await;
    }
}

/// Create the group socket with address reuse, bound to the group port.
fn create_multicast_socket(config: &SwarmConfig) -> Result<UdpSocket> {
    let bind_err =
        |e: std::io::Error| SwarmError::network(NetworkErrorKind::Bind, e.to_string());

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;

    #[cfg(unix)]
    {
        socket.set_reuse_port(true).map_err(bind_err)?;
    }

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket.bind(&bind_addr.into()).map_err(bind_err)?;

    let interface = config.local_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket
        .join_multicast_v4(&config.multicast_group, &interface)
        .map_err(|e| {
            SwarmError::network(
                NetworkErrorKind::Multicast,
                format!("Failed to join multicast group {}: {}", config.multicast_group, e),
            )
        })?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| SwarmError::network(NetworkErrorKind::Multicast, e.to_string()))?;
    if let Some(addr) = config.local_addr {
        socket
            .set_multicast_if_v4(&addr)
            .map_err(|e| SwarmError::network(NetworkErrorKind::Multicast, e.to_string()))?;
    }

    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

/// Ask the routing table which interface reaches the group.
fn detect_local_ip(config: &SwarmConfig) -> Result<IpAddr> {
    let probe = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    probe
        .connect(SocketAddrV4::new(config.multicast_group, config.port))
        .map_err(|e| SwarmError::network(NetworkErrorKind::LocalAddress, e.to_string()))?;

    let ip = probe.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(SwarmError::network(
            NetworkErrorKind::LocalAddress,
            "no interface routes to the multicast group; set local_addr",
        ));
    }
    Ok(ip)
}

/// Where a recorded message was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Multicast,
    Unicast(IpAddr, u16),
}

/// One message captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub message: Message,
    pub destination: Destination,
}

/// Transport that records outbound messages instead of sending them.
///
/// Used by unit and integration tests to drive the protocol components
/// without sockets.
#[derive(Debug)]
pub struct RecordingTransport {
    default_port: u16,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    pub fn new(default_port: u16) -> Self {
        Self {
            default_port,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Drain the record
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Messages of one kind, in send order
    pub fn of_kind(&self, kind: MessageKind) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.message.kind() == kind)
            .cloned()
            .collect()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new(SwarmConfig::default().port)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn multicast(&self, message: &Message) {
        self.sent.lock().push(Sent {
            message: message.clone(),
            destination: Destination::Multicast,
        });
    }

    async fn unicast(&self, message: &Message, peer: IpAddr, port: Option<u16>) {
        self.sent.lock().push(Sent {
            message: message.clone(),
            destination: Destination::Unicast(peer, port.unwrap_or(self.default_port)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_transport_resolves_default_port() {
        let transport = RecordingTransport::new(6789);
        let peer: IpAddr = "10.0.0.2".parse().unwrap();

        transport.unicast(&Message::ListRequest { piece: 0 }, peer, None).await;
        transport.unicast(&Message::Hello, peer, Some(40000)).await;
        transport.multicast(&Message::Hello).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].destination, Destination::Unicast(peer, 6789));
        assert_eq!(sent[1].destination, Destination::Unicast(peer, 40000));
        assert_eq!(sent[2].destination, Destination::Multicast);
        assert_eq!(transport.of_kind(MessageKind::Hello).len(), 2);
        assert_eq!(transport.take().len(), 3);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_udp_unicast_loopback() {
        // Multicast may be unavailable in sandboxes; skip when the group cannot be joined.
        let config = SwarmConfig::new()
            .multicast(Ipv4Addr::new(239, 255, 42, 99), 46789)
            .local_addr(Ipv4Addr::LOCALHOST);
        let transport = match UdpTransport::bind(&config).await {
            Ok(t) => t,
            Err(_) => return,
        };

        let port = transport.unicast_port().unwrap();
        let message = Message::ListRequest { piece: 4 };
        transport
            .unicast(&message, IpAddr::V4(Ipv4Addr::LOCALHOST), Some(port))
            .await;

        let mut buf = vec![0u8; 2048];
        let envelope = transport.receive(Channel::Unicast, &mut buf).await.unwrap();
        assert_eq!(envelope.message, message);
        assert_eq!(envelope.sender, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let config = SwarmConfig {
            recv_timeout_ms: 20,
            ..SwarmConfig::new()
                .multicast(Ipv4Addr::new(239, 255, 42, 98), 46790)
                .local_addr(Ipv4Addr::LOCALHOST)
        };
        let transport = match UdpTransport::bind(&config).await {
            Ok(t) => t,
            Err(_) => return,
        };

        let mut buf = vec![0u8; 2048];
        let envelope = transport.receive(Channel::Unicast, &mut buf).await.unwrap();
        assert_eq!(envelope.message, Message::TimedOut);
    }
}
