use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::domain::Channel;

/// Errors opening a channel socket. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("creating socket for {channel}: {source}")]
    Configure {
        channel: Channel,
        #[source]
        source: io::Error,
    },

    #[error("binding {channel}: {source}")]
    Bind {
        channel: Channel,
        #[source]
        source: io::Error,
    },

    #[error("joining multicast group {channel} on {interface}: {source}")]
    Join {
        channel: Channel,
        interface: Ipv4Addr,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Configure { channel, .. } | Self::Bind { channel, .. } => *channel,
            Self::Join { channel, .. } => *channel,
        }
    }
}

/// Reports whether `addr` lies in the IPv4 multicast block 224.0.0.0/4.
pub fn is_multicast(addr: Ipv4Addr) -> bool {
    matches_cidr(addr, Ipv4Addr::new(224, 0, 0, 0), 4)
}

/// Reports whether `addr` lies within `network/prefix_len`.
pub fn matches_cidr(addr: Ipv4Addr, network: Ipv4Addr, prefix_len: u8) -> bool {
    let mask = match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - u32::from(n)),
    };
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

/// Opens a non-blocking UDP socket bound to the channel and joined to its
/// multicast group on `interface` (`0.0.0.0` lets the kernel choose).
///
/// `SO_REUSEADDR` is set so several processes can watch the same group.
pub fn open_channel_socket(channel: Channel, interface: Ipv4Addr) -> Result<UdpSocket, SocketError> {
    let socket = bind_udp_socket(channel)?;

    socket
        .join_multicast_v4(&channel.address, &interface)
        .map_err(|source| SocketError::Join {
            channel,
            interface,
            source,
        })?;

    Ok(socket.into())
}

/// Binds a non-blocking, address-reusing UDP socket to the channel's address
/// and port without joining any group.
fn bind_udp_socket(channel: Channel) -> Result<Socket, SocketError> {
    let configure = |source| SocketError::Configure { channel, source };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(configure)?;
    socket.set_reuse_address(true).map_err(configure)?;

    let bind_addr = SocketAddrV4::new(channel.address, channel.port);
    socket
        .bind(&bind_addr.into())
        .map_err(|source| SocketError::Bind { channel, source })?;

    socket.set_nonblocking(true).map_err(configure)?;

    Ok(socket)
}

/// Opens one socket per channel, failing on the first error. Sockets already
/// opened are closed when the partial result is dropped.
pub fn open_channel_sockets(
    channels: &[Channel],
    interface: Ipv4Addr,
) -> Result<Vec<(Channel, UdpSocket)>, SocketError> {
    channels
        .iter()
        .map(|&channel| {
            let socket = open_channel_socket(channel, interface)?;
            tracing::debug!(%channel, %interface, "joined multicast group");
            Ok((channel, socket))
        })
        .collect()
}
