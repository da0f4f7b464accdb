pub mod event;

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::AddAssign;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::event::{Event, Metric};

/// A monitored multicast group and UDP port.
///
/// Channels are the aggregation key. They are parsed from and displayed as
/// `ip:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Channel {
    pub const fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Errors produced when parsing an `ip:port` channel string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelParseError {
    #[error("missing port: {0:?}")]
    MissingPort(String),

    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid multicast address: {0:?}")]
    NotMulticast(String),
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    /// Parses `ip:port`, requiring the address to be IPv4 multicast.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr, port)) = s.split_once(':') else {
            return Err(ChannelParseError::MissingPort(s.to_string()));
        };

        let port: u16 = port
            .parse()
            .map_err(|_| ChannelParseError::InvalidPort(port.to_string()))?;
        let address: Ipv4Addr = addr
            .parse()
            .map_err(|_| ChannelParseError::InvalidAddress(addr.to_string()))?;

        if !crate::net::is_multicast(address) {
            return Err(ChannelParseError::NotMulticast(addr.to_string()));
        }

        Ok(Self { address, port })
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Packet and byte counters accumulated for one channel since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggr {
    pub packets: u64,
    pub bytes: u64,
}

impl Aggr {
    pub const fn empty() -> Self {
        Self {
            packets: 0,
            bytes: 0,
        }
    }

    /// Delta for a single received datagram of `bytes` length.
    pub const fn datagram(bytes: usize) -> Self {
        Self {
            packets: 1,
            bytes: bytes as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0 && self.bytes == 0
    }

    /// Resets the counters in place, returning the previous values.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl AddAssign for Aggr {
    fn add_assign(&mut self, rhs: Self) {
        self.packets = self.packets.saturating_add(rhs.packets);
        self.bytes = self.bytes.saturating_add(rhs.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        let ch: Channel = "239.0.0.1:5000".parse().expect("valid channel");
        assert_eq!(ch, Channel::new(Ipv4Addr::new(239, 0, 0, 1), 5000));
        assert_eq!(ch.to_string(), "239.0.0.1:5000");
    }

    #[test]
    fn test_channel_parse_errors() {
        assert_eq!(
            "239.0.0.1".parse::<Channel>(),
            Err(ChannelParseError::MissingPort("239.0.0.1".to_string()))
        );
        assert_eq!(
            "239.0.0.1:http".parse::<Channel>(),
            Err(ChannelParseError::InvalidPort("http".to_string()))
        );
        assert_eq!(
            "239.0.0.1:70000".parse::<Channel>(),
            Err(ChannelParseError::InvalidPort("70000".to_string()))
        );
        assert_eq!(
            "example.com:5000".parse::<Channel>(),
            Err(ChannelParseError::InvalidAddress("example.com".to_string()))
        );
        assert_eq!(
            "10.0.0.1:5000".parse::<Channel>(),
            Err(ChannelParseError::NotMulticast("10.0.0.1".to_string()))
        );
    }

    #[test]
    fn test_channel_serde_roundtrip_through_string() {
        let channels: Vec<Channel> =
            serde_yaml::from_str("- 239.1.2.3:1234\n- 224.0.0.251:5353\n").expect("parse");
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].port, 5353);

        let yaml = serde_yaml::to_string(&channels[0]).expect("serialize");
        assert_eq!(yaml.trim().trim_matches(['\'', '"']), "239.1.2.3:1234");
    }

    #[test]
    fn test_channel_serde_rejects_unicast() {
        let result: Result<Vec<Channel>, _> = serde_yaml::from_str("- 192.168.1.1:1234\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_aggr_add_assign_in_place() {
        let mut aggr = Aggr::empty();
        aggr += Aggr::datagram(100);
        aggr += Aggr::datagram(50);
        aggr += Aggr::empty();
        assert_eq!(
            aggr,
            Aggr {
                packets: 2,
                bytes: 150
            }
        );
    }

    #[test]
    fn test_aggr_take_resets() {
        let mut aggr = Aggr::datagram(42);
        let prev = aggr.take();
        assert_eq!(prev.bytes, 42);
        assert!(aggr.is_empty());
    }
}
