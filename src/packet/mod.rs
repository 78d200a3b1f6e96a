//! IPv4/TCP/UDP header codec plus the per-packet record exchanged with the
//! native packet loop.

pub mod checksum;
pub mod codec;
pub mod ipv4;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use codec::{Ipv4Packet, Transport};
pub use ipv4::Ipv4Header;
pub use tcp::{TcpFlags, TcpSegment};
pub use udp::UdpDatagram;

/// IP protocol numbers the firewall knows by name.
pub mod proto {
    pub const ICMP: u8 = 1;
    pub const IGMP: u8 = 2;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ENCAP: u8 = 41;
    pub const ICMPV6: u8 = 58;
    pub const OSPF: u8 = 89;
    pub const SCTP: u8 = 132;

    pub fn name(protocol: u8) -> Option<&'static str> {
        match protocol {
            ICMP => Some("ICMP"),
            IGMP => Some("IGMP"),
            TCP => Some("TCP"),
            UDP => Some("UDP"),
            ENCAP => Some("ENCAP"),
            ICMPV6 => Some("ICMPv6"),
            OSPF => Some("OSPF"),
            SCTP => Some("SCTP"),
            _ => None,
        }
    }

    /// Only TCP and UDP carry port numbers.
    pub fn has_ports(protocol: u8) -> bool {
        matches!(protocol, TCP | UDP)
    }

    /// Protocols the native loop can filter.
    pub fn is_supported(protocol: u8) -> bool {
        matches!(protocol, ICMP | ICMPV6 | TCP | UDP)
    }
}

/// Header codec failures.
///
/// Decode errors mean the buffer could not be parsed at all; validation errors
/// mean it parsed but must not be trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("{layer}: truncated, need {needed} bytes, have {actual}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("IP: unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("IP: unsupported protocol {}", ProtocolName(*.0))]
    UnsupportedProtocol(u8),

    #[error("{layer}: malformed header: {reason}")]
    Malformed {
        layer: &'static str,
        reason: String,
    },

    #[error("{layer}: reserved bits not zero")]
    ReservedBits { layer: &'static str },

    #[error("{layer}: invalid checksum wire={wire:#06x} computed={computed:#06x}")]
    ChecksumMismatch {
        layer: &'static str,
        wire: u16,
        computed: u16,
    },
}

impl PacketError {
    pub fn malformed(layer: &'static str, reason: impl Into<String>) -> Self {
        PacketError::Malformed {
            layer,
            reason: reason.into(),
        }
    }

    /// The buffer could not be decoded; the caller drops it.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            PacketError::Truncated { .. }
                | PacketError::UnsupportedVersion(_)
                | PacketError::UnsupportedProtocol(_)
                | PacketError::Malformed { .. }
        )
    }

    /// Decoded fine but failed `validate()`.
    pub fn is_validation_error(&self) -> bool {
        !self.is_decode_error()
    }
}

struct ProtocolName(u8);

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match proto::name(self.0) {
            Some(name) => write!(f, "{}({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

pub(crate) fn ensure_len(layer: &'static str, buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::Truncated {
            layer,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// One packet as observed by the native loop, annotated by the decision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Observation time, milliseconds since the Unix epoch.
    pub time: i64,
    pub version: u8,
    pub protocol: u8,
    /// TCP flag summary such as `"S"` or `"FA"`; empty for flagless segments and other protocols.
    #[serde(default)]
    pub flags: String,
    pub saddr: IpAddr,
    pub sport: Option<u16>,
    pub daddr: IpAddr,
    pub dport: Option<u16>,
    /// Free text annotation, e.g. the redirect target.
    #[serde(default)]
    pub data: Option<String>,
    /// Owning application; `None` when the uid could not be resolved.
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub allowed: bool,
}

impl Packet {
    /// Destination port as used for table keys: 0 when the protocol has no ports.
    pub fn key_port(&self) -> u16 {
        if proto::has_ports(self.protocol) {
            self.dport.unwrap_or(0)
        } else {
            0
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} v{} p{}", DisplayUid(self.uid), self.version, self.protocol)?;
        if !self.flags.is_empty() {
            write!(f, " {}", self.flags)?;
        }
        write!(f, " {}", self.saddr)?;
        if let Some(port) = self.sport {
            write!(f, "/{}", port)?;
        }
        write!(f, " > {}", self.daddr)?;
        if let Some(port) = self.dport {
            write!(f, "/{}", port)?;
        }
        write!(f, " allowed={}", self.allowed)
    }
}

struct DisplayUid(Option<u32>);

impl fmt::Display for DisplayUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(uid) => write!(f, "{}", uid),
            None => f.write_str("?"),
        }
    }
}

/// Per-flow traffic accounting reported by the native loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub time: i64,
    pub version: u8,
    pub protocol: u8,
    pub daddr: IpAddr,
    pub dport: u16,
    pub uid: u32,
    pub sent: u64,
    pub received: u64,
}
