use std::fmt;
use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use super::ipv4::Ipv4Header;
use super::tcp::{TcpFlags, TcpSegment};
use super::udp::UdpDatagram;
use super::{proto, Packet, PacketError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
}

impl Transport {
    pub fn ports(&self) -> (u16, u16) {
        match self {
            Transport::Tcp(t) => (t.source_port, t.destination_port),
            Transport::Udp(u) => (u.source_port, u.destination_port),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Transport::Tcp(t) => t.encoded_len(),
            Transport::Udp(u) => u.encoded_len(),
        }
    }
}

/// An IPv4 datagram carrying TCP or UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub ip: Ipv4Header,
    pub transport: Transport,
}

impl Ipv4Packet {
    /// Decodes a raw IPv4 datagram. Bytes past the IP total length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let ip = Ipv4Header::decode(buf)?;
        if ip.fragment_offset != 0 {
            return Err(PacketError::malformed(
                "IP",
                format!("fragment at offset {} carries no transport header", ip.fragment_offset),
            ));
        }

        let payload = &buf[ip.header_len()..ip.total_length as usize];
        let transport = match ip.protocol {
            proto::TCP => Transport::Tcp(TcpSegment::decode(ip.source, ip.destination, payload)?),
            proto::UDP => Transport::Udp(UdpDatagram::decode(ip.source, ip.destination, payload)?),
            other => return Err(PacketError::UnsupportedProtocol(other)),
        };

        Ok(Self { ip, transport })
    }

    /// IP header first, then the transport layer.
    pub fn validate(&self) -> Result<(), PacketError> {
        self.ip.validate()?;
        match &self.transport {
            Transport::Tcp(t) => t.validate(),
            Transport::Udp(u) => u.validate(),
        }
    }

    /// Serializes with every length and checksum field recomputed.
    pub fn encode(&self) -> Bytes {
        let payload_len = self.transport.encoded_len();
        let mut out = BytesMut::with_capacity(self.ip.header_len() + payload_len);
        self.ip.encode(payload_len, &mut out);
        match &self.transport {
            Transport::Tcp(t) => t.encode(self.ip.source, self.ip.destination, &mut out),
            Transport::Udp(u) => u.encode(self.ip.source, self.ip.destination, &mut out),
        }
        out.freeze()
    }

    /// Exchanges source and destination addresses, and ports.
    pub fn swap_endpoints(&mut self) {
        std::mem::swap(&mut self.ip.source, &mut self.ip.destination);
        match &mut self.transport {
            Transport::Tcp(t) => std::mem::swap(&mut t.source_port, &mut t.destination_port),
            Transport::Udp(u) => std::mem::swap(&mut u.source_port, &mut u.destination_port),
        }
    }

    /// Builds the RST|ACK a peer would send to refuse this TCP segment.
    /// Returns `None` for UDP and for segments that are themselves resets.
    pub fn reset_reply(&self) -> Option<Ipv4Packet> {
        let Transport::Tcp(tcp) = &self.transport else {
            return None;
        };
        if tcp.flags.contains(TcpFlags::RST) {
            return None;
        }

        let mut consumed = tcp.payload.len() as u32;
        if tcp.flags.contains(TcpFlags::SYN) {
            consumed += 1;
        }
        if tcp.flags.contains(TcpFlags::FIN) {
            consumed += 1;
        }

        let mut reply = self.clone();
        reply.swap_endpoints();
        reply.ip.options.clear();
        reply.ip.identification = 0;
        reply.ip.ttl = 64;
        if let Transport::Tcp(t) = &mut reply.transport {
            t.sequence = if tcp.flags.contains(TcpFlags::ACK) {
                tcp.acknowledgement
            } else {
                0
            };
            t.acknowledgement = tcp.sequence.wrapping_add(consumed);
            t.flags = TcpFlags::RST | TcpFlags::ACK;
            t.window = 0;
            t.urgent_pointer = 0;
            t.options.clear();
            t.payload.clear();
        }
        Some(reply)
    }

    /// The record handed to the decision engine for this datagram.
    pub fn observe(&self, time: i64, uid: Option<u32>) -> Packet {
        let (sport, dport) = self.transport.ports();
        let flags = match &self.transport {
            Transport::Tcp(t) => t.flags.summary(),
            Transport::Udp(_) => String::new(),
        };
        Packet {
            time,
            version: 4,
            protocol: self.ip.protocol,
            flags,
            saddr: IpAddr::V4(self.ip.source),
            sport: Some(sport),
            daddr: IpAddr::V4(self.ip.destination),
            dport: Some(dport),
            data: None,
            uid,
            allowed: false,
        }
    }
}

impl fmt::Display for Ipv4Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sport, dport) = self.transport.ports();
        match &self.transport {
            Transport::Tcp(t) => write!(
                f,
                "TCP {}:{} > {}:{} [{}] seq {} ack {} len {}",
                self.ip.source,
                sport,
                self.ip.destination,
                dport,
                t.flags,
                t.sequence,
                t.acknowledgement,
                t.payload.len()
            ),
            Transport::Udp(u) => write!(
                f,
                "UDP {}:{} > {}:{} len {}",
                self.ip.source,
                sport,
                self.ip.destination,
                dport,
                u.payload.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcp_packet(flags: TcpFlags, payload: &[u8]) -> Ipv4Packet {
        let ip = Ipv4Header {
            version: 4,
            ihl: 5,
            dscp: 0,
            ecn: 0,
            total_length: 0,
            identification: 0x1234,
            reserved_flag: false,
            dont_fragment: true,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: proto::TCP,
            checksum: 0,
            computed_checksum: 0,
            source: Ipv4Addr::new(10, 1, 10, 1),
            destination: Ipv4Addr::new(93, 184, 216, 34),
            options: Vec::new(),
        };
        let tcp = TcpSegment {
            source_port: 40000,
            destination_port: 80,
            sequence: 1000,
            acknowledgement: 5000,
            data_offset: 5,
            reserved: 0,
            flags,
            window: 65535,
            checksum: 0,
            computed_checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
            payload: payload.to_vec(),
        };
        Ipv4Packet {
            ip,
            transport: Transport::Tcp(tcp),
        }
    }

    #[test]
    fn encoded_packets_decode_and_validate() {
        let wire = tcp_packet(TcpFlags::PSH | TcpFlags::ACK, b"GET / HTTP/1.0\r\n\r\n").encode();
        let pkt = Ipv4Packet::decode(&wire).unwrap();
        assert!(pkt.validate().is_ok());
        assert_eq!(pkt.ip.total_length as usize, wire.len());
        assert_eq!(pkt.encode(), wire);
    }

    #[test]
    fn trailing_bytes_after_total_length_are_ignored() {
        let wire = tcp_packet(TcpFlags::SYN, b"").encode();
        let mut padded = wire.to_vec();
        padded.extend_from_slice(&[0xEE; 6]);
        let pkt = Ipv4Packet::decode(&padded).unwrap();
        assert!(pkt.validate().is_ok());
        assert_eq!(pkt.encode(), wire);
    }

    #[test]
    fn unknown_protocol_is_reported() {
        let mut wire = tcp_packet(TcpFlags::SYN, b"").encode().to_vec();
        wire[9] = proto::SCTP;
        assert_eq!(
            Ipv4Packet::decode(&wire),
            Err(PacketError::UnsupportedProtocol(proto::SCTP))
        );
    }

    #[test]
    fn non_initial_fragment_is_rejected() {
        let mut wire = tcp_packet(TcpFlags::SYN, b"").encode().to_vec();
        wire[7] = 0x10;
        assert!(matches!(Ipv4Packet::decode(&wire), Err(PacketError::Malformed { .. })));
    }

    #[test]
    fn corrupted_payload_fails_tcp_checksum() {
        let mut wire = tcp_packet(TcpFlags::PSH | TcpFlags::ACK, b"hello").encode().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let pkt = Ipv4Packet::decode(&wire).unwrap();
        assert!(matches!(
            pkt.validate(),
            Err(PacketError::ChecksumMismatch { layer: "TCP", .. })
        ));
    }

    #[test]
    fn swap_exchanges_addresses_and_ports() {
        let mut pkt = tcp_packet(TcpFlags::SYN, b"");
        pkt.swap_endpoints();
        assert_eq!(pkt.ip.source, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(pkt.ip.destination, Ipv4Addr::new(10, 1, 10, 1));
        assert_eq!(pkt.transport.ports(), (80, 40000));
    }

    #[test]
    fn reset_reply_to_syn() {
        let syn = tcp_packet(TcpFlags::SYN, b"");
        let rst = syn.reset_reply().unwrap();
        let Transport::Tcp(t) = &rst.transport else {
            panic!("expected tcp");
        };
        assert_eq!(t.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(t.sequence, 0);
        assert_eq!(t.acknowledgement, 1001);
        assert_eq!(rst.transport.ports(), (80, 40000));

        let decoded = Ipv4Packet::decode(&rst.encode()).unwrap();
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn reset_reply_to_data_uses_peer_ack() {
        let data = tcp_packet(TcpFlags::PSH | TcpFlags::ACK, b"abc");
        let rst = data.reset_reply().unwrap();
        let Transport::Tcp(t) = &rst.transport else {
            panic!("expected tcp");
        };
        assert_eq!(t.sequence, 5000);
        assert_eq!(t.acknowledgement, 1003);
        assert!(t.payload.is_empty());
        assert!(tcp_packet(TcpFlags::RST, b"").reset_reply().is_none());
    }

    #[test]
    fn observe_carries_flags_and_ports() {
        let p = tcp_packet(TcpFlags::SYN, b"").observe(42, Some(10077));
        assert_eq!(p.flags, "S");
        assert_eq!(p.sport, Some(40000));
        assert_eq!(p.dport, Some(80));
        assert_eq!(p.uid, Some(10077));
        assert_eq!(p.time, 42);
    }
}
