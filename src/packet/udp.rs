use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::checksum::transport_checksum_ipv4;
use super::{ensure_len, proto, PacketError};

const LAYER: &str = "UDP";
pub const HEADER_LEN: usize = 8;
const CHECKSUM_OFFSET: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    /// Zero on the wire means the sender skipped checksumming.
    pub checksum: u16,
    pub computed_checksum: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    pub fn decode(src: Ipv4Addr, dst: Ipv4Addr, buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(LAYER, buf, HEADER_LEN)?;

        let length = u16::from_be_bytes([buf[4], buf[5]]);
        if (length as usize) < HEADER_LEN || length as usize > buf.len() {
            return Err(PacketError::malformed(
                LAYER,
                format!("length {} outside 8..={}", length, buf.len()),
            ));
        }
        let datagram = &buf[..length as usize];

        Ok(Self {
            source_port: u16::from_be_bytes([buf[0], buf[1]]),
            destination_port: u16::from_be_bytes([buf[2], buf[3]]),
            length,
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            computed_checksum: udp_checksum(src, dst, datagram),
            payload: datagram[HEADER_LEN..].to_vec(),
        })
    }

    /// A zero wire checksum is accepted as "not computed".
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.checksum != 0 && self.checksum != self.computed_checksum {
            return Err(PacketError::ChecksumMismatch {
                layer: LAYER,
                wire: self.checksum,
                computed: self.computed_checksum,
            });
        }
        Ok(())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Appends the datagram with the length recomputed. The checksum is left
    /// at zero when the decoded datagram had none, and filled in otherwise.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, out: &mut BytesMut) {
        let start = out.len();
        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u16(self.encoded_len() as u16);
        out.put_u16(0);
        out.put_slice(&self.payload);

        if self.checksum != 0 {
            let csum = udp_checksum(src, dst, &out[start..]);
            out[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 2]
                .copy_from_slice(&csum.to_be_bytes());
        }
    }
}

fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    match transport_checksum_ipv4(src, dst, proto::UDP, datagram, CHECKSUM_OFFSET) {
        // RFC 768: a computed zero is sent as all ones
        0 => 0xFFFF,
        csum => csum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 10, 1)
    }

    fn dst() -> Ipv4Addr {
        Ipv4Addr::new(8, 8, 8, 8)
    }

    fn dns_query(with_checksum: bool) -> Vec<u8> {
        let mut d = vec![0xd4, 0x31, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00, 0xab, 0xcd, 0x01, 0x00];
        if with_checksum {
            let csum = udp_checksum(src(), dst(), &d);
            d[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        d
    }

    #[test]
    fn decode_reads_ports_and_payload() {
        let d = UdpDatagram::decode(src(), dst(), &dns_query(true)).unwrap();
        assert_eq!(d.source_port, 54321);
        assert_eq!(d.destination_port, 53);
        assert_eq!(d.length, 12);
        assert_eq!(d.payload, vec![0xab, 0xcd, 0x01, 0x00]);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn zero_checksum_is_accepted() {
        let d = UdpDatagram::decode(src(), dst(), &dns_query(false)).unwrap();
        assert_eq!(d.checksum, 0);
        assert!(d.validate().is_ok());
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let mut bytes = dns_query(true);
        bytes[7] ^= 0xFF;
        let d = UdpDatagram::decode(src(), dst(), &bytes).unwrap();
        assert!(matches!(d.validate(), Err(PacketError::ChecksumMismatch { .. })));
    }

    #[test]
    fn bad_length_field_is_malformed() {
        let mut bytes = dns_query(false);
        bytes[5] = 0x40;
        assert!(matches!(
            UdpDatagram::decode(src(), dst(), &bytes),
            Err(PacketError::Malformed { .. })
        ));
        bytes[5] = 0x04;
        assert!(matches!(
            UdpDatagram::decode(src(), dst(), &bytes),
            Err(PacketError::Malformed { .. })
        ));
    }

    #[test]
    fn encode_keeps_checksum_mode() {
        for with_checksum in [true, false] {
            let bytes = dns_query(with_checksum);
            let d = UdpDatagram::decode(src(), dst(), &bytes).unwrap();
            let mut out = BytesMut::new();
            d.encode(src(), dst(), &mut out);
            assert_eq!(&out[..], &bytes[..]);
        }
    }
}
