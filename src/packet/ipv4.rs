use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::checksum::ipv4_header_checksum;
use super::{ensure_len, PacketError};

const LAYER: &str = "IP";
pub const MIN_HEADER_LEN: usize = 20;

const FLAG_RESERVED: u16 = 0x8000;
const FLAG_DF: u16 = 0x4000;
const FLAG_MF: u16 = 0x2000;
const FRAGMENT_MASK: u16 = 0x1FFF;

/// Decoded IPv4 header.
///
/// `checksum` is the value read from the wire; `computed_checksum` is what the
/// header actually sums to. `validate()` compares the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub reserved_flag: bool,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub computed_checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Parses the header at the start of `buf`.
    ///
    /// Checks only what is needed to locate the payload: version, IHL and total
    /// length against the buffer. Checksum and reserved bits are left to
    /// [`validate`](Self::validate).
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(LAYER, buf, MIN_HEADER_LEN)?;

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let ihl = buf[0] & 0x0F;
        if ihl < 5 {
            return Err(PacketError::malformed(LAYER, format!("IHL {} < 5", ihl)));
        }
        let header_len = ihl as usize * 4;
        ensure_len(LAYER, buf, header_len)?;

        let total_length = u16::from_be_bytes([buf[2], buf[3]]);
        if (total_length as usize) < header_len {
            return Err(PacketError::malformed(
                LAYER,
                format!("total length {} < header length {}", total_length, header_len),
            ));
        }
        if total_length as usize > buf.len() {
            return Err(PacketError::malformed(
                LAYER,
                format!("total length {} > buffer {}", total_length, buf.len()),
            ));
        }

        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);

        Ok(Self {
            version,
            ihl,
            dscp: buf[1] >> 2,
            ecn: buf[1] & 0x03,
            total_length,
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            reserved_flag: flags_fragment & FLAG_RESERVED != 0,
            dont_fragment: flags_fragment & FLAG_DF != 0,
            more_fragments: flags_fragment & FLAG_MF != 0,
            fragment_offset: flags_fragment & FRAGMENT_MASK,
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            computed_checksum: ipv4_header_checksum(&buf[..header_len]),
            source: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            destination: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
            options: buf[MIN_HEADER_LEN..header_len].to_vec(),
        })
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    pub fn validate(&self) -> Result<(), PacketError> {
        if self.ihl < 5 {
            return Err(PacketError::malformed(LAYER, format!("IHL {} < 5", self.ihl)));
        }
        if (self.total_length as usize) < MIN_HEADER_LEN {
            return Err(PacketError::malformed(
                LAYER,
                format!("total length {} < 20", self.total_length),
            ));
        }
        if self.reserved_flag {
            return Err(PacketError::ReservedBits { layer: LAYER });
        }
        if self.checksum != self.computed_checksum {
            return Err(PacketError::ChecksumMismatch {
                layer: LAYER,
                wire: self.checksum,
                computed: self.computed_checksum,
            });
        }
        Ok(())
    }

    /// Appends the header to `out` with IHL, total length and checksum
    /// derived from the options and `payload_len`.
    pub fn encode(&self, payload_len: usize, out: &mut BytesMut) {
        let padded_options = (self.options.len() + 3) / 4 * 4;
        let header_len = MIN_HEADER_LEN + padded_options;
        let start = out.len();

        out.put_u8((4 << 4) | (header_len / 4) as u8);
        out.put_u8((self.dscp << 2) | (self.ecn & 0x03));
        out.put_u16((header_len + payload_len) as u16);
        out.put_u16(self.identification);
        let mut flags_fragment = self.fragment_offset & FRAGMENT_MASK;
        if self.reserved_flag {
            flags_fragment |= FLAG_RESERVED;
        }
        if self.dont_fragment {
            flags_fragment |= FLAG_DF;
        }
        if self.more_fragments {
            flags_fragment |= FLAG_MF;
        }
        out.put_u16(flags_fragment);
        out.put_u8(self.ttl);
        out.put_u8(self.protocol);
        out.put_u16(0);
        out.put_slice(&self.source.octets());
        out.put_slice(&self.destination.octets());
        out.put_slice(&self.options);
        out.put_bytes(0, padded_options - self.options.len());

        let csum = ipv4_header_checksum(&out[start..start + header_len]);
        out[start + 10..start + 12].copy_from_slice(&csum.to_be_bytes());
    }
}

impl fmt::Display for Ipv4Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > {} proto {} ttl {} len {}",
            self.source, self.destination, self.protocol, self.ttl, self.total_length
        )
    }
}
