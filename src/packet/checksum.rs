//! Internet checksum (RFC 1071).
//!
//! The same accumulator is used on the decode side (to recompute and compare)
//! and on the encode side (to fill in the field), so both always agree
//! byte for byte.

use std::net::Ipv4Addr;

/// Running one's-complement sum over big-endian 16-bit words.
///
/// Feeding data in several chunks gives the same result as one contiguous
/// slice as long as every chunk except the last has even length.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self { sum: 0 }
    }

    pub fn add_u16(&mut self, word: u16) {
        self.sum += word as u32;
        self.fold();
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        // 奇数长度：末尾补零
        if let [last] = chunks.remainder() {
            self.add_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    fn fold(&mut self) {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// Complemented 16-bit result, ready to be written into a header.
    pub fn finish(self) -> u16 {
        !(self.sum as u16)
    }
}

/// Checksum of a contiguous buffer.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(data);
    c.finish()
}

/// Checksum of an IPv4 header, with the checksum field (bytes 10..12) taken as zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(&header[..10.min(header.len())]);
    if header.len() > 12 {
        c.add_bytes(&header[12..]);
    }
    c.finish()
}

/// Transport checksum over the IPv4 pseudo-header followed by `segment`.
///
/// `checksum_offset` is the position of the checksum field inside `segment`;
/// it is treated as zero so the caller does not have to clear it first.
pub fn transport_checksum_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
    checksum_offset: usize,
) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_u16(protocol as u16);
    c.add_u16(segment.len() as u16);

    let end = (checksum_offset + 2).min(segment.len());
    c.add_bytes(&segment[..checksum_offset.min(segment.len())]);
    c.add_bytes(&segment[end..]);
    c.finish()
}
