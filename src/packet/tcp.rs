use std::fmt;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::checksum::transport_checksum_ipv4;
use super::{ensure_len, proto, PacketError};

const LAYER: &str = "TCP";
pub const MIN_HEADER_LEN: usize = 20;
const CHECKSUM_OFFSET: usize = 16;

/// The nine TCP control bits, NS in bit 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TcpFlags(pub u16);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x001);
    pub const SYN: TcpFlags = TcpFlags(0x002);
    pub const RST: TcpFlags = TcpFlags(0x004);
    pub const PSH: TcpFlags = TcpFlags(0x008);
    pub const ACK: TcpFlags = TcpFlags(0x010);
    pub const URG: TcpFlags = TcpFlags(0x020);
    pub const ECE: TcpFlags = TcpFlags(0x040);
    pub const CWR: TcpFlags = TcpFlags(0x080);
    pub const NS: TcpFlags = TcpFlags(0x100);

    const LETTERS: [(TcpFlags, char); 9] = [
        (TcpFlags::SYN, 'S'),
        (TcpFlags::ACK, 'A'),
        (TcpFlags::PSH, 'P'),
        (TcpFlags::FIN, 'F'),
        (TcpFlags::RST, 'R'),
        (TcpFlags::URG, 'U'),
        (TcpFlags::ECE, 'E'),
        (TcpFlags::CWR, 'C'),
        (TcpFlags::NS, 'N'),
    ];

    pub fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Compact letter form used in packet logs, e.g. `"SA"`.
    pub fn summary(self) -> String {
        Self::LETTERS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, c)| *c)
            .collect()
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Decoded TCP segment, header fields plus the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    /// The three bits between data offset and NS.
    pub reserved: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub computed_checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Parses `buf`, which holds exactly the IP payload. The addresses feed the
    /// pseudo-header for `computed_checksum`.
    pub fn decode(src: Ipv4Addr, dst: Ipv4Addr, buf: &[u8]) -> Result<Self, PacketError> {
        ensure_len(LAYER, buf, MIN_HEADER_LEN)?;

        let data_offset = buf[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::malformed(
                LAYER,
                format!("data offset {} < 5", data_offset),
            ));
        }
        let header_len = data_offset as usize * 4;
        if header_len > buf.len() {
            return Err(PacketError::malformed(
                LAYER,
                format!("data offset {} beyond segment of {} bytes", data_offset, buf.len()),
            ));
        }

        Ok(Self {
            source_port: u16::from_be_bytes([buf[0], buf[1]]),
            destination_port: u16::from_be_bytes([buf[2], buf[3]]),
            sequence: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            acknowledgement: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_offset,
            reserved: (buf[12] >> 1) & 0x07,
            flags: TcpFlags(((buf[12] as u16 & 0x01) << 8) | buf[13] as u16),
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
            computed_checksum: transport_checksum_ipv4(src, dst, proto::TCP, buf, CHECKSUM_OFFSET),
            urgent_pointer: u16::from_be_bytes([buf[18], buf[19]]),
            options: buf[MIN_HEADER_LEN..header_len].to_vec(),
            payload: buf[header_len..].to_vec(),
        })
    }

    pub fn validate(&self) -> Result<(), PacketError> {
        if !(5..=15).contains(&self.data_offset) {
            return Err(PacketError::malformed(
                LAYER,
                format!("data offset {} outside 5..=15", self.data_offset),
            ));
        }
        if self.reserved != 0 {
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

    pub fn encoded_len(&self) -> usize {
        MIN_HEADER_LEN + (self.options.len() + 3) / 4 * 4 + self.payload.len()
    }

    /// Appends the segment with data offset and checksum recomputed.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, out: &mut BytesMut) {
        let padded_options = (self.options.len() + 3) / 4 * 4;
        let data_offset = ((MIN_HEADER_LEN + padded_options) / 4) as u8;
        let start = out.len();

        out.put_u16(self.source_port);
        out.put_u16(self.destination_port);
        out.put_u32(self.sequence);
        out.put_u32(self.acknowledgement);
        out.put_u8((data_offset << 4) | ((self.reserved & 0x07) << 1) | ((self.flags.0 >> 8) as u8 & 0x01));
        out.put_u8(self.flags.0 as u8);
        out.put_u16(self.window);
        out.put_u16(0);
        out.put_u16(self.urgent_pointer);
        out.put_slice(&self.options);
        out.put_bytes(0, padded_options - self.options.len());
        out.put_slice(&self.payload);

        let csum = transport_checksum_ipv4(src, dst, proto::TCP, &out[start..], CHECKSUM_OFFSET);
        out[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 2].copy_from_slice(&csum.to_be_bytes());
    }
}
