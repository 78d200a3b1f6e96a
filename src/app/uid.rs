//! Socket owner lookup through the kernel's procfs socket tables.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::packet::proto;

pub const DEFAULT_TRIES: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(10);

/// Finds the uid owning a socket by scanning `/proc/net/{tcp,udp,icmp}{,6}`.
#[derive(Debug, Clone)]
pub struct UidResolver {
    root: PathBuf,
    tries: u32,
    delay: Duration,
}

impl Default for UidResolver {
    fn default() -> Self {
        Self::new("/proc/net")
    }
}

impl UidResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tries: DEFAULT_TRIES,
            delay: DEFAULT_DELAY,
        }
    }

    pub fn with_retry(mut self, tries: u32, delay: Duration) -> Self {
        self.tries = tries.max(1);
        self.delay = delay;
        self
    }

    /// Owner of the socket `source -> destination`.
    ///
    /// IPv4 sockets are looked up in the IPv6 table first, as dual-stack
    /// sockets show up there with IPv4-mapped addresses.
    pub fn lookup(&self, protocol: u8, source: SocketAddr, destination: SocketAddr) -> Option<u32> {
        let table = match protocol {
            proto::TCP => "tcp",
            proto::UDP => "udp",
            proto::ICMP | proto::ICMPV6 => "icmp",
            _ => return None,
        };

        for attempt in 0..self.tries {
            if attempt > 0 {
                std::thread::sleep(self.delay);
            }
            if let Some(uid) = self.scan(table, source, destination) {
                debug!(protocol, %source, %destination, uid, attempt, "uid resolved");
                return Some(uid);
            }
        }
        debug!(protocol, %source, %destination, "uid not found");
        None
    }

    fn scan(&self, table: &str, source: SocketAddr, destination: SocketAddr) -> Option<u32> {
        match (source.ip(), destination.ip()) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let mapped_src = SocketAddr::new(IpAddr::V6(s.to_ipv6_mapped()), source.port());
                let mapped_dst = SocketAddr::new(IpAddr::V6(d.to_ipv6_mapped()), destination.port());
                self.scan_file(&format!("{}6", table), mapped_src, mapped_dst)
                    .or_else(|| self.scan_file(table, source, destination))
            }
            _ => self.scan_file(&format!("{}6", table), source, destination),
        }
    }

    fn scan_file(&self, name: &str, source: SocketAddr, destination: SocketAddr) -> Option<u32> {
        let content = fs::read_to_string(self.root.join(name)).ok()?;
        find_uid_in_table(&content, source, destination)
    }
}

/// Scans one procfs socket table. A wildcard local address or an unconnected
/// remote end (`0.0.0.0:0`) matches any value.
pub fn find_uid_in_table(content: &str, source: SocketAddr, destination: SocketAddr) -> Option<u32> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let (Some(local), Some(remote)) = (parse_endpoint(fields[1]), parse_endpoint(fields[2])) else {
            continue;
        };

        let local_match = local.port() == source.port()
            && (local.ip() == source.ip() || local.ip().is_unspecified());
        let remote_match = remote == destination || (remote.ip().is_unspecified() && remote.port() == 0);
        if local_match && remote_match {
            if let Ok(uid) = fields[7].parse::<u32>() {
                return Some(uid);
            }
        }
    }
    None
}

/// Parses `0100007F:0035` or the 32-digit IPv6 form.
fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(u32::from_str_radix(addr, 16).ok()?.to_le_bytes())),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP4: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0100007F:0035 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1\n\
   1: 010A010A:9C40 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000 10050        0 23456 1\n";

    const TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0000000000000000FFFF0000010A010A:9C41 0000000000000000FFFF000022D8B85D:01BB 01 00000000:00000000 00:00000000 00000000 10077        0 34567 1\n";

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(parse_endpoint("0100007F:0035"), Some(sa("127.0.0.1:53")));
        assert_eq!(
            parse_endpoint("0000000000000000FFFF0000010A010A:9C41"),
            Some(sa("[::ffff:10.1.10.1]:40001"))
        );
        assert_eq!(parse_endpoint("zz:0035"), None);
    }

    #[test]
    fn finds_connected_socket() {
        assert_eq!(
            find_uid_in_table(TCP4, sa("10.1.10.1:40000"), sa("93.184.216.34:443")),
            Some(10050)
        );
        assert_eq!(find_uid_in_table(TCP4, sa("10.1.10.1:40000"), sa("1.1.1.1:443")), None);
    }

    #[test]
    fn listening_socket_matches_any_remote() {
        assert_eq!(find_uid_in_table(TCP4, sa("127.0.0.1:53"), sa("10.0.0.9:5353")), Some(0));
    }

    #[test]
    fn resolver_prefers_mapped_ipv6_table() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tcp"), TCP4).unwrap();
        fs::write(dir.path().join("tcp6"), TCP6).unwrap();
        let resolver = UidResolver::new(dir.path()).with_retry(1, Duration::ZERO);

        assert_eq!(
            resolver.lookup(proto::TCP, sa("10.1.10.1:40001"), sa("93.184.216.34:443")),
            Some(10077)
        );
        assert_eq!(
            resolver.lookup(proto::TCP, sa("10.1.10.1:40000"), sa("93.184.216.34:443")),
            Some(10050)
        );
        assert_eq!(resolver.lookup(proto::UDP, sa("10.1.10.1:1"), sa("8.8.8.8:53")), None);
        assert_eq!(resolver.lookup(proto::SCTP, sa("10.1.10.1:1"), sa("8.8.8.8:53")), None);
    }
}
