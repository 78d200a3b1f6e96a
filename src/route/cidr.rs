//! Range to CIDR decomposition for split-tunnel route tables.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

const ADDRESS_SPACE_END: u64 = u32::MAX as u64;

/// Minimal ordered list of CIDR blocks covering `start..=end` exactly.
///
/// Returns an empty list when `start > end`.
pub fn to_cidr_blocks(start: Ipv4Addr, end: Ipv4Addr) -> Vec<Ipv4Net> {
    blocks_between(u32::from(start) as u64, u32::from(end) as u64)
}

// u64 so that advancing past 255.255.255.255 terminates instead of wrapping
fn blocks_between(mut start: u64, end: u64) -> Vec<Ipv4Net> {
    let mut blocks = Vec::new();
    while start <= end {
        // 对齐：start 能整除的最大块
        let mut prefix: u8 = 32;
        while prefix > 0 && start & block_size(prefix - 1).wrapping_sub(1) == 0 {
            prefix -= 1;
        }
        // 收缩：块不能超出 end
        while block_size(prefix) > end - start + 1 {
            prefix += 1;
        }

        match Ipv4Net::new(Ipv4Addr::from(start as u32), prefix) {
            Ok(net) => blocks.push(net),
            Err(_) => break,
        }
        start += block_size(prefix);
    }
    blocks
}

fn block_size(prefix: u8) -> u64 {
    1u64 << (32 - prefix as u32)
}

/// First and last address of a block, as integers.
pub fn block_bounds(net: &Ipv4Net) -> (u64, u64) {
    (
        u32::from(net.network()) as u64,
        u32::from(net.broadcast()) as u64,
    )
}

/// Every IPv4 address not covered by `exclusions`, as routes.
///
/// Exclusions may be unsorted and may overlap.
pub fn exclusion_complement(exclusions: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut sorted: Vec<(u64, u64)> = exclusions.iter().map(block_bounds).collect();
    sorted.sort_unstable();

    let mut routes = Vec::new();
    let mut next: u64 = 0;
    for (first, last) in sorted {
        if first > next {
            routes.extend(blocks_between(next, first - 1));
        }
        next = next.max(last + 1);
    }
    if next <= ADDRESS_SPACE_END {
        routes.extend(blocks_between(next, ADDRESS_SPACE_END));
    }
    routes
}
