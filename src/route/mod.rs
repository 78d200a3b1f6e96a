//! Route tables and the virtual interface configuration.

pub mod cidr;
pub mod tunnel;

pub use cidr::{exclusion_complement, to_cidr_blocks};
pub use tunnel::{TunnelConfig, TunnelConfigBuilder};
