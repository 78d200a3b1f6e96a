use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use tracing::info;

use netsentry::app::platform::{NetworkEnvironment, NetworkType};
use netsentry::app::{load_tables, FirewallState, MemoryStore, StoreSnapshot};
use netsentry::config::{self, Config};
use netsentry::filter::{decide, FilterSettings, NetworkState, Rule};
use netsentry::packet::{Ipv4Packet, Packet};
use netsentry::route::{to_cidr_blocks, TunnelConfigBuilder};

#[derive(Parser, Debug)]
#[command(version, about = "No-root firewall core tools", long_about = None)]
struct Args {
    /// Log filter, overrides the config and RUST_LOG
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Validate a config file and an optional store snapshot
    Check {
        config: PathBuf,
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Minimal CIDR blocks covering an IPv4 range
    Cidr { start: Ipv4Addr, end: Ipv4Addr },
    /// Print the interface configuration for a config and snapshot
    Routes {
        config: PathBuf,
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        mcc: Option<u16>,
        #[arg(long)]
        mnc: Option<u16>,
        /// Local networks kept off the tunnel (with `tunnel.lan`)
        #[arg(long, num_args = 1..)]
        lan: Vec<IpNet>,
        /// System resolvers
        #[arg(long, num_args = 1..)]
        dns: Vec<IpAddr>,
        #[arg(long)]
        metered: bool,
    },
    /// Decode an IPv4 packet given as hex
    Decode { hex: String },
    /// Decide one packet (JSON) against a config and snapshot
    Decide {
        config: PathBuf,
        snapshot: PathBuf,
        packet: String,
        #[arg(long)]
        metered: bool,
        #[arg(long)]
        roaming: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.command {
        Cmd::Check { config, .. } | Cmd::Routes { config, .. } | Cmd::Decide { config, .. } => {
            Some(load(config)?)
        }
        _ => None,
    };
    init_tracing(args.log.as_deref(), config.as_ref());

    match args.command {
        Cmd::Check { snapshot, .. } => {
            let config = config.unwrap_or_default();
            info!(
                filter = config.firewall.filter,
                subnet = config.tunnel.subnet,
                mtu = config.tunnel.mtu,
                "config ok"
            );
            if let Some(path) = snapshot {
                let snap = StoreSnapshot::load(&path)?;
                println!(
                    "snapshot ok: {} rules, {} forwards, {} hosts, {} access, {} dns",
                    snap.rules.len(),
                    snap.forwards.len(),
                    snap.hosts.len(),
                    snap.access.len(),
                    snap.dns.len()
                );
            }
            println!("config ok");
        }
        Cmd::Cidr { start, end } => {
            if start > end {
                anyhow::bail!("start {} is above end {}", start, end);
            }
            for block in to_cidr_blocks(start, end) {
                println!("{}", block);
            }
        }
        Cmd::Routes {
            snapshot,
            mcc,
            mnc,
            lan,
            dns,
            metered,
            ..
        } => {
            let config = config.unwrap_or_default();
            let snap = match snapshot {
                Some(path) => StoreSnapshot::load(&path)?,
                None => StoreSnapshot::default(),
            };
            let env = NetworkEnvironment {
                system_dns: dns,
                local_networks: lan,
                mcc,
                mnc,
                own_package: env!("CARGO_PKG_NAME").to_string(),
            };
            let state = NetworkState {
                connected: true,
                metered,
                ..NetworkState::default()
            };
            let allowed: Vec<&Rule> = snap.rules.iter().filter(|r| r.is_allowed(&state)).collect();
            let network_type = if metered {
                NetworkType::Cellular
            } else {
                NetworkType::WiFi
            };
            let tunnel = TunnelConfigBuilder::new(&config.tunnel, &config.firewall, &env).build(
                &allowed,
                &snap.rules,
                &state,
                network_type,
            );
            println!("{}", serde_json::to_string_pretty(&tunnel)?);
        }
        Cmd::Decode { hex } => {
            let bytes = parse_hex(&hex)?;
            let packet = Ipv4Packet::decode(&bytes)?;
            println!("{}", packet);
            match packet.validate() {
                Ok(()) => println!("valid"),
                Err(e) => println!("invalid: {}", e),
            }
        }
        Cmd::Decide {
            snapshot,
            packet,
            metered,
            roaming,
            ..
        } => {
            let config = config.unwrap_or_default();
            let store = MemoryStore::new(StoreSnapshot::load(&snapshot)?);
            let state = FirewallState::new(FilterSettings::from_config(&config.firewall, None));
            let rules = store.snapshot().rules;
            load_tables(&state, &store, &config.firewall, rules)?;

            let packet: Packet = serde_json::from_str(&packet).context("invalid packet JSON")?;
            let network = NetworkState {
                connected: true,
                metered,
                roaming,
                ..NetworkState::default()
            };
            let tables = state
                .tables
                .read()
                .map_err(|_| anyhow::anyhow!("filter tables poisoned"))?;
            let decision = decide(&tables, &packet, &network);
            println!("{}", serde_json::to_string(&decision)?);
        }
    }
    Ok(())
}

fn load(path: &PathBuf) -> Result<Config> {
    let path = path.to_str().context("config path is not UTF-8")?;
    config::load_config(path)
}

fn init_tracing(flag: Option<&str>, config: Option<&Config>) {
    let filter = match flag {
        Some(f) => tracing_subscriber::EnvFilter::new(f),
        None => tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(config.map(|c| c.log.level.as_str()).unwrap_or("info"))
        }),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        anyhow::bail!("expected an even number of hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).with_context(|| format!("bad hex at offset {}", i))
        })
        .collect()
}
