pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{
    Config, FirewallConfig, LogConfig, NetworkSettings, SessionSettings, TunnelSettings,
};

/// Parses YAML (JSON is a subset) and validates it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yml::from_str(content).context("invalid config document")?
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config {}", path))?;
    let config = parse_config(&content)?;
    tracing::debug!(
        path,
        filter = config.firewall.filter,
        subnet = config.tunnel.subnet,
        "config loaded"
    );
    Ok(config)
}

/// Parses a JSON document as handed over the FFI boundary.
pub fn parse_json_config(content: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(content).context("invalid JSON config")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        let cfg = parse_config("").unwrap();
        assert!(!cfg.firewall.filter);
        assert_eq!(cfg.firewall.system_uid_threshold, 2000);
        assert_eq!(cfg.tunnel.mtu, 10000);
        assert_eq!(cfg.tunnel.vpn4, "10.1.10.1");
        assert!(cfg.tunnel.ip6);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg = parse_config(
            "firewall:\n  filter: true\n  use_hosts: true\ntunnel:\n  subnet: true\n  dns: 9.9.9.9\nnetwork:\n  wifi_homes: [home]\n",
        )
        .unwrap();
        assert!(cfg.firewall.filter);
        assert!(cfg.firewall.use_hosts);
        assert_eq!(cfg.firewall.log_queue_depth, 4096);
        assert!(cfg.tunnel.subnet);
        assert_eq!(cfg.tunnel.dns.as_deref(), Some("9.9.9.9"));
        assert_eq!(cfg.network.wifi_homes, vec!["home".to_string()]);
        assert!(cfg.session.screen_on);
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(parse_config("tunnel:\n  mtu: 500\n").is_err());
        assert!(parse_config("firewall:\n  log_queue_depth: 0\n").is_err());
        assert!(parse_config("tunnel:\n  vpn4: fd00::1\n").is_err());
        assert!(parse_config("tunnel:\n  vpn6: 10.0.0.1\n").is_err());
        assert!(parse_config("tunnel:\n  dns2: not-an-ip\n").is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netsentry.yaml");
        std::fs::write(&path, "log:\n  level: debug\nsession:\n  show_stats: true\n").unwrap();
        let cfg = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.log.level, "debug");
        assert!(cfg.session.show_stats);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = load_config("/nonexistent/netsentry.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn json_config() {
        let cfg = parse_json_config(r#"{"firewall":{"filter":true},"tunnel":{"ip6":false}}"#).unwrap();
        assert!(cfg.firewall.filter);
        assert!(!cfg.tunnel.ip6);
    }
}
