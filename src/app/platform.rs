//! 平台接口：宿主系统推送的网络状态，以及内核调用的宿主能力。
//!
//! 宿主（Android 服务或测试替身）实现这里的 trait；内核只依赖 trait，
//! 不直接接触 VPN 接口、数据库或通知。

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::config::{FirewallConfig, NetworkSettings};
use crate::filter::dns::{AccessEntry, DnsRecord};
use crate::filter::{Forward, NetworkState, Rule};
use crate::route::TunnelConfig;

// ═══════════════════════════════════════════════════════════════════════════
// 数据类型
// ═══════════════════════════════════════════════════════════════════════════

/// 网络连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// 无网络
    #[default]
    None = 0,
    /// Wi-Fi
    WiFi = 1,
    /// 蜂窝数据
    Cellular = 2,
    /// 以太网
    Ethernet = 3,
    /// 其他
    Other = 4,
}

impl NetworkType {
    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::None,
            1 => Self::WiFi,
            2 => Self::Cellular,
            3 => Self::Ethernet,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::WiFi => "wifi",
            Self::Cellular => "cellular",
            Self::Ethernet => "ethernet",
            Self::Other => "other",
        }
    }
}

/// 蜂窝网络代际
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    #[serde(rename = "2G")]
    G2,
    #[serde(rename = "3G")]
    G3,
    #[serde(rename = "4G")]
    G4,
    #[serde(rename = "other")]
    Other,
}

impl Generation {
    pub fn parse(s: &str) -> Self {
        match s {
            "2G" => Self::G2,
            "3G" => Self::G3,
            "4G" => Self::G4,
            _ => Self::Other,
        }
    }
}

/// 宿主上报的原始网络事实，尚未应用用户偏好
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSnapshot {
    pub network_type: NetworkType,
    pub connected: bool,
    /// 系统认为的计量状态
    pub metered: bool,
    pub roaming: bool,
    /// Wi-Fi SSID（仅 WiFi 时有值，可能带引号）
    pub ssid: Option<String>,
    pub generation: Option<Generation>,
    /// SIM 卡国家代码（ISO 3166，小写）
    pub sim_country: Option<String>,
    /// 当前网络国家代码
    pub network_country: Option<String>,
    /// 屏幕点亮且已解锁
    pub interactive: bool,
}

/// EU 加 EEA 国家，漫游在这些国家之间时可视为非漫游
const EU_COUNTRIES: &[&str] = &[
    "at", "be", "bg", "cy", "cz", "de", "dk", "ee", "es", "fi", "fr", "gr", "hr", "hu", "ie",
    "is", "it", "li", "lt", "lu", "lv", "mt", "nl", "no", "pl", "pt", "ro", "se", "si", "sk",
];

impl NetworkSnapshot {
    pub fn is_wifi(&self) -> bool {
        self.network_type == NetworkType::WiFi
    }

    fn is_national(&self) -> bool {
        match (&self.sim_country, &self.network_country) {
            (Some(sim), Some(net)) => sim.eq_ignore_ascii_case(net),
            _ => false,
        }
    }

    fn is_eu(&self) -> bool {
        let in_eu = |c: &Option<String>| {
            c.as_deref()
                .map(|c| EU_COUNTRIES.contains(&c.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        };
        in_eu(&self.sim_country) && in_eu(&self.network_country)
    }

    fn on_home_wifi(&self, homes: &[String]) -> bool {
        let Some(ssid) = self.ssid.as_deref() else {
            return false;
        };
        let quoted = format!("\"{}\"", ssid);
        homes.iter().any(|h| h == ssid || *h == quoted)
    }

    /// 按用户偏好换算出决策使用的网络状态
    pub fn effective_state(&self, prefs: &NetworkSettings, firewall: &FirewallConfig) -> NetworkState {
        let wifi = self.is_wifi();

        let mut metered = self.metered;
        if wifi && !prefs.use_metered {
            metered = false;
        }
        if wifi && !prefs.wifi_homes.is_empty() && !self.on_home_wifi(&prefs.wifi_homes) {
            metered = true;
        }
        match self.generation {
            Some(Generation::G2) if prefs.unmetered_2g => metered = false,
            Some(Generation::G3) if prefs.unmetered_3g => metered = false,
            Some(Generation::G4) if prefs.unmetered_4g => metered = false,
            _ => {}
        }

        let mut roaming = self.roaming;
        if roaming && prefs.eu_roaming {
            roaming = !self.is_eu();
        }
        if roaming && prefs.national_roaming {
            roaming = !self.is_national();
        }

        let lockdown = firewall.lockdown
            && if metered {
                firewall.lockdown_other
            } else {
                firewall.lockdown_wifi
            };

        NetworkState {
            connected: self.connected,
            metered,
            roaming,
            interactive: self.interactive,
            lockdown,
        }
    }
}

/// 构建隧道配置所需的宿主环境
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEnvironment {
    /// 系统当前 DNS 服务器，按优先级
    pub system_dns: Vec<IpAddr>,
    /// 活动的非隧道接口所在网段
    pub local_networks: Vec<IpNet>,
    pub mcc: Option<u16>,
    pub mnc: Option<u16>,
    /// 本应用包名，始终不经过隧道
    pub own_package: String,
}

/// 已建立的虚拟接口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    pub id: u64,
    pub fd: i32,
}

/// 原生包处理引擎的启动参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub log: bool,
    pub filter: bool,
    pub mtu: u32,
}

/// 规则作用的网络类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Wifi,
    Other,
}

// ═══════════════════════════════════════════════════════════════════════════
// 宿主能力
// ═══════════════════════════════════════════════════════════════════════════

/// 虚拟接口的建立与拆除（阻塞调用，仅在命令队列线程执行）
pub trait TunnelPlatform: Send + Sync {
    fn establish(&self, config: &TunnelConfig) -> anyhow::Result<TunnelHandle>;
    fn teardown(&self, handle: TunnelHandle);
    /// VPN 权限是否仍然有效
    fn has_permission(&self) -> bool;
    /// 是否支持先建新接口再拆旧接口
    fn supports_handover(&self) -> bool;
}

/// 原生包处理循环
pub trait PacketEngine: Send + Sync {
    fn start(&self, tunnel: &TunnelHandle, options: &EngineOptions) -> anyhow::Result<()>;
    fn stop(&self, tunnel: &TunnelHandle, clear: bool);
    fn is_running(&self) -> bool;
}

/// 持久化的规则、转发、黑名单与访问记录
pub trait RuleStore: Send + Sync {
    fn load_rules(&self) -> anyhow::Result<Vec<Rule>>;
    fn load_forwards(&self) -> anyhow::Result<Vec<Forward>>;
    fn load_blocked_hosts(&self) -> anyhow::Result<HashSet<String>>;
    /// `qname` 为 `None` 时返回全部记录，否则只返回该域名相关的记录
    fn load_access(&self, qname: Option<&str>) -> anyhow::Result<Vec<AccessEntry>>;
    /// 保存一条解析结果；返回是否为新记录
    fn insert_dns(&self, record: &DnsRecord) -> anyhow::Result<bool>;
    fn set_blocked(&self, uid: u32, class: NetworkClass, blocked: bool) -> anyhow::Result<()>;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

/// 当前网络事实
pub trait NetworkMonitor: Send + Sync {
    fn snapshot(&self) -> NetworkSnapshot;
    fn environment(&self) -> NetworkEnvironment;
}

/// 面向用户的通知
pub trait Notifier: Send + Sync {
    fn enforcing(&self, allowed: usize, total: usize);
    fn waiting(&self);
    fn error(&self, message: &str);
    fn stopped(&self);
}

// ═══════════════════════════════════════════════════════════════════════════
// 测试
// ═══════════════════════════════════════════════════════════════════════════
