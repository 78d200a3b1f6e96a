//! FFI 层：将防火墙回调以 C ABI 导出，供原生包处理循环调用。
//!
//! 所有导出函数使用统一约定：
//! - 句柄由 `netsentry_firewall_new` 创建，`netsentry_firewall_free` 释放
//! - 返回 i32: 0 = 成功, -1 = 句柄为空, -3 = 参数错误, -4 = 内部错误
//! - 返回 *mut c_char: Rust 分配的字符串，调用方需通过 `netsentry_free_string` 释放

use std::ffi::{CStr, CString};
use std::net::{IpAddr, SocketAddr};
use std::os::raw::c_char;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::log_queue::{spawn_log_worker, LogQueue, TracingSink};
use super::platform::RuleStore;
use super::store::{MemoryStore, StoreSnapshot};
use super::{load_tables, process_uid, Firewall, FirewallState};
use crate::config::{self, Config};
use crate::filter::dns::DnsRecord;
use crate::filter::{FilterSettings, NetworkState};
use crate::packet::{Packet, Usage};

/// 原生侧持有的防火墙实例
pub struct FirewallHandle {
    runtime: tokio::runtime::Runtime,
    cancel: CancellationToken,
    config: Config,
    store: Arc<MemoryStore>,
    firewall: Firewall,
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// 将 Rust String 转为堆分配的 C 字符串指针
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// 安全地从 C 字符串指针读取 &str
unsafe fn from_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// 解析配置：先尝试 JSON, 再尝试 YAML
fn parse_config(content: &str) -> Option<Config> {
    config::parse_json_config(content)
        .or_else(|_| config::parse_config(content))
        .map_err(|e| tracing::error!(error = %e, "invalid config"))
        .ok()
}

/// 对句柄执行操作的宏: 检查空指针 -> 执行闭包
macro_rules! with_handle {
    ($handle:expr, $f:expr) => {{
        match $handle.as_ref() {
            Some(h) => $f(h),
            None => -1,
        }
    }};
}

// ═══════════════════════════════════════════════════════════════════════════
// 生命周期
// ═══════════════════════════════════════════════════════════════════════════

/// 初始化 Android 日志（仅 android feature）
#[cfg(feature = "android")]
#[no_mangle]
pub extern "C" fn netsentry_init_logging() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("netsentry"),
    );
}

/// 创建防火墙实例
///
/// # Safety
/// `config` 必须是合法的 C 字符串指针（JSON 或 YAML）；`snapshot` 可为空
#[no_mangle]
pub unsafe extern "C" fn netsentry_firewall_new(
    config: *const c_char,
    snapshot: *const c_char,
) -> *mut FirewallHandle {
    let Some(config) = from_c_str(config).and_then(parse_config) else {
        return std::ptr::null_mut();
    };
    let snapshot = match from_c_str(snapshot) {
        Some(s) => match StoreSnapshot::parse(s) {
            Ok(snap) => snap,
            Err(e) => {
                tracing::error!(error = %e, "invalid snapshot");
                return std::ptr::null_mut();
            }
        },
        None => StoreSnapshot::default(),
    };

    // 日志消费只需要一个工作线程
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("netsentry-log")
        .build()
    {
        Ok(rt) => rt,
        Err(_) => return std::ptr::null_mut(),
    };

    let cancel = CancellationToken::new();
    let (log, rx) = LogQueue::new(config.firewall.log_queue_depth);
    {
        let _guard = runtime.enter();
        spawn_log_worker(rx, Arc::new(TracingSink), cancel.clone());
    }

    let store = Arc::new(MemoryStore::new(snapshot));
    let state = Arc::new(FirewallState::new(FilterSettings::from_config(
        &config.firewall,
        process_uid(),
    )));
    let rules = store.snapshot().rules;
    if let Err(e) = load_tables(&state, store.as_ref(), &config.firewall, rules) {
        tracing::error!(error = %e, "initial table load failed");
        return std::ptr::null_mut();
    }

    let firewall = Firewall::new(state, store.clone(), log);
    Box::into_raw(Box::new(FirewallHandle {
        runtime,
        cancel,
        config,
        store,
        firewall,
    }))
}

/// 释放防火墙实例
///
/// # Safety
/// `handle` 必须来自 `netsentry_firewall_new` 且只释放一次
#[no_mangle]
pub unsafe extern "C" fn netsentry_firewall_free(handle: *mut FirewallHandle) {
    if handle.is_null() {
        return;
    }
    let FirewallHandle { runtime, cancel, .. } = *Box::from_raw(handle);
    cancel.cancel();
    runtime.shutdown_background();
}

/// 释放 Rust 分配的字符串
///
/// # Safety
/// `ptr` 必须来自本库返回的字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// 获取版本号
#[no_mangle]
pub extern "C" fn netsentry_version() -> *mut c_char {
    to_c_string(env!("CARGO_PKG_VERSION"))
}

// ═══════════════════════════════════════════════════════════════════════════
// 状态推送
// ═══════════════════════════════════════════════════════════════════════════

/// 用新的快照替换规则、转发、黑名单与访问记录，并重建过滤表
///
/// # Safety
/// `handle` 为有效句柄，`snapshot` 为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_reload(handle: *mut FirewallHandle, snapshot: *const c_char) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        let Some(snap) = from_c_str(snapshot).and_then(|s| StoreSnapshot::parse(s).ok()) else {
            return -3;
        };
        let rules = snap.rules.clone();
        h.store.replace(snap);
        if !h.store.is_enabled() {
            tracing::debug!("reload while disabled");
            return 0;
        }
        match load_tables(h.firewall.state(), h.store.as_ref(), &h.config.firewall, rules) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "reload failed");
                -4
            }
        }
    })
}

/// 查询防火墙是否启用；原生循环带原因退出后为 0
///
/// # Safety
/// `handle` 为有效句柄
#[no_mangle]
pub unsafe extern "C" fn netsentry_is_enabled(handle: *mut FirewallHandle) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| h.firewall.is_enabled() as i32)
}

/// 启用或停用防火墙；启用时按当前快照重建过滤表
///
/// # Safety
/// `handle` 为有效句柄
#[no_mangle]
pub unsafe extern "C" fn netsentry_set_enabled(handle: *mut FirewallHandle, enabled: bool) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        if !enabled {
            h.firewall.disable();
            return 0;
        }
        h.store.set_enabled(true);
        let rules = h.store.snapshot().rules;
        match load_tables(h.firewall.state(), h.store.as_ref(), &h.config.firewall, rules) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!(error = %e, "enable failed");
                -4
            }
        }
    })
}

/// 更新网络状态
///
/// # Safety
/// `handle` 为有效句柄
#[no_mangle]
pub unsafe extern "C" fn netsentry_set_network(
    handle: *mut FirewallHandle,
    connected: bool,
    metered: bool,
    roaming: bool,
    interactive: bool,
    lockdown: bool,
) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        h.firewall.set_network_state(NetworkState {
            connected,
            metered,
            roaming,
            interactive,
            lockdown,
        });
        0
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// 回调
// ═══════════════════════════════════════════════════════════════════════════

/// 判定一个数据包
///
/// 返回 JSON `{"raddr":..,"rport":..}` 表示放行（重定向时两者非空），
/// 返回空指针表示阻止或参数错误。
///
/// # Safety
/// `handle` 为有效句柄，`packet_json` 为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_is_address_allowed(
    handle: *mut FirewallHandle,
    packet_json: *const c_char,
) -> *mut c_char {
    let Some(h) = handle.as_ref() else {
        return std::ptr::null_mut();
    };
    let Some(mut packet) = from_c_str(packet_json).and_then(|s| serde_json::from_str::<Packet>(s).ok())
    else {
        return std::ptr::null_mut();
    };
    match h.firewall.is_address_allowed(&mut packet) {
        Some(allowed) => match serde_json::to_string(&allowed) {
            Ok(json) => to_c_string(&json),
            Err(_) => std::ptr::null_mut(),
        },
        None => std::ptr::null_mut(),
    }
}

/// 域名是否在黑名单中：1 = 是, 0 = 否
///
/// # Safety
/// `handle` 为有效句柄，`name` 为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_is_domain_blocked(handle: *mut FirewallHandle, name: *const c_char) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        match from_c_str(name) {
            Some(name) => i32::from(h.firewall.is_domain_blocked(name)),
            None => -3,
        }
    })
}

/// 查询 socket 所属 uid；未知时返回 -1
///
/// # Safety
/// `handle` 为有效句柄，地址为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_get_uid(
    handle: *mut FirewallHandle,
    version: i32,
    protocol: i32,
    saddr: *const c_char,
    sport: i32,
    daddr: *const c_char,
    dport: i32,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return -1;
    };
    let (Some(src), Some(dst)) = (parse_ip(saddr, version), parse_ip(daddr, version)) else {
        return -1;
    };
    let (Ok(protocol), Ok(sport), Ok(dport)) =
        (u8::try_from(protocol), u16::try_from(sport), u16::try_from(dport))
    else {
        return -1;
    };
    h.firewall
        .get_uid(protocol, SocketAddr::new(src, sport), SocketAddr::new(dst, dport))
        .and_then(|uid| i32::try_from(uid).ok())
        .unwrap_or(-1)
}

unsafe fn parse_ip(ptr: *const c_char, version: i32) -> Option<IpAddr> {
    let ip: IpAddr = from_c_str(ptr)?.parse().ok()?;
    match (version, ip) {
        (4, IpAddr::V4(_)) | (6, IpAddr::V6(_)) => Some(ip),
        _ => None,
    }
}

/// 上报一条 DNS 解析结果；返回更新的过滤条目数
///
/// # Safety
/// `handle` 为有效句柄，字符串参数为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_dns_resolved(
    handle: *mut FirewallHandle,
    qname: *const c_char,
    aname: *const c_char,
    resource: *const c_char,
    ttl_ms: i64,
    time: i64,
) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        let (Some(qname), Some(aname), Some(resource)) =
            (from_c_str(qname), from_c_str(aname), from_c_str(resource).and_then(|r| r.parse().ok()))
        else {
            return -3;
        };
        let record = DnsRecord {
            time,
            qname: qname.to_string(),
            aname: aname.to_string(),
            resource,
            ttl_ms,
        };
        match h.firewall.dns_resolved(record) {
            Ok(applied) => i32::try_from(applied).unwrap_or(i32::MAX),
            Err(e) => {
                tracing::warn!(error = %e, "dns update failed");
                -4
            }
        }
    })
}

/// 上报一个数据包（不做判定）
///
/// # Safety
/// `handle` 为有效句柄，`packet_json` 为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_log_packet(handle: *mut FirewallHandle, packet_json: *const c_char) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        match from_c_str(packet_json).and_then(|s| serde_json::from_str::<Packet>(s).ok()) {
            Some(packet) => {
                h.firewall.log_packet(packet);
                0
            }
            None => -3,
        }
    })
}

/// 上报流量统计
///
/// # Safety
/// `handle` 为有效句柄，`daddr` 为合法 C 字符串
#[no_mangle]
pub unsafe extern "C" fn netsentry_account_usage(
    handle: *mut FirewallHandle,
    time: i64,
    version: i32,
    protocol: i32,
    daddr: *const c_char,
    dport: i32,
    uid: i32,
    sent: i64,
    received: i64,
) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        let Some(addr) = parse_ip(daddr, version) else {
            return -3;
        };
        let (Ok(version), Ok(protocol), Ok(dport), Ok(uid)) = (
            u8::try_from(version),
            u8::try_from(protocol),
            u16::try_from(dport),
            u32::try_from(uid),
        ) else {
            return -3;
        };
        h.firewall.account_usage(Usage {
            time,
            version,
            protocol,
            daddr: addr,
            dport,
            uid,
            sent: u64::try_from(sent).unwrap_or(0),
            received: u64::try_from(received).unwrap_or(0),
        });
        0
    })
}

/// 原生侧错误
///
/// # Safety
/// `handle` 为有效句柄，`message` 为合法 C 字符串或空
#[no_mangle]
pub unsafe extern "C" fn netsentry_native_error(
    handle: *mut FirewallHandle,
    code: i32,
    message: *const c_char,
) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        h.firewall.native_error(code, from_c_str(message).unwrap_or(""));
        0
    })
}

/// 原生循环退出；`reason` 为空表示正常退出，否则停用防火墙并清空过滤表
///
/// # Safety
/// `handle` 为有效句柄，`reason` 为合法 C 字符串或空
#[no_mangle]
pub unsafe extern "C" fn netsentry_native_exit(handle: *mut FirewallHandle, reason: *const c_char) -> i32 {
    with_handle!(handle, |h: &FirewallHandle| {
        h.firewall.native_exit(from_c_str(reason));
        0
    })
}
