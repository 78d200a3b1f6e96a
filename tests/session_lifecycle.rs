//! 会话状态机：启动、重载、切换、停止与命令队列

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsentry::app::platform::{
    EngineOptions, NetworkClass, NetworkEnvironment, NetworkMonitor, NetworkSnapshot, NetworkType,
    Notifier, PacketEngine, RuleStore, TunnelHandle, TunnelPlatform,
};
use netsentry::app::{
    Collaborators, Command, CommandQueue, FirewallService, FirewallState, MemoryStore,
    SessionController, SessionState, StoreSnapshot, TracingSink,
};
use netsentry::common::now_millis;
use netsentry::config::Config;
use netsentry::filter::dns::{AccessEntry, DnsRecord};
use netsentry::filter::{FilterSettings, Forward, IpKey, Rule};
use netsentry::route::TunnelConfig;
use tokio_util::sync::CancellationToken;

type Events = Arc<Mutex<Vec<String>>>;

fn push(events: &Events, e: String) {
    events.lock().unwrap().push(e);
}

// ============================================================
// 测试替身
// ============================================================

struct MockTunnel {
    events: Events,
    next_id: AtomicU64,
    failures: AtomicU32,
    permission: AtomicBool,
    handover: AtomicBool,
    configs: Mutex<Vec<TunnelConfig>>,
}

impl TunnelPlatform for MockTunnel {
    fn establish(&self, config: &TunnelConfig) -> anyhow::Result<TunnelHandle> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            push(&self.events, "establish failed".into());
            anyhow::bail!("interface busy");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.configs.lock().unwrap().push(config.clone());
        push(&self.events, format!("establish {}", id));
        Ok(TunnelHandle { id, fd: id as i32 })
    }

    fn teardown(&self, handle: TunnelHandle) {
        push(&self.events, format!("teardown {}", handle.id));
    }

    fn has_permission(&self) -> bool {
        self.permission.load(Ordering::SeqCst)
    }

    fn supports_handover(&self) -> bool {
        self.handover.load(Ordering::SeqCst)
    }
}

struct MockEngine {
    events: Events,
    running: AtomicBool,
}

impl PacketEngine for MockEngine {
    fn start(&self, tunnel: &TunnelHandle, _options: &EngineOptions) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        push(&self.events, format!("start {}", tunnel.id));
        Ok(())
    }

    fn stop(&self, tunnel: &TunnelHandle, clear: bool) {
        self.running.store(false, Ordering::SeqCst);
        push(&self.events, format!("stop {} clear={}", tunnel.id, clear));
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct MockNetwork {
    snapshot: Mutex<NetworkSnapshot>,
}

impl NetworkMonitor for MockNetwork {
    fn snapshot(&self) -> NetworkSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    fn environment(&self) -> NetworkEnvironment {
        NetworkEnvironment {
            system_dns: vec!["192.168.1.1".parse().unwrap()],
            own_package: "netsentry".into(),
            ..NetworkEnvironment::default()
        }
    }
}

#[derive(Default)]
struct MockNotifier {
    events: Mutex<Vec<String>>,
}

impl Notifier for MockNotifier {
    fn enforcing(&self, allowed: usize, total: usize) {
        self.events.lock().unwrap().push(format!("enforcing {}/{}", allowed, total));
    }

    fn waiting(&self) {
        self.events.lock().unwrap().push("waiting".into());
    }

    fn error(&self, message: &str) {
        self.events.lock().unwrap().push(format!("error {}", message));
    }

    fn stopped(&self) {
        self.events.lock().unwrap().push("stopped".into());
    }
}

/// 前 `failures` 次读取规则失败，其余委托给内存存储
struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures: AtomicU32,
}

impl RuleStore for FlakyStore {
    fn load_rules(&self) -> anyhow::Result<Vec<Rule>> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("database locked");
        }
        self.inner.load_rules()
    }

    fn load_forwards(&self) -> anyhow::Result<Vec<Forward>> {
        self.inner.load_forwards()
    }

    fn load_blocked_hosts(&self) -> anyhow::Result<HashSet<String>> {
        self.inner.load_blocked_hosts()
    }

    fn load_access(&self, qname: Option<&str>) -> anyhow::Result<Vec<AccessEntry>> {
        self.inner.load_access(qname)
    }

    fn insert_dns(&self, record: &DnsRecord) -> anyhow::Result<bool> {
        self.inner.insert_dns(record)
    }

    fn set_blocked(&self, uid: u32, class: NetworkClass, blocked: bool) -> anyhow::Result<()> {
        self.inner.set_blocked(uid, class, blocked)
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(enabled)
    }
}

struct Harness {
    events: Events,
    tunnel: Arc<MockTunnel>,
    network: Arc<MockNetwork>,
    store: Arc<MemoryStore>,
    notifier: Arc<MockNotifier>,
    shared: Arc<FirewallState>,
    host: Collaborators,
}

impl Harness {
    fn new(rules: Vec<Rule>) -> Self {
        let events: Events = Arc::default();
        let tunnel = Arc::new(MockTunnel {
            events: events.clone(),
            next_id: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            permission: AtomicBool::new(true),
            handover: AtomicBool::new(true),
            configs: Mutex::default(),
        });
        let engine = Arc::new(MockEngine {
            events: events.clone(),
            running: AtomicBool::new(false),
        });
        let network = Arc::new(MockNetwork {
            snapshot: Mutex::new(NetworkSnapshot {
                network_type: NetworkType::WiFi,
                connected: true,
                ssid: Some("home".into()),
                ..NetworkSnapshot::default()
            }),
        });
        let store = Arc::new(MemoryStore::new(StoreSnapshot {
            rules,
            ..StoreSnapshot::default()
        }));
        let notifier = Arc::new(MockNotifier::default());
        let shared = Arc::new(FirewallState::new(FilterSettings::default()));
        let host = Collaborators {
            tunnel: tunnel.clone(),
            engine,
            store: store.clone(),
            network: network.clone(),
            notifier: notifier.clone(),
        };
        Self {
            events,
            tunnel,
            network,
            store,
            notifier,
            shared,
            host,
        }
    }

    fn controller(&self, config: Config) -> SessionController {
        SessionController::new(config, self.shared.clone(), self.host.clone())
    }

    fn take_events(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn notifications(&self) -> Vec<String> {
        self.notifier.events.lock().unwrap().clone()
    }

    fn set_apply(&self, uid: u32, apply: bool) {
        let mut snap = self.store.snapshot();
        for rule in snap.rules.iter_mut().filter(|r| r.uid == uid) {
            rule.apply = apply;
        }
        self.store.replace(snap);
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.firewall.filter = true;
    config.tunnel.handover_settle_ms = 0;
    config.tunnel.legacy_settle_ms = 0;
    config
}

fn rules() -> Vec<Rule> {
    vec![
        Rule::new(10050, "com.example.browser"),
        Rule {
            wifi_blocked: true,
            related: vec![10052],
            ..Rule::new(10051, "com.example.mail")
        },
        Rule::new(10052, "com.example.mail.sync"),
    ]
}

// ============================================================
// 启动与重载
// ============================================================

#[test]
fn start_establishes_and_enforces() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    assert_eq!(ctl.state(), SessionState::Enforcing);
    assert_eq!(h.take_events(), vec!["establish 1", "start 1"]);
    assert_eq!(h.notifications(), vec!["enforcing 2/3"]);
    assert_eq!(h.shared.tables.read().unwrap().rules.len(), 3);

    let active = ctl.active_config().unwrap();
    assert_eq!(active.network_type, NetworkType::WiFi);
    assert_eq!(active.disallowed, vec!["netsentry".to_string()]);

    // 已启动时再次 start 无操作
    ctl.handle(Command::Start);
    assert!(h.take_events().is_empty());
}

#[test]
fn unchanged_reload_restarts_engine_only() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    ctl.handle(Command::reload("test"));
    assert_eq!(h.take_events(), vec!["stop 1 clear=false", "start 1"]);
    assert_eq!(ctl.tunnel().map(|t| t.id), Some(1));
}

#[test]
fn changed_reload_hands_over() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    h.set_apply(10050, false);
    ctl.handle(Command::reload("rules changed"));
    assert_eq!(
        h.take_events(),
        vec!["establish 2", "stop 1 clear=true", "teardown 1", "start 2"]
    );
    assert_eq!(ctl.state(), SessionState::Enforcing);
    assert!(ctl
        .active_config()
        .unwrap()
        .disallowed
        .contains(&"com.example.browser".to_string()));
}

#[test]
fn failed_handover_falls_back_to_teardown() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    h.set_apply(10050, false);
    h.tunnel.failures.store(1, Ordering::SeqCst);
    ctl.handle(Command::reload("rules changed"));
    assert_eq!(
        h.take_events(),
        vec![
            "establish failed",
            "stop 1 clear=true",
            "teardown 1",
            "establish 2",
            "start 2"
        ]
    );
    assert_eq!(ctl.state(), SessionState::Enforcing);
}

#[test]
fn failed_fallback_disables_feature() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    h.set_apply(10050, false);
    h.tunnel.failures.store(2, Ordering::SeqCst);
    ctl.handle(Command::reload("rules changed"));

    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(ctl.tunnel().is_none());
    assert!(!h.store.is_enabled());
    assert!(h
        .notifications()
        .iter()
        .any(|n| n.starts_with("error establish failed")));
}

#[test]
fn unfiltered_reload_reestablishes() {
    let h = Harness::new(rules());
    let mut plain = config();
    plain.firewall.filter = false;
    let mut ctl = h.controller(plain);
    ctl.handle(Command::Start);
    assert_eq!(h.take_events(), vec!["establish 1"]);

    ctl.handle(Command::reload("connectivity"));
    assert_eq!(
        h.take_events(),
        vec!["establish 2", "stop 1 clear=true", "teardown 1"]
    );
    assert_eq!(ctl.tunnel().map(|t| t.id), Some(2));
}

#[test]
fn legacy_reload_tears_down_first() {
    let h = Harness::new(rules());
    h.tunnel.handover.store(false, Ordering::SeqCst);
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    h.set_apply(10050, false);
    ctl.handle(Command::reload("rules changed"));
    assert_eq!(
        h.take_events(),
        vec!["stop 1 clear=true", "teardown 1", "establish 2", "start 2"]
    );
}

#[test]
fn interactive_reload_skipped_without_screen_rules() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    ctl.handle(Command::Reload {
        reason: "screen on".into(),
        interactive: true,
    });
    assert!(h.take_events().is_empty());

    let mut snap = h.store.snapshot();
    snap.rules[1].screen_wifi = true;
    h.store.replace(snap);
    ctl.handle(Command::Reload {
        reason: "screen on".into(),
        interactive: true,
    });
    assert!(!h.take_events().is_empty());
}

#[test]
fn interactive_reload_ignored_when_screen_state_off() {
    let mut rules = rules();
    rules[1].screen_wifi = true;
    let h = Harness::new(rules);
    let mut cfg = config();
    cfg.session.screen_on = false;
    let mut ctl = h.controller(cfg);
    ctl.handle(Command::Start);
    h.take_events();

    ctl.handle(Command::Reload {
        reason: "screen off".into(),
        interactive: true,
    });
    assert!(h.take_events().is_empty());
    assert_eq!(ctl.state(), SessionState::Enforcing);
}

// ============================================================
// 失败与停止
// ============================================================

#[test]
fn establish_failure_with_permission_is_surfaced() {
    let h = Harness::new(rules());
    h.tunnel.failures.store(1, Ordering::SeqCst);
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!h.store.is_enabled());
    assert_eq!(h.notifications(), vec!["error establish failed: interface busy"]);
}

#[test]
fn establish_failure_without_permission_waits_silently() {
    let h = Harness::new(rules());
    h.tunnel.failures.store(1, Ordering::SeqCst);
    h.tunnel.permission.store(false, Ordering::SeqCst);
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    assert_eq!(ctl.state(), SessionState::Waiting);
    assert!(h.store.is_enabled());
    assert!(h.notifications().is_empty());

    // 下一次连接事件重试
    h.tunnel.permission.store(true, Ordering::SeqCst);
    ctl.handle(Command::reload("connectivity"));
    assert_eq!(ctl.state(), SessionState::Enforcing);
}

#[test]
fn store_error_keeps_session() {
    let h = Harness::new(rules());
    let store = Arc::new(FlakyStore {
        inner: h.store.clone(),
        failures: AtomicU32::new(0),
    });
    let host = Collaborators {
        store: store.clone(),
        ..h.host.clone()
    };
    let mut ctl = SessionController::new(config(), h.shared.clone(), host);
    ctl.handle(Command::Start);
    h.take_events();

    store.failures.store(1, Ordering::SeqCst);
    ctl.handle(Command::reload("connectivity"));
    assert_eq!(ctl.state(), SessionState::Enforcing);
    assert_eq!(ctl.tunnel().map(|t| t.id), Some(1));
    assert!(h.store.is_enabled());
    assert!(h.take_events().is_empty());
    assert_eq!(h.notifications(), vec!["enforcing 2/3"]);

    // 下一次事件正常重载
    ctl.handle(Command::reload("connectivity"));
    assert_eq!(h.take_events(), vec!["stop 1 clear=false", "start 1"]);
}

#[test]
fn stop_drops_to_idle_or_waiting() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    h.take_events();

    ctl.handle(Command::Stop { temporary: false });
    assert_eq!(ctl.state(), SessionState::Idle);
    assert_eq!(h.take_events(), vec!["stop 1 clear=true", "teardown 1"]);
    assert!(h.shared.tables.read().unwrap().rules.is_empty());
    assert_eq!(h.notifications().last().map(String::as_str), Some("stopped"));

    let mut stats = config();
    stats.session.show_stats = true;
    let mut ctl = h.controller(stats);
    ctl.handle(Command::Start);
    ctl.handle(Command::Stop { temporary: false });
    assert_eq!(ctl.state(), SessionState::Waiting);
    assert_eq!(h.notifications().last().map(String::as_str), Some("waiting"));

    // 无权限等待中的会话同样回到 Idle
    let h = Harness::new(rules());
    h.tunnel.failures.store(1, Ordering::SeqCst);
    h.tunnel.permission.store(false, Ordering::SeqCst);
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    assert_eq!(ctl.state(), SessionState::Waiting);
    ctl.handle(Command::Stop { temporary: false });
    assert_eq!(ctl.state(), SessionState::Idle);

    // 临时停止之后的完整停止
    ctl.handle(Command::Start);
    ctl.handle(Command::Stop { temporary: true });
    assert_eq!(ctl.state(), SessionState::Waiting);
    ctl.handle(Command::Stop { temporary: false });
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!ctl.is_temporarily_stopped());
}

#[test]
fn temporary_stop_suspends_reloads() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);
    ctl.handle(Command::Stop { temporary: true });
    assert!(ctl.is_temporarily_stopped());
    h.take_events();

    ctl.handle(Command::reload("connectivity"));
    ctl.handle(Command::Watchdog);
    assert!(h.take_events().is_empty());
    assert!(ctl.tunnel().is_none());

    ctl.handle(Command::Start);
    assert!(!ctl.is_temporarily_stopped());
    assert_eq!(ctl.state(), SessionState::Enforcing);
}

#[test]
fn watchdog_restarts_missing_tunnel() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Watchdog);
    assert_eq!(ctl.state(), SessionState::Enforcing);

    h.take_events();
    ctl.handle(Command::Watchdog);
    assert!(h.take_events().is_empty());

    // 包处理引擎意外退出
    let handle = ctl.tunnel().unwrap();
    h.host.engine.stop(&handle, false);
    h.take_events();
    ctl.handle(Command::Watchdog);
    assert_eq!(h.take_events(), vec!["start 1"]);
}

#[test]
fn native_exit_with_reason_disables() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    ctl.handle(Command::NativeExit { reason: None });
    assert_eq!(ctl.state(), SessionState::Enforcing);

    ctl.handle(Command::NativeError {
        code: 3,
        message: "select".into(),
    });
    assert_eq!(ctl.state(), SessionState::Enforcing);

    ctl.handle(Command::NativeExit {
        reason: Some("tun read failed".into()),
    });
    assert_eq!(ctl.state(), SessionState::Idle);
    assert!(!h.store.is_enabled());
    assert!(h.notifications().contains(&"error tun read failed".to_string()));
}

// ============================================================
// 规则维护
// ============================================================

#[test]
fn set_propagates_to_related_uids() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    ctl.handle(Command::Set {
        uid: 10051,
        class: NetworkClass::Wifi,
        blocked: false,
    });
    let rules = h.store.load_rules().unwrap();
    assert!(rules.iter().filter(|r| r.uid != 10050).all(|r| !r.wifi_blocked));

    ctl.handle(Command::Set {
        uid: 10051,
        class: NetworkClass::Other,
        blocked: true,
    });
    let rules = h.store.load_rules().unwrap();
    assert!(rules.iter().filter(|r| r.uid != 10050).all(|r| r.other_blocked));
    assert!(!rules[0].other_blocked);
}

#[test]
fn householding_purges_expired_dns_entries() {
    let h = Harness::new(rules());
    let mut ctl = h.controller(config());
    ctl.handle(Command::Start);

    let now = now_millis();
    {
        let mut tables = h.shared.tables.write().unwrap();
        let key = IpKey::new(4, 6, 443, 10050);
        tables
            .dns
            .upsert(key, "1.1.1.1".parse().unwrap(), "one.one", false, now - 1, now - 10);
        tables
            .dns
            .upsert(key, "8.8.8.8".parse().unwrap(), "dns.google", false, now + 60_000, now);
    }
    ctl.handle(Command::Householding);
    assert_eq!(h.shared.tables.read().unwrap().dns.len(), 1);
}

#[test]
fn stats_only_when_idle() {
    let h = Harness::new(rules());
    let mut stats = config();
    stats.session.show_stats = true;
    let mut ctl = h.controller(stats);
    ctl.handle(Command::Stats);
    assert_eq!(ctl.state(), SessionState::StatsOnly);

    ctl.handle(Command::Start);
    assert_eq!(ctl.state(), SessionState::Enforcing);
}

// ============================================================
// 命令队列
// ============================================================

#[tokio::test]
async fn queue_runs_commands_in_order() {
    let h = Harness::new(rules());
    let ctl = Arc::new(Mutex::new(h.controller(config())));
    let cancel = CancellationToken::new();
    let (queue, worker) = CommandQueue::spawn(ctl.clone(), cancel.clone());

    assert!(queue.submit(Command::Start));
    assert!(queue.submit(Command::reload("test")));
    assert!(queue.submit(Command::Stop { temporary: false }));
    while queue.pending() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        h.take_events(),
        vec![
            "establish 1",
            "start 1",
            "stop 1 clear=false",
            "start 1",
            "stop 1 clear=true",
            "teardown 1"
        ]
    );
    assert_eq!(ctl.lock().unwrap().state(), SessionState::Idle);

    cancel.cancel();
    worker.await.unwrap();
    assert!(!queue.submit(Command::Watchdog));
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn service_forwards_native_exit() {
    let h = Harness::new(rules());
    let service = FirewallService::spawn(config(), h.host.clone(), Arc::new(TracingSink));
    service.submit(Command::Start);
    service.drain().await;
    assert_eq!(service.session_state(), SessionState::Enforcing);

    service.firewall().native_exit(Some("tun closed"));
    service.drain().await;
    assert_eq!(service.session_state(), SessionState::Idle);
    assert!(!h.store.is_enabled());

    service.shutdown().await;
    assert!(h.network.snapshot().connected);
}
