//! Callback surface for the native packet engine, and the service that ties
//! the session controller, command queue and logging path together.

pub mod commands;
pub mod ffi;
pub mod log_queue;
pub mod platform;
pub mod session;
pub mod store;
pub mod uid;

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{now_millis, recover};
use crate::config::{Config, FirewallConfig};
use crate::filter::dns::DnsRecord;
use crate::filter::{
    decide, FilterSettings, FilterTables, HostsBlocklist, NetworkState, Reason, Rule, Verdict,
};
use crate::packet::{proto, Packet, Usage};

pub use commands::CommandQueue;
pub use log_queue::{Connection, LogEvent, LogQueue, LogSink, TracingSink};
pub use platform::RuleStore;
pub use session::{Collaborators, Command, SessionController, SessionState};
pub use store::{MemoryStore, StoreSnapshot};
pub use uid::UidResolver;

/// State shared between the packet path and the command queue.
#[derive(Debug, Default)]
pub struct FirewallState {
    pub tables: RwLock<FilterTables>,
    pub network: RwLock<NetworkState>,
}

impl FirewallState {
    pub fn new(settings: FilterSettings) -> Self {
        Self {
            tables: RwLock::new(FilterTables::new(settings)),
            network: RwLock::new(NetworkState::default()),
        }
    }
}

/// Answer to `is_address_allowed`; both fields set on redirect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Allowed {
    pub raddr: Option<IpAddr>,
    pub rport: Option<u16>,
}

/// Inbound callbacks of the native packet engine.
pub struct Firewall {
    state: Arc<FirewallState>,
    store: Arc<dyn RuleStore>,
    log: LogQueue,
    uids: UidResolver,
    commands: Option<CommandQueue>,
}

impl Firewall {
    pub fn new(state: Arc<FirewallState>, store: Arc<dyn RuleStore>, log: LogQueue) -> Self {
        Self {
            state,
            store,
            log,
            uids: UidResolver::default(),
            commands: None,
        }
    }

    pub fn with_uid_resolver(mut self, uids: UidResolver) -> Self {
        self.uids = uids;
        self
    }

    /// Native exit/error callbacks are forwarded to this queue.
    pub fn with_commands(mut self, commands: CommandQueue) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn state(&self) -> &Arc<FirewallState> {
        &self.state
    }

    pub fn log_queue(&self) -> &LogQueue {
        &self.log
    }

    pub fn set_network_state(&self, network: NetworkState) {
        *recover(self.state.network.write()) = network;
    }

    /// Decides `packet`, marks it, and reports it to the log path.
    ///
    /// `None` means blocked.
    pub fn is_address_allowed(&self, packet: &mut Packet) -> Option<Allowed> {
        let network = *recover(self.state.network.read());

        let (decision, report, notify) = {
            let tables = recover(self.state.tables.read());
            let decision = decide(&tables, packet, &network);
            let settings = &tables.settings;
            let flagless_tcp = packet.protocol == proto::TCP && packet.flags.is_empty();
            let report =
                (settings.log || settings.log_app) && !flagless_tcp && !settings.is_self(packet.uid);
            let notify = settings.notify_access
                && packet
                    .uid
                    .and_then(|uid| tables.rules.lookup(uid))
                    .map(|r| r.notify && (settings.manage_system || !r.system))
                    .unwrap_or(false);
            (decision, report, notify)
        };

        match decision.reason {
            Reason::UnknownSystem => warn!(uid = ?packet.uid, protocol = packet.protocol, "Allowing unknown system traffic"),
            Reason::NoRule => warn!(uid = ?packet.uid, "No rules for uid"),
            _ => debug!(reason = %decision.reason, "packet {}", packet),
        }

        packet.allowed = decision.verdict.is_allowed();
        let allowed = match decision.verdict {
            Verdict::Block => None,
            Verdict::Allow => Some(Allowed::default()),
            Verdict::Redirect { addr, port } => {
                packet.data = Some(format!("> {}/{}", addr, port));
                Some(Allowed {
                    raddr: Some(addr),
                    rport: Some(port),
                })
            }
        };

        if report {
            self.log.push(LogEvent::Packet {
                packet: packet.clone(),
                connection: connection(&network),
                interactive: network.interactive,
                notify,
            });
        }
        allowed
    }

    pub fn is_domain_blocked(&self, name: &str) -> bool {
        let blocked = recover(self.state.tables.read()).hosts.is_blocked(name);
        if blocked {
            debug!(name, "domain blocked");
        }
        blocked
    }

    /// Owner of a socket; only used when the engine has no better source.
    pub fn get_uid(&self, protocol: u8, source: SocketAddr, destination: SocketAddr) -> Option<u32> {
        self.uids.lookup(protocol, source, destination)
    }

    /// Stores an answer and refreshes the filter entries for its name.
    /// Returns the number of entries inserted or extended.
    pub fn dns_resolved(&self, record: DnsRecord) -> anyhow::Result<usize> {
        let is_new = self.store.insert_dns(&record)?;
        self.log.push(LogEvent::Dns(record.clone()));
        if !recover(self.state.tables.read()).settings.enabled {
            return Ok(0);
        }

        // 重复应答也要重新应用：更长的 TTL 会延长现有条目
        let entries = self.store.load_access(Some(&record.qname))?;
        let now = now_millis();
        let mut tables = recover(self.state.tables.write());
        let applied = entries
            .iter()
            .filter_map(|e| tables.dns.apply(e, now))
            .filter(|outcome| outcome.is_change())
            .count();
        debug!(qname = %record.qname, is_new, applied, "dns filter updated");
        Ok(applied)
    }

    pub fn log_packet(&self, packet: Packet) {
        let network = *recover(self.state.network.read());
        self.log.push(LogEvent::Packet {
            packet,
            connection: connection(&network),
            interactive: network.interactive,
            notify: false,
        });
    }

    pub fn account_usage(&self, usage: Usage) {
        self.log.push(LogEvent::Usage(usage));
    }

    pub fn native_error(&self, code: i32, message: &str) {
        error!(code, message, "native error");
        self.submit(Command::NativeError {
            code,
            message: message.to_string(),
        });
    }

    pub fn native_exit(&self, reason: Option<&str>) {
        match reason {
            Some(r) => error!(reason = r, "native exit"),
            None => info!("native exit"),
        }
        let queued = self.submit(Command::NativeExit {
            reason: reason.map(str::to_string),
        });
        if !queued && reason.is_some() {
            self.disable();
        }
    }

    /// Switches filtering off without a session: the feature is disabled in
    /// the store and every table is dropped.
    pub fn disable(&self) {
        self.store.set_enabled(false);
        let mut tables = recover(self.state.tables.write());
        tables.clear();
        tables.settings.enabled = false;
        warn!("filtering disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    /// Returns whether a session took the command.
    fn submit(&self, cmd: Command) -> bool {
        match &self.commands {
            Some(q) => q.submit(cmd),
            None => {
                debug!(command = cmd.name(), "no session attached");
                false
            }
        }
    }
}

/// Reloads every filter table from `store`, or clears them when filtering is
/// off. The store is read before the write lock is taken.
pub fn load_tables(
    state: &FirewallState,
    store: &dyn RuleStore,
    fw: &FirewallConfig,
    rules: Vec<Rule>,
) -> anyhow::Result<()> {
    let self_uid = recover(state.tables.read()).settings.self_uid;
    let settings = FilterSettings::from_config(fw, self_uid);

    if !fw.filter {
        let mut tables = recover(state.tables.write());
        tables.settings = settings;
        tables.clear();
        debug!("filter disabled, tables cleared");
        return Ok(());
    }

    let hosts = if fw.use_hosts {
        HostsBlocklist::from_names(store.load_blocked_hosts()?)
    } else {
        HostsBlocklist::default()
    };
    let access = store.load_access(None)?;
    let forwards = store.load_forwards()?;
    let now = now_millis();

    let mut tables = recover(state.tables.write());
    tables.settings = settings;
    tables.rules.replace_all(rules);
    tables.hosts = hosts;
    tables.dns.replace_all(&access, now);
    tables.forwards.replace_all(forwards);
    info!(
        rules = tables.rules.len(),
        hosts = tables.hosts.len(),
        dns = tables.dns.len(),
        forwards = tables.forwards.len(),
        "filter prepared"
    );
    Ok(())
}

fn connection(network: &NetworkState) -> Connection {
    if !network.connected {
        Connection::None
    } else if network.metered {
        Connection::Other
    } else {
        Connection::Wifi
    }
}

/// uid of this process, excluded from filtering.
pub fn process_uid() -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: getuid has no preconditions and cannot fail.
        Some(unsafe { libc::getuid() })
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════

/// A running firewall: session controller behind the command queue, the log
/// worker, and the periodic watchdog/householding timers.
pub struct FirewallService {
    firewall: Arc<Firewall>,
    commands: CommandQueue,
    controller: Arc<Mutex<SessionController>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl FirewallService {
    /// Must be called inside a tokio runtime.
    pub fn spawn(config: Config, host: Collaborators, sink: Arc<dyn LogSink>) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(FirewallState::new(FilterSettings::from_config(
            &config.firewall,
            process_uid(),
        )));

        let (log, rx) = LogQueue::new(config.firewall.log_queue_depth);
        let mut tasks = vec![log_queue::spawn_log_worker(rx, sink, cancel.child_token())];

        let watchdog = config.session.watchdog_minutes;
        let householding = config.session.householding_hours;
        let store = host.store.clone();
        let controller = Arc::new(Mutex::new(SessionController::new(config, state.clone(), host)));
        let (commands, worker) = CommandQueue::spawn(controller.clone(), cancel.child_token());
        tasks.push(worker);

        if watchdog > 0 {
            tasks.push(commands::spawn_periodic(
                commands.clone(),
                Duration::from_secs(watchdog * 60),
                cancel.child_token(),
                || Command::Watchdog,
            ));
        }
        if householding > 0 {
            tasks.push(commands::spawn_periodic(
                commands.clone(),
                Duration::from_secs(householding * 3600),
                cancel.child_token(),
                || Command::Householding,
            ));
        }

        let firewall = Arc::new(Firewall::new(state, store, log).with_commands(commands.clone()));
        info!(watchdog, householding, "firewall service started");

        Self {
            firewall,
            commands,
            controller,
            cancel,
            tasks,
        }
    }

    pub fn firewall(&self) -> &Arc<Firewall> {
        &self.firewall
    }

    pub fn commands(&self) -> &CommandQueue {
        &self.commands
    }

    pub fn submit(&self, cmd: Command) -> bool {
        self.commands.submit(cmd)
    }

    pub fn session_state(&self) -> SessionState {
        recover(self.controller.lock()).state()
    }

    /// Waits until every queued command has run.
    pub async fn drain(&self) {
        while self.commands.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stops the interface, then every background task.
    pub async fn shutdown(self) {
        self.commands.submit(Command::Stop { temporary: false });
        self.drain().await;
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }
        info!("firewall service stopped");
    }
}
