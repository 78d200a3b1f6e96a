//! Session state machine: start, reload, handover and stop of the virtual
//! interface and the native packet engine.
//!
//! Every method here may block (platform calls, settle sleeps) and is only
//! ever run from the command queue, one command at a time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::platform::{
    EngineOptions, NetworkClass, NetworkMonitor, Notifier, PacketEngine, RuleStore, TunnelHandle,
    TunnelPlatform,
};
use super::{load_tables, FirewallState};
use crate::common::error::{FirewallError, Result};
use crate::common::{now_millis, recover};
use crate::config::Config;
use crate::filter::{NetworkState, Rule};
use crate::route::{TunnelConfig, TunnelConfigBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Enabled but without an interface, e.g. permission missing or temporarily stopped.
    Waiting,
    Enforcing,
    /// Not enforcing, still reporting traffic statistics.
    StatsOnly,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Waiting => "waiting",
            SessionState::Enforcing => "enforcing",
            SessionState::StatsOnly => "stats_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Reload { reason: String, interactive: bool },
    Stop { temporary: bool },
    Watchdog,
    Stats,
    /// Change one block flag, for `uid` and every uid related to it.
    Set { uid: u32, class: NetworkClass, blocked: bool },
    /// Drop expired DNS-derived entries.
    Householding,
    NativeExit { reason: Option<String> },
    NativeError { code: i32, message: String },
}

impl Command {
    pub fn reload(reason: impl Into<String>) -> Self {
        Command::Reload {
            reason: reason.into(),
            interactive: false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Reload { .. } => "reload",
            Command::Stop { .. } => "stop",
            Command::Watchdog => "watchdog",
            Command::Stats => "stats",
            Command::Set { .. } => "set",
            Command::Householding => "householding",
            Command::NativeExit { .. } => "native_exit",
            Command::NativeError { .. } => "native_error",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Reload { reason, interactive } => {
                write!(f, "reload reason={} interactive={}", reason, interactive)
            }
            Command::Stop { temporary } => write!(f, "stop temporary={}", temporary),
            other => f.write_str(other.name()),
        }
    }
}

/// Host capabilities the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub tunnel: Arc<dyn TunnelPlatform>,
    pub engine: Arc<dyn PacketEngine>,
    pub store: Arc<dyn RuleStore>,
    pub network: Arc<dyn NetworkMonitor>,
    pub notifier: Arc<dyn Notifier>,
}

/// Rules and derived interface shape for one start or reload.
struct Prepared {
    rules: Vec<Rule>,
    allowed: usize,
    config: TunnelConfig,
}

pub struct SessionController {
    config: Config,
    shared: Arc<FirewallState>,
    host: Collaborators,
    state: SessionState,
    tunnel: Option<TunnelHandle>,
    last_config: Option<TunnelConfig>,
    temporarily_stopped: bool,
}

impl SessionController {
    pub fn new(config: Config, shared: Arc<FirewallState>, host: Collaborators) -> Self {
        Self {
            config,
            shared,
            host,
            state: SessionState::Idle,
            tunnel: None,
            last_config: None,
            temporarily_stopped: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tunnel(&self) -> Option<TunnelHandle> {
        self.tunnel
    }

    pub fn active_config(&self) -> Option<&TunnelConfig> {
        self.last_config.as_ref()
    }

    pub fn is_temporarily_stopped(&self) -> bool {
        self.temporarily_stopped
    }

    /// Runs one command. Failures are reported to the user or deferred,
    /// never propagated to the queue.
    pub fn handle(&mut self, cmd: Command) {
        info!(command = %cmd, state = self.state.as_str(), "executing");
        match self.execute(cmd) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.fail(e),
            Err(e) => {
                // 暂时性错误：保留当前接口与状态，等待下一次事件
                warn!(error = %e, kind = e.kind().as_str(), "command failed, keeping session");
            }
        }
        debug!(state = self.state.as_str(), tunnel = self.tunnel.is_some(), "executed");
    }

    pub fn execute(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Start => self.start(),
            Command::Reload { reason, interactive } => self.reload(&reason, interactive),
            Command::Stop { temporary } => {
                self.stop(temporary);
                Ok(())
            }
            Command::Watchdog => self.watchdog(),
            Command::Stats => {
                self.stats();
                Ok(())
            }
            Command::Set { uid, class, blocked } => self.set(uid, class, blocked),
            Command::Householding => {
                self.householding();
                Ok(())
            }
            Command::NativeExit { reason } => {
                self.native_exit(reason);
                Ok(())
            }
            Command::NativeError { code, message } => {
                warn!(code, message = %message, "native error");
                self.host.notifier.error(&message);
                Ok(())
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.tunnel.is_some() {
            debug!("already started");
            return Ok(());
        }
        self.temporarily_stopped = false;

        let prepared = self.prepare()?;
        let handle = self.establish(&prepared.config)?;
        self.tunnel = Some(handle);
        self.last_config = Some(prepared.config.clone());

        self.start_native(handle, prepared.rules)?;
        self.enforcing(prepared.allowed);
        Ok(())
    }

    fn reload(&mut self, reason: &str, interactive: bool) -> Result<()> {
        if self.temporarily_stopped {
            info!(reason, "reload ignored while temporarily stopped");
            return Ok(());
        }
        if !self.host.store.is_enabled() {
            debug!(reason, "reload while disabled");
            self.stop(false);
            return Ok(());
        }

        if interactive {
            if !self.config.session.screen_on {
                debug!(reason, "screen state ignored");
                return Ok(());
            }
            let rules = self.host.store.load_rules().map_err(FirewallError::Other)?;
            if !rules.iter().any(Rule::depends_on_screen) {
                debug!(reason, "no rule depends on screen state, skipped");
                return Ok(());
            }
        }

        let Some(prev) = self.tunnel else {
            return self.start();
        };

        let prepared = self.prepare()?;
        if self.config.firewall.filter && self.last_config.as_ref() == Some(&prepared.config) {
            info!(reason, "tunnel unchanged, restarting engine");
            self.host.engine.stop(&prev, self.config.session.clear_on_reload);
            self.start_native(prev, prepared.rules)?;
            self.enforcing(prepared.allowed);
            return Ok(());
        }

        let handle = if self.host.tunnel.supports_handover() {
            self.handover(prev, &prepared.config)?
        } else {
            info!(reason, "tunnel changed, restarting");
            self.shutdown_tunnel(prev, true);
            sleep_ms(self.config.tunnel.legacy_settle_ms);
            self.establish(&prepared.config)?
        };

        self.tunnel = Some(handle);
        self.last_config = Some(prepared.config);
        self.start_native(handle, prepared.rules)?;
        self.enforcing(prepared.allowed);
        Ok(())
    }

    /// New interface first, old one after; falls back to teardown-then-establish.
    fn handover(&mut self, prev: TunnelHandle, config: &TunnelConfig) -> Result<TunnelHandle> {
        info!("handover");
        match self.host.tunnel.establish(config) {
            Ok(next) => {
                self.shutdown_tunnel(prev, true);
                Ok(next)
            }
            Err(e) => {
                warn!(error = %e, "handover failed, retrying after teardown");
                self.shutdown_tunnel(prev, true);
                sleep_ms(self.config.tunnel.handover_settle_ms);
                self.host
                    .tunnel
                    .establish(config)
                    .map_err(|e| FirewallError::EstablishFailed(e.to_string()))
            }
        }
    }

    fn stop(&mut self, temporary: bool) {
        if let Some(handle) = self.tunnel.take() {
            self.shutdown_tunnel(handle, true);
        }
        self.last_config = None;
        recover(self.shared.tables.write()).clear();

        if temporary {
            self.temporarily_stopped = true;
            if self.state == SessionState::Enforcing {
                self.state = SessionState::Waiting;
            }
            return;
        }

        self.temporarily_stopped = false;
        if matches!(self.state, SessionState::Enforcing | SessionState::Waiting) {
            if self.config.session.show_stats {
                self.state = SessionState::Waiting;
                self.host.notifier.waiting();
            } else {
                self.state = SessionState::Idle;
                self.host.notifier.stopped();
            }
        }
    }

    fn watchdog(&mut self) -> Result<()> {
        if self.temporarily_stopped || !self.host.store.is_enabled() {
            return Ok(());
        }
        let Some(handle) = self.tunnel else {
            error!("tunnel absent while enabled, restarting");
            return self.start();
        };
        if self.engine_needed() && !self.host.engine.is_running() {
            error!(tunnel = handle.id, "packet engine not running, restarting");
            let rules = self.host.store.load_rules().map_err(FirewallError::Other)?;
            self.start_native(handle, rules)?;
        }
        Ok(())
    }

    fn stats(&mut self) {
        match self.state {
            SessionState::Idle if self.config.session.show_stats => {
                self.state = SessionState::StatsOnly;
            }
            SessionState::StatsOnly if !self.config.session.show_stats => {
                self.state = SessionState::Idle;
            }
            _ => {}
        }
        let tables = recover(self.shared.tables.read());
        debug!(
            rules = tables.rules.len(),
            dns = tables.dns.len(),
            forwards = tables.forwards.len(),
            state = self.state.as_str(),
            "stats"
        );
    }

    fn set(&mut self, uid: u32, class: NetworkClass, blocked: bool) -> Result<()> {
        let related = recover(self.shared.tables.read()).rules.related_uids(uid);
        for other in related {
            self.host
                .store
                .set_blocked(other, class, blocked)
                .map_err(FirewallError::Other)?;
        }
        self.reload("set", false)
    }

    fn householding(&mut self) {
        let purged = recover(self.shared.tables.write()).dns.purge_expired(now_millis());
        info!(purged, "householding");
    }

    fn native_exit(&mut self, reason: Option<String>) {
        let Some(reason) = reason else {
            info!("native engine exited");
            return;
        };
        warn!(reason = %reason, "native engine exit");
        self.host.notifier.error(&reason);
        self.host.store.set_enabled(false);
        self.stop(false);
    }

    /// Loads rules, refreshes the network state and builds the interface shape.
    fn prepare(&self) -> Result<Prepared> {
        let snapshot = self.host.network.snapshot();
        let env = self.host.network.environment();
        let state: NetworkState = snapshot.effective_state(&self.config.network, &self.config.firewall);
        *recover(self.shared.network.write()) = state;

        let rules = self.host.store.load_rules().map_err(FirewallError::Other)?;
        let allowed: Vec<&Rule> = if state.connected {
            rules.iter().filter(|r| r.is_allowed(&state)).collect()
        } else {
            Vec::new()
        };
        info!(
            connected = state.connected,
            metered = state.metered,
            roaming = state.roaming,
            interactive = state.interactive,
            lockdown = state.lockdown,
            allowed = allowed.len(),
            total = rules.len(),
            "allowed rules"
        );

        let config = TunnelConfigBuilder::new(&self.config.tunnel, &self.config.firewall, &env).build(
            &allowed,
            &rules,
            &state,
            snapshot.network_type,
        );
        let allowed = allowed.len();
        Ok(Prepared {
            rules,
            allowed,
            config,
        })
    }

    fn establish(&self, config: &TunnelConfig) -> Result<TunnelHandle> {
        self.host
            .tunnel
            .establish(config)
            .map_err(|e| FirewallError::EstablishFailed(e.to_string()))
    }

    /// Refills the filter tables, then starts the engine if anything needs it.
    fn start_native(&self, handle: TunnelHandle, rules: Vec<Rule>) -> Result<()> {
        let fw = &self.config.firewall;
        load_tables(&self.shared, self.host.store.as_ref(), fw, rules).map_err(FirewallError::Other)?;

        if self.engine_needed() {
            let options = EngineOptions {
                log: fw.log || fw.log_app,
                filter: fw.filter,
                mtu: self.config.tunnel.mtu,
            };
            self.host
                .engine
                .start(&handle, &options)
                .map_err(|e| FirewallError::Native {
                    code: -1,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn engine_needed(&self) -> bool {
        let fw = &self.config.firewall;
        fw.log || fw.log_app || fw.filter
    }

    fn shutdown_tunnel(&mut self, handle: TunnelHandle, clear: bool) {
        self.host.engine.stop(&handle, clear);
        self.host.tunnel.teardown(handle);
        if self.tunnel == Some(handle) {
            self.tunnel = None;
        }
    }

    fn enforcing(&mut self, allowed: usize) {
        self.state = SessionState::Enforcing;
        let total = recover(self.shared.tables.read()).rules.len();
        self.host.notifier.enforcing(allowed, total);
    }

    fn fail(&mut self, err: FirewallError) {
        if self.host.tunnel.has_permission() {
            error!(error = %err, kind = err.kind().as_str(), "session failed, disabling");
            self.host.notifier.error(&err.to_string());
            self.host.store.set_enabled(false);
            self.stop(false);
            self.state = SessionState::Idle;
        } else {
            // 权限被撤销：静默等待下一次网络或权限事件
            info!(error = %err, "permission revoked, waiting");
            if let Some(handle) = self.tunnel.take() {
                self.shutdown_tunnel(handle, true);
            }
            self.last_config = None;
            self.state = SessionState::Waiting;
        }
    }
}

fn sleep_ms(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
