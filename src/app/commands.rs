//! Strictly ordered command execution for the session controller.
//!
//! Commands are queued from any thread and run one at a time on the blocking
//! pool, so no two structural changes of the interface ever interleave.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::session::{Command, SessionController};
use crate::common::recover;

#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl CommandQueue {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(
        controller: Arc<Mutex<SessionController>>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();

        let worker = tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                };

                let name = cmd.name();
                let ctl = controller.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || recover(ctl.lock()).handle(cmd)).await {
                    error!(command = name, error = %e, "command panicked");
                }
                let left = counter.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
                debug!(command = name, queue = left, "command done");
            }
            debug!("command worker stopped");
        });

        (Self { tx, pending }, worker)
    }

    /// Queues `cmd`; `false` once the worker is gone.
    pub fn submit(&self, cmd: Command) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(cmd) {
            Ok(()) => true,
            Err(mpsc::error::SendError(cmd)) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                warn!(command = cmd.name(), "command queue closed");
                false
            }
        }
    }

    /// Commands queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Submits `make()` every `period` until cancelled, e.g. watchdog or householding.
pub fn spawn_periodic<F>(
    queue: CommandQueue,
    period: Duration,
    cancel: CancellationToken,
    make: F,
) -> JoinHandle<()>
where
    F: Fn() -> Command + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // 第一次 tick 立即返回，跳过
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !queue.submit(make()) {
                        break;
                    }
                }
            }
        }
    })
}
