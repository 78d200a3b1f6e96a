//! Fire-and-forget path for packet logs and usage accounting.
//!
//! The packet path only ever calls [`LogQueue::push`], which never waits:
//! when the bounded queue is full the event is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::filter::dns::DnsRecord;
use crate::packet::{Packet, Usage};

/// Network class at the time a packet was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    None,
    Wifi,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Packet {
        packet: Packet,
        connection: Connection,
        interactive: bool,
        /// Tell the user about this access.
        notify: bool,
    },
    Usage(Usage),
    Dns(DnsRecord),
}

/// Consumer of log events, e.g. the access history database.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, event: LogEvent) -> anyhow::Result<()>;
}

/// Writes events to the tracing log.
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn record(&self, event: LogEvent) -> anyhow::Result<()> {
        match &event {
            LogEvent::Packet { packet, notify, .. } => info!(notify = *notify, "packet {}", packet),
            LogEvent::Usage(u) => info!(
                uid = u.uid,
                daddr = %u.daddr,
                dport = u.dport,
                sent = u.sent,
                received = u.received,
                "usage"
            ),
            LogEvent::Dns(rr) => info!(qname = %rr.qname, resource = %rr.resource, ttl_ms = rr.ttl_ms, "dns"),
        }
        Ok(())
    }
}

/// Producer side; cheap to clone.
#[derive(Clone)]
pub struct LogQueue {
    tx: mpsc::Sender<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl LogQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<LogEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let queue = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, rx)
    }

    /// Enqueues without waiting. Returns `false` if the event was dropped.
    pub fn push(&self, event: LogEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // 只在 1, 2, 4, 8 ... 次时记录，避免刷屏
                if dropped.is_power_of_two() {
                    warn!(dropped, "log queue full");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains `rx` into `sink` until cancelled or every producer is gone.
pub fn spawn_log_worker(
    mut rx: mpsc::Receiver<LogEvent>,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("log worker cancelled");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if let Err(e) = sink.record(event).await {
                        warn!(error = %e, "log sink failed");
                    }
                }
            }
        }
    })
}
