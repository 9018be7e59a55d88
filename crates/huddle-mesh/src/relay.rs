//! Rate-limited log relay from a participant to the coordinator.
//!
//! A fixed window limiter: the window opens on the first send and admits
//! `max_per_window` records; anything past that, or anything that could not
//! be delivered for lack of a coordinator link, goes to an overflow queue. A periodic drain resubmits the queue
//! through the same limiter, so resubmitted records can be buffered again.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use huddle_config::RelayConfig;
use huddle_core::{LogRecord, Severity};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where relayed records go.
#[async_trait]
pub trait LogSender: Send + Sync {
    async fn deliver(&self, record: LogRecord) -> huddle_core::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub max_per_window: u32,
    pub window: Duration,
    pub drain_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RelaySettings {
    fn from(cfg: &RelayConfig) -> Self {
        Self {
            max_per_window: cfg.max_per_window,
            window: Duration::from_millis(cfg.window_millis),
            drain_interval: Duration::from_secs(cfg.drain_secs),
        }
    }
}

/// What happened to a submitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Buffered,
    /// Delivery failed for a reason retrying cannot fix.
    Dropped,
}

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    count: u32,
}

pub struct LogRelay {
    sender: Arc<dyn LogSender>,
    settings: RelaySettings,
    window: Mutex<Window>,
    overflow: Mutex<VecDeque<LogRecord>>,
}

impl LogRelay {
    pub fn new(sender: Arc<dyn LogSender>, settings: RelaySettings) -> Self {
        Self {
            sender,
            settings,
            window: Mutex::new(Window::default()),
            overflow: Mutex::new(VecDeque::new()),
        }
    }

    /// Build a record stamped now and submit it.
    pub async fn send(
        &self,
        id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> SendOutcome {
        self.submit(LogRecord::now(id, severity, message)).await
    }

    /// Submit an existing record through the limiter.
    pub async fn submit(&self, record: LogRecord) -> SendOutcome {
        if !self.admit() {
            self.overflow.lock().push_back(record);
            return SendOutcome::Buffered;
        }
        let id = record.id.clone();
        match self.sender.deliver(record.clone()).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) if e.is_link_failure() => {
                debug!(id = %id, error = %e, "log delivery failed, buffering");
                self.overflow.lock().push_back(record);
                SendOutcome::Buffered
            }
            Err(e) => {
                warn!(id = %id, error = %e, "log record dropped");
                SendOutcome::Dropped
            }
        }
    }

    /// Take a slot in the current window, opening a new window if the old
    /// one has expired.
    fn admit(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        let expired = match window.started {
            Some(start) => now.duration_since(start) >= self.settings.window,
            None => true,
        };
        if expired {
            window.started = Some(now);
            window.count = 0;
        }
        if window.count >= self.settings.max_per_window {
            return false;
        }
        window.count += 1;
        true
    }

    /// Resubmit everything currently buffered. Returns how many records were
    /// delivered this time.
    pub async fn drain(&self) -> usize {
        let pending: Vec<LogRecord> = self.overflow.lock().drain(..).collect();
        if pending.is_empty() {
            return 0;
        }
        let total = pending.len();
        let mut sent = 0;
        for record in pending {
            if self.submit(record).await == SendOutcome::Sent {
                sent += 1;
            }
        }
        debug!(total, sent, "drained log overflow");
        sent
    }

    pub fn buffered(&self) -> usize {
        self.overflow.lock().len()
    }

    /// Drain on every `drain_interval` until cancelled.
    pub async fn run_drain(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.settings.drain_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.drain().await;
                }
            }
        }
        let left = self.buffered();
        if left > 0 {
            info!(left, "log relay stopped with records still buffered");
        }
    }
}
