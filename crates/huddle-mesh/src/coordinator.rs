//! The rendezvous coordinator.
//!
//! Participants dial the coordinator and announce their reachability. On a
//! fixed period the coordinator plans every pair in its registry and sends a
//! [`ConnectionDirective`](huddle_core::ConnectionDirective) to whichever side
//! should dial. It hands out the credential table on request and passes
//! relayed log records to its sink. Application traffic never flows through it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use huddle_config::CoordinatorConfig;
use huddle_core::{COORDINATOR_NAME, CredentialTable, HuddleError, LogRecord, ParticipantProfile, Severity};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::planner::{self, Plan};
use crate::protocol::{Command, Frame};
use crate::registry::{Registry, RegistrySnapshot};
use crate::supervise::supervise;
use crate::transport::{LinkEvent, Transport};

/// Destination for log records relayed by participants.
pub trait LogSink: Send + Sync {
    fn record(&self, from: &str, record: &LogRecord);
}

impl<F> LogSink for F
where
    F: Fn(&str, &LogRecord) + Send + Sync,
{
    fn record(&self, from: &str, record: &LogRecord) {
        self(from, record)
    }
}

/// Default sink: re-emits each record as a `tracing` event under the
/// `huddle::relay` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, from: &str, r: &LogRecord) {
        let ts = r.timestamp.to_rfc3339();
        match r.severity {
            Severity::Debug => {
                tracing::debug!(target: "huddle::relay", from, id = %r.id, ts = %ts, "{}", r.message)
            }
            Severity::Info => {
                tracing::info!(target: "huddle::relay", from, id = %r.id, ts = %ts, "{}", r.message)
            }
            Severity::Warn => {
                tracing::warn!(target: "huddle::relay", from, id = %r.id, ts = %ts, "{}", r.message)
            }
            Severity::Error => {
                tracing::error!(target: "huddle::relay", from, id = %r.id, ts = %ts, "{}", r.message)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub listen_address: String,
    pub port: u16,
    pub access_key: String,
    pub plan_interval: Duration,
    pub debounce: Duration,
    pub allowed_members: BTreeSet<String>,
    pub credentials: CredentialTable,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for CoordinatorSettings {
    fn from(cfg: &CoordinatorConfig) -> Self {
        Self {
            listen_address: cfg.listen.clone(),
            port: cfg.port,
            access_key: cfg.access_key.clone(),
            plan_interval: Duration::from_secs(cfg.plan_interval_secs),
            debounce: Duration::from_secs(cfg.debounce_secs),
            allowed_members: cfg.allowed_members.iter().cloned().collect(),
            credentials: cfg.credentials.clone().unwrap_or_default(),
        }
    }
}

/// Extra wait before a planning cycle: the debounce window when the registry
/// has not moved since the last plan, nothing otherwise.
pub fn debounce_wait(last_planned: Option<u64>, current: u64, debounce: Duration) -> Duration {
    if last_planned == Some(current) {
        debounce
    } else {
        Duration::ZERO
    }
}

pub struct Coordinator {
    settings: CoordinatorSettings,
    registry: Registry,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn LogSink>,
    last_planned: Mutex<Option<u64>>,
    cycles: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings,
            registry: Registry::new(),
            transport,
            sink: Arc::new(TracingSink),
            last_planned: Mutex::new(None),
            cycles: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the default tracing sink.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Planning cycles dispatched so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Insert or overwrite a participant's profile. Public reachability is
    /// derived from the announced public address.
    pub fn register_presence(&self, mut profile: ParticipantProfile) -> huddle_core::Result<()> {
        if profile.name == COORDINATOR_NAME {
            return Err(HuddleError::InvalidProfile {
                name: profile.name,
                reason: "name is reserved for the coordinator".into(),
            });
        }
        let is_public = !profile.public_address.is_empty();
        if profile.is_public != is_public {
            debug!(name = %profile.name, announced = profile.is_public, "correcting public flag");
            profile.is_public = is_public;
        }
        info!(
            name = %profile.name,
            segment = %profile.segment_id,
            public = profile.is_public,
            "presence registered"
        );
        self.registry.register(profile);
        Ok(())
    }

    /// Forget a participant whose link closed.
    pub fn on_disconnect(&self, name: &str) {
        if self.registry.remove(name).is_some() {
            info!(name, "participant left");
        }
    }

    /// The configured credential table; empty when none was configured.
    pub fn lookup_credential_table(&self, requester: &str) -> CredentialTable {
        debug!(requester, entries = self.settings.credentials.len(), "credential table requested");
        self.settings.credentials.clone()
    }

    pub fn ingest_log(&self, from: &str, record: &LogRecord) {
        self.sink.record(from, record);
    }

    fn plan_snapshot(&self, snapshot: RegistrySnapshot) -> Plan {
        let plan = planner::plan(&snapshot.profiles, &self.settings.allowed_members);
        *self.last_planned.lock() = Some(snapshot.version);
        plan
    }

    /// Plan the current registry without dispatching anything.
    pub fn plan(&self) -> Plan {
        self.plan_snapshot(self.registry.snapshot())
    }

    /// Plan the current registry and send each directive to its initiator.
    /// A directive that cannot be delivered is logged and reissued next cycle.
    pub async fn plan_and_dispatch(&self) -> Plan {
        let plan = self.plan();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        for directive in &plan.directives {
            let frame = Frame::from(Command::ConnectDirective(directive.clone()));
            if let Err(e) = self.transport.send(&directive.initiator, &frame).await {
                warn!(
                    initiator = %directive.initiator,
                    target = %directive.target_name,
                    error = %e,
                    "directive not delivered"
                );
            }
        }
        debug!(
            directives = plan.directives.len(),
            unreachable = plan.unreachable.len(),
            skipped = plan.skipped,
            failed = plan.failed.len(),
            "planning cycle done"
        );
        plan
    }

    /// React to one transport event.
    pub async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer } => debug!(peer = %peer, "participant linked"),
            LinkEvent::Disconnected { peer } => self.on_disconnect(&peer),
            LinkEvent::Message { from, frame } => match frame {
                Frame::Command(command) => self.handle_command(&from, command).await,
                Frame::Data(_) => debug!(from = %from, "dropping application payload"),
            },
        }
    }

    async fn handle_command(&self, from: &str, command: Command) {
        match command {
            Command::PresenceAnnounce(mut profile) => {
                if profile.name != from {
                    warn!(link = %from, announced = %profile.name, "announced name differs from link, using link name");
                    profile.name = from.to_string();
                }
                if let Err(e) = self.register_presence(profile) {
                    warn!(from = %from, error = %e, "presence rejected");
                    // Closing the link reports back on the channel this loop
                    // drains, so it must not be awaited here.
                    let transport = Arc::clone(&self.transport);
                    let peer = from.to_string();
                    tokio::spawn(async move { transport.disconnect(&peer).await });
                }
            }
            Command::CredentialTableRequest => {
                let table = self.lookup_credential_table(from);
                let frame = Frame::from(Command::CredentialTableResponse { table });
                if let Err(e) = self.transport.send(from, &frame).await {
                    warn!(to = %from, error = %e, "credential table not delivered");
                }
            }
            Command::LogRecord(record) => self.ingest_log(from, &record),
            other => warn!(from = %from, cmd = other.tag(), "unexpected command, dropping"),
        }
    }

    /// Start listening and spawn the receive and planning loops. Returns the
    /// bound port.
    pub async fn start(
        self: &Arc<Self>,
        events: mpsc::Receiver<LinkEvent>,
    ) -> huddle_core::Result<u16> {
        if !self.settings.credentials.is_empty() {
            self.transport
                .set_credential_table(self.settings.credentials.clone());
        }
        let port = self
            .transport
            .listen(
                &self.settings.listen_address,
                self.settings.port,
                &self.settings.access_key,
            )
            .await?;
        info!(address = %self.settings.listen_address, port, "coordinator listening");

        let events = Arc::new(tokio::sync::Mutex::new(events));
        let this = Arc::clone(self);
        let receive = supervise("coordinator-receive", self.cancel.clone(), move || {
            let this = Arc::clone(&this);
            let events = Arc::clone(&events);
            async move {
                let mut events = events.lock().await;
                while let Some(event) = events.recv().await {
                    this.handle_event(event).await;
                }
                error!("coordinator event stream ended");
            }
        });

        let this = Arc::clone(self);
        let planning = supervise("coordinator-plan", self.cancel.clone(), move || {
            let this = Arc::clone(&this);
            async move {
                loop {
                    tokio::time::sleep(this.settings.plan_interval).await;
                    let last = *this.last_planned.lock();
                    let extra = debounce_wait(last, this.registry.version(), this.settings.debounce);
                    if !extra.is_zero() {
                        debug!(wait = ?extra, "registry unchanged, debouncing");
                        tokio::time::sleep(extra).await;
                    }
                    this.plan_and_dispatch().await;
                }
            }
        });

        self.tasks.lock().extend([receive, planning]);
        Ok(port)
    }

    /// Stop the loops and close every participant link.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        for peer in self.transport.connected_peers() {
            self.transport.disconnect(&peer).await;
        }
        info!("coordinator stopped");
    }
}
