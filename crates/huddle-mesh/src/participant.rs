//! A mesh participant.
//!
//! Each participant runs two transport identities under one name. The
//! listener accepts links from peers that were told to dial it; the dialer
//! holds the link to the coordinator and the links this participant was told
//! to open. Both feed the same merged `data` and `status` stores, whose
//! writes are pushed to every linked peer. Peers can also call each other's
//! registered request handlers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use huddle_config::{HuddleConfig, LogCatalogEntry};
use huddle_core::{
    COORDINATOR_NAME, ConnectionDirective, CredentialTable, DEFAULT_SEGMENT, HuddleError,
    LogRecord, ParticipantProfile, Severity,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::generate_access_key;
use crate::protocol::{Command, Frame, StoreScope};
use crate::relay::{LogRelay, LogSender, RelaySettings, SendOutcome};
use crate::request::{PendingRequests, Reply, RequestHandler};
use crate::store::MergedStore;
use crate::supervise::supervise;
use crate::transport::{LinkEvent, Transport};

#[derive(Debug, Clone)]
pub struct ParticipantSettings {
    pub name: String,
    pub coordinator_address: String,
    pub coordinator_port: u16,
    pub coordinator_key: String,
    /// Address the listener binds and the address same-segment peers dial.
    pub local_address: String,
    /// Empty when not publicly reachable.
    pub public_address: String,
    /// 0 picks an ephemeral port.
    pub listen_port: u16,
    pub segment: String,
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
    pub access_key_len: usize,
    pub reconnect_interval: Duration,
    pub share_flush_interval: Duration,
    pub status_flush_interval: Duration,
    pub relay: RelaySettings,
    /// Records relayed by [`Participant::log_id`].
    pub log_catalog: BTreeMap<String, LogCatalogEntry>,
}

impl ParticipantSettings {
    pub fn new(
        name: impl Into<String>,
        coordinator_address: impl Into<String>,
        coordinator_port: u16,
        coordinator_key: impl Into<String>,
        local_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            coordinator_address: coordinator_address.into(),
            coordinator_port,
            coordinator_key: coordinator_key.into(),
            local_address: local_address.into(),
            public_address: String::new(),
            listen_port: 0,
            segment: DEFAULT_SEGMENT.to_string(),
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
            access_key_len: 16,
            reconnect_interval: Duration::from_secs(5),
            share_flush_interval: Duration::from_secs(60),
            status_flush_interval: Duration::from_secs(30),
            relay: RelaySettings::default(),
            log_catalog: BTreeMap::new(),
        }
    }

    pub fn from_config(cfg: &HuddleConfig) -> Self {
        let p = &cfg.participant;
        Self {
            name: p.name.clone(),
            coordinator_address: p.coordinator_address.clone(),
            coordinator_port: p.coordinator_port,
            coordinator_key: p.coordinator_key.clone(),
            local_address: p.local_address.clone(),
            public_address: p.public_address.clone(),
            listen_port: p.listen_port,
            segment: p.segment.clone(),
            whitelist: p.whitelist.iter().cloned().collect(),
            blacklist: p.blacklist.iter().cloned().collect(),
            access_key_len: p.access_key_len,
            reconnect_interval: Duration::from_secs(p.reconnect_secs),
            share_flush_interval: Duration::from_secs(p.share_flush_secs),
            status_flush_interval: Duration::from_secs(p.status_flush_secs),
            relay: RelaySettings::from(&cfg.relay),
            log_catalog: cfg.log_catalog.clone(),
        }
    }
}

/// A transport together with its event stream.
pub struct Identity {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<LinkEvent>,
}

impl Identity {
    pub fn new<T: Transport + 'static>(transport: T, events: mpsc::Receiver<LinkEvent>) -> Self {
        Self {
            transport: Arc::new(transport),
            events,
        }
    }
}

impl<T: Transport + 'static> From<(T, mpsc::Receiver<LinkEvent>)> for Identity {
    fn from((transport, events): (T, mpsc::Receiver<LinkEvent>)) -> Self {
        Self::new(transport, events)
    }
}

/// An application payload received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Via {
    Listener,
    Dialer,
}

/// Log delivery over the dialer's coordinator link.
struct CoordinatorLink {
    dialer: Arc<dyn Transport>,
}

#[async_trait]
impl LogSender for CoordinatorLink {
    async fn deliver(&self, record: LogRecord) -> huddle_core::Result<()> {
        self.dialer
            .send(COORDINATOR_NAME, &Frame::from(Command::LogRecord(record)))
            .await
    }
}

type Replica = BTreeMap<String, Value>;

/// Message relayed for a log id missing from the catalog.
const UNKNOWN_LOG_ID: &str = "unknown log id";

pub struct Participant {
    settings: ParticipantSettings,
    access_key: String,
    listen_port: u16,
    listener: Arc<dyn Transport>,
    dialer: Arc<dyn Transport>,
    data: MergedStore,
    status: MergedStore,
    /// Last known contents of each peer's stores.
    replicas: RwLock<HashMap<(String, StoreScope), Replica>>,
    credential_table: RwLock<CredentialTable>,
    relay: Arc<LogRelay>,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    pending: PendingRequests,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    /// Targets with a dial in flight.
    dialing: Mutex<HashSet<String>>,
    reconnecting: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Directive dials and request handlers in flight.
    background: Mutex<JoinSet<()>>,
}

impl Participant {
    /// Bring up the listener, then dial the coordinator.
    ///
    /// A coordinator that cannot be reached yet is not an error: the
    /// reconnect loop keeps trying every `reconnect_interval`.
    pub async fn start(
        settings: ParticipantSettings,
        listener: Identity,
        dialer: Identity,
    ) -> huddle_core::Result<Arc<Self>> {
        if settings.name == COORDINATOR_NAME {
            return Err(HuddleError::InvalidProfile {
                name: settings.name,
                reason: "name is reserved for the coordinator".into(),
            });
        }
        if settings.name.is_empty() {
            return Err(HuddleError::InvalidProfile {
                name: settings.name,
                reason: "name is empty".into(),
            });
        }
        for identity in [&listener, &dialer] {
            if identity.transport.local_name() != settings.name {
                warn!(
                    expected = %settings.name,
                    actual = %identity.transport.local_name(),
                    "transport name differs from participant name"
                );
            }
        }

        let access_key = generate_access_key(settings.access_key_len);
        let listen_port = listener
            .transport
            .listen(&settings.local_address, settings.listen_port, &access_key)
            .await?;

        let relay = Arc::new(LogRelay::new(
            Arc::new(CoordinatorLink {
                dialer: Arc::clone(&dialer.transport),
            }),
            settings.relay,
        ));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let this = Arc::new(Self {
            settings,
            access_key,
            listen_port,
            listener: listener.transport,
            dialer: dialer.transport,
            data: MergedStore::new(StoreScope::Data),
            status: MergedStore::new(StoreScope::Status),
            replicas: RwLock::new(HashMap::new()),
            credential_table: RwLock::new(CredentialTable::new()),
            relay,
            handlers: RwLock::new(HashMap::new()),
            pending: PendingRequests::default(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            dialing: Mutex::new(HashSet::new()),
            reconnecting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            background: Mutex::new(JoinSet::new()),
        });
        info!(name = %this.name(), port = listen_port, "participant listening");

        this.spawn_receive("listener-receive", Via::Listener, listener.events);
        this.spawn_receive("dialer-receive", Via::Dialer, dialer.events);

        let relay = Arc::clone(&this.relay);
        let cancel = this.cancel.clone();
        let drain = supervise("relay-drain", this.cancel.clone(), move || {
            Arc::clone(&relay).run_drain(cancel.clone())
        });

        let flusher = Arc::clone(&this);
        let flush = supervise("share-flush", this.cancel.clone(), move || {
            let this = Arc::clone(&flusher);
            async move { this.flush_loop().await }
        });
        this.tasks.lock().extend([drain, flush]);

        if let Err(e) = this.connect_coordinator().await {
            warn!(error = %e, "coordinator not reachable yet");
            this.spawn_reconnect();
        }
        Ok(this)
    }

    fn spawn_receive(self: &Arc<Self>, task: &'static str, via: Via, events: mpsc::Receiver<LinkEvent>) {
        let events = Arc::new(tokio::sync::Mutex::new(events));
        let this = Arc::clone(self);
        let handle = supervise(task, self.cancel.clone(), move || {
            let this = Arc::clone(&this);
            let events = Arc::clone(&events);
            async move {
                let mut events = events.lock().await;
                while let Some(event) = events.recv().await {
                    this.handle_event(via, event).await;
                }
                debug!(task, "event stream ended");
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn connect_coordinator(&self) -> huddle_core::Result<()> {
        self.dialer
            .connect(
                COORDINATOR_NAME,
                &self.settings.coordinator_address,
                self.settings.coordinator_port,
                &self.settings.coordinator_key,
            )
            .await
    }

    /// Retry the coordinator link until it comes back. At most one loop runs.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = supervise("coordinator-reconnect", self.cancel.clone(), move || {
            let this = Arc::clone(&this);
            async move { this.reconnect_loop().await }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn reconnect_loop(&self) {
        let mut attempts = 0u32;
        loop {
            tokio::time::sleep(self.settings.reconnect_interval).await;
            if self.dialer.is_connected(COORDINATOR_NAME) {
                break;
            }
            attempts += 1;
            match self.connect_coordinator().await {
                Ok(()) => {
                    info!(attempts, "reconnected to coordinator");
                    break;
                }
                Err(e) => debug!(attempts, error = %e, "coordinator still unreachable"),
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Run a short-lived task that `shutdown` aborts if it is still going.
    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut background = self.background.lock();
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The profile announced to the coordinator.
    pub fn profile(&self) -> ParticipantProfile {
        let mut profile = ParticipantProfile::new(
            self.settings.name.clone(),
            self.settings.local_address.clone(),
            self.listen_port,
            self.access_key.clone(),
        )
        .with_public_address(self.settings.public_address.clone())
        .with_segment(self.settings.segment.clone());
        profile.whitelist = self.settings.whitelist.clone();
        profile.blacklist = self.settings.blacklist.clone();
        profile
    }

    pub fn data(&self) -> &MergedStore {
        &self.data
    }

    pub fn status(&self) -> &MergedStore {
        &self.status
    }

    pub fn store(&self, scope: StoreScope) -> &MergedStore {
        match scope {
            StoreScope::Data => &self.data,
            StoreScope::Status => &self.status,
        }
    }

    pub fn is_coordinator_connected(&self) -> bool {
        self.dialer.is_connected(COORDINATOR_NAME)
    }

    /// Whether either identity has a live link to `peer`.
    pub fn is_linked(&self, peer: &str) -> bool {
        self.listener.is_connected(peer) || self.dialer.is_connected(peer)
    }

    /// Linked peers across both identities, sorted, coordinator excluded.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: BTreeSet<String> = self.listener.connected_peers().into_iter().collect();
        peers.extend(self.dialer.connected_peers());
        peers.remove(COORDINATOR_NAME);
        peers.into_iter().collect()
    }

    pub fn credential_table(&self) -> CredentialTable {
        self.credential_table.read().clone()
    }

    /// The identity holding a live link to `peer`, listener first.
    fn route(&self, peer: &str) -> Option<&Arc<dyn Transport>> {
        if self.listener.is_connected(peer) {
            Some(&self.listener)
        } else if self.dialer.is_connected(peer) {
            Some(&self.dialer)
        } else {
            None
        }
    }

    fn identity(&self, via: Via) -> &Arc<dyn Transport> {
        match via {
            Via::Listener => &self.listener,
            Via::Dialer => &self.dialer,
        }
    }

    // ── Coordinator conversation ───────────────────────────────

    /// Announce presence and ask for the credential table.
    pub async fn on_coordinator_connected(&self) -> huddle_core::Result<()> {
        let announce = Frame::from(Command::PresenceAnnounce(self.profile()));
        self.dialer.send(COORDINATOR_NAME, &announce).await?;
        self.dialer
            .send(COORDINATOR_NAME, &Frame::from(Command::CredentialTableRequest))
            .await?;
        info!(name = %self.name(), "presence announced");
        Ok(())
    }

    /// Dial the directive's target unless a link to it already exists or a
    /// dial is already under way. Returns whether a new link was opened.
    pub async fn on_directive(&self, directive: &ConnectionDirective) -> huddle_core::Result<bool> {
        let target = directive.target_name.as_str();
        if target == self.name() {
            warn!("ignoring directive to dial ourselves");
            return Ok(false);
        }
        if self.is_linked(target) {
            debug!(target, "already linked, ignoring directive");
            return Ok(false);
        }
        if !self.dialing.lock().insert(target.to_string()) {
            debug!(target, "dial already in flight");
            return Ok(false);
        }

        let result = self
            .dialer
            .connect(
                target,
                &directive.target_address,
                directive.target_port,
                &directive.target_access_key,
            )
            .await;
        self.dialing.lock().remove(target);

        match result {
            Ok(()) => {
                info!(target, address = %directive.target_address, "linked by directive");
                Ok(true)
            }
            Err(e) => {
                warn!(target, error = %e, "directive dial failed");
                Err(e)
            }
        }
    }

    // ── Events ─────────────────────────────────────────────────

    async fn handle_event(self: &Arc<Self>, via: Via, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer } => {
                if via == Via::Dialer && peer == COORDINATOR_NAME {
                    if let Err(e) = self.on_coordinator_connected().await {
                        warn!(error = %e, "presence announcement failed");
                    }
                } else {
                    debug!(peer = %peer, ?via, "peer linked");
                    self.flush_to(via, &peer).await;
                }
            }
            LinkEvent::Disconnected { peer } => {
                if via == Via::Dialer && peer == COORDINATOR_NAME {
                    warn!("lost coordinator link");
                    self.spawn_reconnect();
                } else if !self.is_linked(&peer) {
                    debug!(peer = %peer, "peer unlinked");
                    self.replicas.write().retain(|(owner, _), _| owner != &peer);
                }
            }
            LinkEvent::Message { from, frame } => self.handle_frame(via, from, frame).await,
        }
    }

    async fn handle_frame(self: &Arc<Self>, via: Via, from: String, frame: Frame) {
        let command = match frame {
            Frame::Data(payload) => {
                let _ = self.inbound_tx.send(Inbound { from, payload });
                return;
            }
            Frame::Command(command) => command,
        };

        let from_coordinator = via == Via::Dialer && from == COORDINATOR_NAME;
        match command {
            Command::ConnectDirective(directive) if from_coordinator => {
                let this = Arc::clone(self);
                self.spawn_background(async move {
                    let _ = this.on_directive(&directive).await;
                });
            }
            Command::CredentialTableResponse { table } if from_coordinator => {
                debug!(entries = table.len(), "credential table received");
                self.listener.set_credential_table(table.clone());
                *self.credential_table.write() = table;
            }
            Command::ShareUpdate { scope, key, value } => {
                self.replicas
                    .write()
                    .entry((from, scope))
                    .or_default()
                    .insert(key, value);
            }
            Command::ShareDelete { scope, key } => {
                if let Some(replica) = self.replicas.write().get_mut(&(from, scope)) {
                    replica.remove(&key);
                }
            }
            Command::ShareFlush { scope, entries } => {
                self.replicas.write().insert((from, scope), entries);
            }
            Command::Request { id, name, data } => self.answer(via, from, id, name, data),
            Command::Response {
                id,
                handled,
                result,
            } => {
                if !self.pending.complete(&from, id, Reply { handled, result }) {
                    debug!(from = %from, id, "response to no outstanding request");
                }
            }
            other => {
                warn!(from = %from, cmd = other.tag(), "unexpected command, dropping");
            }
        }
    }

    // ── Application surface ────────────────────────────────────

    /// Send an application payload to a linked peer.
    pub async fn send(&self, peer: &str, payload: Value) -> huddle_core::Result<()> {
        let transport = self
            .route(peer)
            .ok_or_else(|| HuddleError::PeerUnreachable(peer.to_string()))?;
        transport.send(peer, &Frame::Data(payload)).await
    }

    /// Next application payload from any peer.
    pub async fn recv(&self) -> Option<Inbound> {
        self.inbound_rx.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<Inbound> {
        self.inbound_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn read(&self, scope: StoreScope, key: &str) -> huddle_core::Result<Value> {
        self.store(scope).read(key)
    }

    /// Write locally and push the change to every linked peer.
    pub async fn write(&self, scope: StoreScope, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.store(scope).write(key.clone(), value.clone());
        self.broadcast(&Frame::from(Command::ShareUpdate { scope, key, value }))
            .await;
    }

    /// Delete locally and push the deletion to every linked peer.
    pub async fn delete(&self, scope: StoreScope, key: &str) -> bool {
        let existed = self.store(scope).delete(key);
        self.broadcast(&Frame::from(Command::ShareDelete {
            scope,
            key: key.to_string(),
        }))
        .await;
        existed
    }

    /// A value from `peer`'s store as last replicated to us.
    pub fn peer_value(&self, peer: &str, scope: StoreScope, key: &str) -> Option<Value> {
        self.replicas
            .read()
            .get(&(peer.to_string(), scope))
            .and_then(|replica| replica.get(key).cloned())
    }

    pub fn peer_snapshot(&self, peer: &str, scope: StoreScope) -> Replica {
        self.replicas
            .read()
            .get(&(peer.to_string(), scope))
            .cloned()
            .unwrap_or_default()
    }

    /// Relay a log record to the coordinator, subject to the rate limit.
    pub async fn log(
        &self,
        id: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> SendOutcome {
        self.relay.send(id, severity, message).await
    }

    /// Relay the catalog record registered under `id`. An unknown id is
    /// relayed as an error record so the coordinator still sees it.
    pub async fn log_id(&self, id: &str) -> SendOutcome {
        match self.settings.log_catalog.get(id) {
            Some(entry) => {
                self.relay
                    .send(id, entry.severity, entry.message.clone())
                    .await
            }
            None => {
                warn!(id, "log id not in catalog");
                self.relay.send(id, Severity::Error, UNKNOWN_LOG_ID).await
            }
        }
    }

    // ── Requests ───────────────────────────────────────────────

    /// Answer requests named `name` with `handler`, replacing any earlier one.
    pub fn register_handler<H>(&self, name: impl Into<String>, handler: H)
    where
        H: RequestHandler + 'static,
    {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Call `peer`'s handler for `name` and wait up to `timeout` for its
    /// answer.
    pub async fn request(
        &self,
        peer: &str,
        name: &str,
        data: Value,
        timeout: Duration,
    ) -> huddle_core::Result<Value> {
        let transport = self
            .route(peer)
            .ok_or_else(|| HuddleError::PeerUnreachable(peer.to_string()))?;
        let (id, reply) = self.pending.open(peer);
        let frame = Frame::from(Command::Request {
            id,
            name: name.to_string(),
            data,
        });
        if let Err(e) = transport.send(peer, &frame).await {
            self.pending.cancel(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Reply { handled: true, result })) => Ok(result),
            Ok(Ok(Reply { handled: false, .. })) => Err(HuddleError::NoHandler {
                peer: peer.to_string(),
                name: name.to_string(),
            }),
            Ok(Err(_)) => Err(HuddleError::LinkNotEstablished(peer.to_string())),
            Err(_) => {
                self.pending.cancel(id);
                Err(HuddleError::RequestTimeout {
                    peer: peer.to_string(),
                    name: name.to_string(),
                })
            }
        }
    }

    /// Run the handler for an inbound request and send its answer back over
    /// the identity the request came in on.
    fn answer(&self, via: Via, from: String, id: u64, name: String, data: Value) {
        let handler = self.handlers.read().get(&name).cloned();
        let transport = Arc::clone(self.identity(via));
        self.spawn_background(async move {
            let reply = match handler {
                Some(handler) => Command::Response {
                    id,
                    handled: true,
                    result: handler.handle(&from, data).await,
                },
                None => {
                    debug!(from = %from, name = %name, "no handler for request");
                    Command::Response {
                        id,
                        handled: false,
                        result: Value::Null,
                    }
                }
            };
            if let Err(e) = transport.send(&from, &Frame::from(reply)).await {
                warn!(to = %from, name = %name, error = %e, "response not delivered");
            }
        });
    }

    pub fn relay(&self) -> &LogRelay {
        &self.relay
    }

    // ── Replication ────────────────────────────────────────────

    async fn broadcast(&self, frame: &Frame) {
        for peer in self.peers() {
            let Some(transport) = self.route(&peer) else {
                continue;
            };
            if let Err(e) = transport.send(&peer, frame).await {
                warn!(peer = %peer, error = %e, "replication send failed");
            }
        }
    }

    fn flush_frame(&self, scope: StoreScope) -> Frame {
        Frame::from(Command::ShareFlush {
            scope,
            entries: self.store(scope).entries(),
        })
    }

    /// Send full store contents to a newly linked peer.
    async fn flush_to(&self, via: Via, peer: &str) {
        let transport = self.identity(via);
        for scope in [StoreScope::Data, StoreScope::Status] {
            if let Err(e) = transport.send(peer, &self.flush_frame(scope)).await {
                warn!(peer = %peer, scope = %scope, error = %e, "initial flush failed");
            }
        }
    }

    async fn flush_loop(&self) {
        let start = tokio::time::Instant::now();
        let data_every = self.settings.share_flush_interval;
        let status_every = self.settings.status_flush_interval;
        let mut data_tick = tokio::time::interval_at(start + data_every, data_every);
        let mut status_tick = tokio::time::interval_at(start + status_every, status_every);
        loop {
            let scope = tokio::select! {
                _ = data_tick.tick() => StoreScope::Data,
                _ = status_tick.tick() => StoreScope::Status,
            };
            self.broadcast(&self.flush_frame(scope)).await;
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Stop every loop and close all links, the coordinator's included.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let mut background = std::mem::take(&mut *self.background.lock());
        background.shutdown().await;
        self.pending.clear();
        for peer in self.listener.connected_peers() {
            self.listener.disconnect(&peer).await;
        }
        for peer in self.dialer.connected_peers() {
            self.dialer.disconnect(&peer).await;
        }
        info!(name = %self.name(), "participant stopped");
    }
}
