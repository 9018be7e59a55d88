//! In-process transport.
//!
//! A [`MemoryNetwork`] stands in for the network: listeners register under an
//! `address:port` pair and dialers reach them by that pair, with the same
//! access-key and credential checks as the TCP transport. Whole meshes of
//! coordinators and participants can run inside one test this way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_core::{CredentialTable, HuddleError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::credential::authorize;
use crate::protocol::Frame;
use crate::transport::{EVENT_CHANNEL_CAPACITY, LinkEvent, LinkTable, Transport};

/// First port handed out for `listen(_, 0, _)`.
const FIRST_EPHEMERAL_PORT: u16 = 40000;

#[derive(Clone)]
struct MemoryLink {
    remote: Weak<Inner>,
    /// Name under which the remote end knows us.
    remote_key: String,
    /// Shared by both ends of the link.
    link_id: u64,
}

struct Inner {
    name: String,
    credential: Option<String>,
    network: MemoryNetwork,
    links: LinkTable<MemoryLink>,
    access_key: RwLock<Option<String>>,
    credential_table: RwLock<CredentialTable>,
    events: mpsc::Sender<LinkEvent>,
}

#[derive(Default)]
struct NetworkState {
    listeners: DashMap<String, Weak<Inner>>,
    /// Successful dials per (dialer, target) pair.
    dials: Mutex<HashMap<(String, String), usize>>,
    next_port: AtomicU16,
    next_link: std::sync::atomic::AtomicU64,
}

/// Shared in-process "network" connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this network.
    pub fn transport(&self, name: impl Into<String>) -> (MemoryTransport, mpsc::Receiver<LinkEvent>) {
        self.transport_with_credential(name, None)
    }

    /// Create a transport that presents `credential` when dialing.
    pub fn transport_with_credential(
        &self,
        name: impl Into<String>,
        credential: Option<String>,
    ) -> (MemoryTransport, mpsc::Receiver<LinkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            name: name.into(),
            credential,
            network: self.clone(),
            links: LinkTable::new(),
            access_key: RwLock::new(None),
            credential_table: RwLock::new(CredentialTable::new()),
            events,
        };
        (
            MemoryTransport {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// How many links `dialer` has successfully opened to `target`.
    pub fn dial_count(&self, dialer: &str, target: &str) -> usize {
        self.state
            .dials
            .lock()
            .get(&(dialer.to_string(), target.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn endpoint(address: &str, port: u16) -> String {
        format!("{address}:{port}")
    }

    fn allocate_port(&self) -> u16 {
        FIRST_EPHEMERAL_PORT + self.state.next_port.fetch_add(1, Ordering::Relaxed)
    }
}

/// One identity on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Inner {
    async fn emit(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            debug!(name = %self.name, "event receiver dropped");
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_name(&self) -> &str {
        &self.inner.name
    }

    async fn listen(&self, address: &str, port: u16, access_key: &str) -> huddle_core::Result<u16> {
        let network = &self.inner.network;
        let port = if port == 0 { network.allocate_port() } else { port };
        let endpoint = MemoryNetwork::endpoint(address, port);

        if let Some(existing) = network.state.listeners.get(&endpoint)
            && existing.upgrade().is_some()
        {
            return Err(HuddleError::Transport(format!("{endpoint} already in use")));
        }

        *self.inner.access_key.write() = Some(access_key.to_string());
        network
            .state
            .listeners
            .insert(endpoint.clone(), Arc::downgrade(&self.inner));
        info!(name = %self.inner.name, endpoint = %endpoint, "listening");
        Ok(port)
    }

    async fn connect(
        &self,
        peer: &str,
        address: &str,
        port: u16,
        access_key: &str,
    ) -> huddle_core::Result<()> {
        let network = &self.inner.network;
        let endpoint = MemoryNetwork::endpoint(address, port);
        let remote = network
            .state
            .listeners
            .get(&endpoint)
            .and_then(|w| w.upgrade())
            .ok_or_else(|| HuddleError::PeerUnreachable(format!("{peer} at {endpoint}")))?;

        let verdict = {
            let expected = remote.access_key.read();
            let table = remote.credential_table.read();
            match expected.as_deref() {
                Some(expected) => authorize(
                    &self.inner.name,
                    access_key,
                    self.inner.credential.as_deref(),
                    expected,
                    &table,
                ),
                None => Err("not listening".to_string()),
            }
        };
        if let Err(reason) = verdict {
            return Err(HuddleError::AuthRejected {
                peer: peer.to_string(),
                reason,
            });
        }

        let link_id = network.state.next_link.fetch_add(1, Ordering::Relaxed);
        let local_key = self.inner.name.clone();

        let replaced_here = self.inner.links.insert(
            peer,
            link_id,
            MemoryLink {
                remote: Arc::downgrade(&remote),
                remote_key: local_key.clone(),
                link_id,
            },
        );
        let replaced_there = remote.links.insert(
            &local_key,
            link_id,
            MemoryLink {
                remote: Arc::downgrade(&self.inner),
                remote_key: peer.to_string(),
                link_id,
            },
        );
        if replaced_here.is_some() || replaced_there.is_some() {
            info!(peer = %peer, "replacing existing link");
        }

        *network
            .state
            .dials
            .lock()
            .entry((local_key.clone(), peer.to_string()))
            .or_insert(0) += 1;

        info!(peer = %peer, endpoint = %endpoint, "outbound link established");
        self.inner
            .emit(LinkEvent::Connected {
                peer: peer.to_string(),
            })
            .await;
        remote.emit(LinkEvent::Connected { peer: local_key }).await;
        Ok(())
    }

    async fn send(&self, peer: &str, frame: &Frame) -> huddle_core::Result<()> {
        let link = self
            .inner
            .links
            .get(peer)
            .ok_or_else(|| HuddleError::LinkNotEstablished(peer.to_string()))?;
        let remote = link
            .remote
            .upgrade()
            .ok_or_else(|| HuddleError::LinkNotEstablished(peer.to_string()))?;
        // Round-trip through the codec so both transports see identical frames.
        let frame = Frame::decode(&frame.encode()?)?;
        remote
            .emit(LinkEvent::Message {
                from: link.remote_key.clone(),
                frame,
            })
            .await;
        Ok(())
    }

    async fn disconnect(&self, peer: &str) {
        let Some((_, link)) = self.inner.links.remove(peer) else {
            return;
        };
        info!(peer = %peer, "link closed locally");
        self.inner
            .emit(LinkEvent::Disconnected {
                peer: peer.to_string(),
            })
            .await;
        if let Some(remote) = link.remote.upgrade()
            && remote.links.remove_if(&link.remote_key, link.link_id).is_some()
        {
            remote
                .emit(LinkEvent::Disconnected {
                    peer: link.remote_key.clone(),
                })
                .await;
        }
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.inner.links.contains(peer)
    }

    fn connected_peers(&self) -> Vec<String> {
        self.inner.links.names()
    }

    fn set_credential_table(&self, table: CredentialTable) {
        *self.inner.credential_table.write() = table;
    }
}
