//! Transport abstraction for point-to-point links between named endpoints.
//!
//! A transport instance is one identity: it can listen for inbound links,
//! dial outbound ones, and send frames to any linked peer by name. Link
//! lifecycle and inbound frames are reported on the event channel returned
//! when the transport is created; frames from one link arrive in order.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use huddle_core::CredentialTable;
use serde::{Deserialize, Serialize};

use crate::protocol::Frame;

/// Capacity of each transport's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened on one of a transport's links.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected { peer: String },
    Disconnected { peer: String },
    Message { from: String, frame: Frame },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Name this identity presents when dialing.
    fn local_name(&self) -> &str;

    /// Start accepting inbound links gated by `access_key`. Returns the bound
    /// port, which differs from `port` when `port` is 0.
    async fn listen(&self, address: &str, port: u16, access_key: &str) -> huddle_core::Result<u16>;

    /// Dial `peer` and register the link under that name.
    async fn connect(
        &self,
        peer: &str,
        address: &str,
        port: u16,
        access_key: &str,
    ) -> huddle_core::Result<()>;

    /// Send a frame over the live link to `peer`.
    async fn send(&self, peer: &str, frame: &Frame) -> huddle_core::Result<()>;

    /// Close the link to `peer`, if any.
    async fn disconnect(&self, peer: &str);

    fn is_connected(&self, peer: &str) -> bool;

    fn connected_peers(&self) -> Vec<String>;

    /// Install the table used to authenticate inbound dialers.
    fn set_credential_table(&self, table: CredentialTable);
}

/// First messages exchanged on a new link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Handshake {
    Hello {
        name: String,
        access_key: String,
        credential: Option<String>,
    },
    Welcome {
        name: String,
    },
    Reject {
        reason: String,
    },
}

/// Live links keyed by peer name, each tagged with a link id so a stale
/// link's teardown never removes the link that replaced it.
pub(crate) struct LinkTable<L> {
    links: DashMap<String, (u64, L)>,
    next_id: AtomicU64,
}

impl<L: Clone> LinkTable<L> {
    pub(crate) fn new() -> Self {
        Self {
            links: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a link, returning the one it replaced.
    pub(crate) fn insert(&self, peer: &str, id: u64, link: L) -> Option<L> {
        self.links
            .insert(peer.to_string(), (id, link))
            .map(|(_, old)| old)
    }

    pub(crate) fn get(&self, peer: &str) -> Option<L> {
        self.links.get(peer).map(|entry| entry.1.clone())
    }

    /// Remove `peer` only if its current link is `id`.
    pub(crate) fn remove_if(&self, peer: &str, id: u64) -> Option<L> {
        self.links
            .remove_if(peer, |_, (current, _)| *current == id)
            .map(|(_, (_, link))| link)
    }

    pub(crate) fn remove(&self, peer: &str) -> Option<(u64, L)> {
        self.links.remove(peer).map(|(_, v)| v)
    }

    pub(crate) fn contains(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
