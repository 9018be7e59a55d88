//! TCP transport.
//!
//! Wire format: length-delimited frames (`tokio-util`'s `LengthDelimitedCodec`)
//! carrying JSON. The first frame in each direction is a [`Handshake`]; after
//! that every frame is a [`Frame`]. Each link gets a reader task feeding the
//! transport's event channel and a writer task draining an outbound queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use huddle_core::{CredentialTable, HuddleError};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::authorize;
use crate::protocol::Frame;
use crate::transport::{EVENT_CHANNEL_CAPACITY, Handshake, LinkEvent, LinkTable, Transport};

/// Largest frame accepted on a link.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Clone)]
struct TcpLink {
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

struct Inner {
    name: String,
    credential: Option<String>,
    links: LinkTable<TcpLink>,
    access_key: RwLock<Option<String>>,
    credential_table: RwLock<CredentialTable>,
    events: mpsc::Sender<LinkEvent>,
    shutdown: CancellationToken,
}

/// One identity speaking the huddle wire protocol over TCP.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Create a transport named `name`. `credential` is presented to
    /// listeners that enforce a credential table.
    pub fn new(
        name: impl Into<String>,
        credential: Option<String>,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            name: name.into(),
            credential,
            links: LinkTable::new(),
            access_key: RwLock::new(None),
            credential_table: RwLock::new(CredentialTable::new()),
            events,
            shutdown: CancellationToken::new(),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Stop accepting links and close every open one.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for peer in self.inner.links.names() {
            self.disconnect(&peer).await;
        }
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LEN)
            .new_codec()
    }
}

async fn write_handshake(framed: &mut FramedStream, msg: &Handshake) -> huddle_core::Result<()> {
    let bytes = serde_json::to_vec(msg)?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| HuddleError::Transport(format!("handshake write: {e}")))
}

async fn read_handshake(framed: &mut FramedStream) -> huddle_core::Result<Handshake> {
    let next = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| HuddleError::Transport("handshake timed out".into()))?;
    match next {
        Some(Ok(bytes)) => serde_json::from_slice(&bytes)
            .map_err(|e| HuddleError::MalformedMessage(format!("handshake: {e}"))),
        Some(Err(e)) => Err(HuddleError::Transport(format!("handshake read: {e}"))),
        None => Err(HuddleError::Transport("closed during handshake".into())),
    }
}

impl Inner {
    /// Split a handshaken stream into reader and writer tasks and register
    /// the link under `peer`.
    async fn attach(self: &Arc<Self>, peer: String, framed: FramedStream) {
        let id = self.links.next_id();
        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE);
        let cancel = self.shutdown.child_token();
        let link = TcpLink {
            outbound,
            cancel: cancel.clone(),
        };

        if let Some(old) = self.links.insert(&peer, id, link) {
            info!(peer = %peer, "replacing existing link");
            old.cancel.cancel();
        }

        // Announce the link before its reader can emit any message.
        let _ = self
            .events
            .send(LinkEvent::Connected { peer: peer.clone() })
            .await;

        let (mut sink, mut stream) = framed.split();

        let writer_cancel = cancel.clone();
        let writer_peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = outbound_rx.recv() => match next {
                        Some(bytes) => {
                            if let Err(e) = sink.send(bytes).await {
                                warn!(peer = %writer_peer, error = %e, "link write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(bytes)) => match Frame::decode(&bytes) {
                            Ok(frame) => {
                                let event = LinkEvent::Message { from: peer.clone(), frame };
                                if this.events.send(event).await.is_err() {
                                    debug!(peer = %peer, "event receiver dropped");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "dropping undecodable frame");
                            }
                        },
                        Some(Err(e)) => {
                            warn!(peer = %peer, error = %e, "link read failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            cancel.cancel();
            if this.links.remove_if(&peer, id).is_some() {
                info!(peer = %peer, "link closed");
                let _ = this.events.send(LinkEvent::Disconnected { peer }).await;
            }
        });
    }

    /// Run the listener side of the handshake on a freshly accepted stream.
    async fn accept(self: Arc<Self>, stream: TcpStream) -> huddle_core::Result<()> {
        let mut framed = Framed::new(stream, TcpTransport::codec());
        let (name, access_key, credential) = match read_handshake(&mut framed).await? {
            Handshake::Hello {
                name,
                access_key,
                credential,
            } => (name, access_key, credential),
            other => {
                return Err(HuddleError::MalformedMessage(format!(
                    "expected hello, got {other:?}"
                )));
            }
        };

        let verdict = {
            let expected = self.access_key.read();
            let table = self.credential_table.read();
            match expected.as_deref() {
                Some(expected) => {
                    authorize(&name, &access_key, credential.as_deref(), expected, &table)
                }
                None => Err("not listening".to_string()),
            }
        };

        if let Err(reason) = verdict {
            warn!(peer = %name, reason = %reason, "rejecting inbound link");
            write_handshake(&mut framed, &Handshake::Reject { reason: reason.clone() }).await?;
            return Err(HuddleError::AuthRejected { peer: name, reason });
        }

        write_handshake(
            &mut framed,
            &Handshake::Welcome {
                name: self.name.clone(),
            },
        )
        .await?;
        info!(peer = %name, "inbound link established");
        self.attach(name, framed).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_name(&self) -> &str {
        &self.inner.name
    }

    async fn listen(&self, address: &str, port: u16, access_key: &str) -> huddle_core::Result<u16> {
        let listener = TcpListener::bind((address, port)).await?;
        let bound = listener.local_addr()?.port();
        *self.inner.access_key.write() = Some(access_key.to_string());
        info!(name = %self.inner.name, address, port = bound, "listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(remote = %addr, "incoming connection");
                            let inner = Arc::clone(&inner);
                            tokio::spawn(async move {
                                if let Err(e) = inner.accept(stream).await {
                                    warn!(remote = %addr, error = %e, "inbound handshake failed");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    },
                }
            }
        });

        Ok(bound)
    }

    async fn connect(
        &self,
        peer: &str,
        address: &str,
        port: u16,
        access_key: &str,
    ) -> huddle_core::Result<()> {
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect((address, port)))
            .await
            .map_err(|_| HuddleError::PeerUnreachable(format!("{peer} at {address}:{port}: timed out")))?
            .map_err(|e| HuddleError::PeerUnreachable(format!("{peer} at {address}:{port}: {e}")))?;

        let mut framed = Framed::new(stream, Self::codec());
        write_handshake(
            &mut framed,
            &Handshake::Hello {
                name: self.inner.name.clone(),
                access_key: access_key.to_string(),
                credential: self.inner.credential.clone(),
            },
        )
        .await?;

        match read_handshake(&mut framed).await? {
            Handshake::Welcome { name } => {
                if name != peer {
                    warn!(expected = %peer, actual = %name, "peer answered under a different name");
                }
                info!(peer = %peer, address, port, "outbound link established");
                self.inner.attach(peer.to_string(), framed).await;
                Ok(())
            }
            Handshake::Reject { reason } => Err(HuddleError::AuthRejected {
                peer: peer.to_string(),
                reason,
            }),
            Handshake::Hello { .. } => Err(HuddleError::MalformedMessage(
                "expected welcome, got hello".into(),
            )),
        }
    }

    async fn send(&self, peer: &str, frame: &Frame) -> huddle_core::Result<()> {
        let link = self
            .inner
            .links
            .get(peer)
            .ok_or_else(|| HuddleError::LinkNotEstablished(peer.to_string()))?;
        let bytes = Bytes::from(frame.encode()?);
        link.outbound
            .send(bytes)
            .await
            .map_err(|_| HuddleError::LinkNotEstablished(peer.to_string()))
    }

    async fn disconnect(&self, peer: &str) {
        if let Some((_, link)) = self.inner.links.remove(peer) {
            link.cancel.cancel();
            info!(peer = %peer, "link closed locally");
            let _ = self
                .inner
                .events
                .send(LinkEvent::Disconnected {
                    peer: peer.to_string(),
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
