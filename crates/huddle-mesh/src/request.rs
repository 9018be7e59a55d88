//! Request/response calls between linked participants.
//!
//! A participant registers named handlers; a peer calls one with
//! [`Participant::request`](crate::Participant::request) and waits for the
//! answer. Requests are matched to responses by a per-participant id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

/// Answers requests made under one name.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, from: &str, data: Value) -> Value;
}

#[async_trait]
impl<F> RequestHandler for F
where
    F: Fn(&str, Value) -> Value + Send + Sync,
{
    async fn handle(&self, from: &str, data: Value) -> Value {
        self(from, data)
    }
}

/// A peer's answer to one request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reply {
    pub handled: bool,
    pub result: Value,
}

struct Waiting {
    peer: String,
    reply: oneshot::Sender<Reply>,
}

/// Outstanding requests awaiting a response.
#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, Waiting>>,
}

impl PendingRequests {
    /// Reserve an id for a request to `peer`.
    pub(crate) fn open(&self, peer: &str) -> (u64, oneshot::Receiver<Reply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(
            id,
            Waiting {
                peer: peer.to_string(),
                reply: tx,
            },
        );
        (id, rx)
    }

    /// Hand a response to its waiter. Returns false when no request `id` to
    /// `from` is outstanding.
    pub(crate) fn complete(&self, from: &str, id: u64, reply: Reply) -> bool {
        let mut waiting = self.waiting.lock();
        match waiting.get(&id) {
            Some(w) if w.peer == from => {}
            _ => return false,
        }
        match waiting.remove(&id) {
            Some(w) => w.reply.send(reply).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, id: u64) {
        self.waiting.lock().remove(&id);
    }

    /// Drop every waiter; their callers see the request fail.
    pub(crate) fn clear(&self) {
        self.waiting.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiting.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn response_reaches_its_waiter() {
        let pending = PendingRequests::default();
        let (first, _rx1) = pending.open("B");
        let (second, rx2) = pending.open("B");
        assert_ne!(first, second);

        let reply = Reply {
            handled: true,
            result: json!(3),
        };
        assert!(pending.complete("B", second, reply.clone()));
        assert_eq!(rx2.await.unwrap(), reply);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn response_from_wrong_peer_is_ignored() {
        let pending = PendingRequests::default();
        let (id, _rx) = pending.open("B");
        let reply = Reply {
            handled: true,
            result: Value::Null,
        };
        assert!(!pending.complete("C", id, reply.clone()));
        assert!(!pending.complete("B", id + 100, reply));
        assert_eq!(pending.len(), 1);

        pending.cancel(id);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn closure_handlers() {
        let double = |_from: &str, data: Value| json!(data.as_i64().unwrap_or(0) * 2);
        assert_eq!(double.handle("B", json!(21)).await, json!(42));
    }
}
