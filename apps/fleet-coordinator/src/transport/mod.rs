//! Per-node message channels.
//!
//! Each connection is split into a reader task and a writer task (see
//! [`framed`]); the coordinator talks to it through a cloneable [`Link`] and
//! drains inbound frames from the matching [`Inbound`]. The [`Router`] binds
//! links to node ids once a handshake completes so higher layers address nodes
//! by id only. Reconnection is never attempted here: a closed link simply ends
//! its inbound stream.

mod framed;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use fleet_wire::{Envelope, encode_frame};
use parking_lot::RwLock;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};

use crate::error::{ProtocolError, TransportError};

pub use framed::spawn_link;

pub type LinkId = u64;

const OUTBOUND_DEPTH: usize = 256;
const INBOUND_DEPTH: usize = 256;
const MEMORY_PIPE_BYTES: usize = 64 * 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// In-process stream pair carrying the same framing as TCP.
pub fn memory_pipe() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(MEMORY_PIPE_BYTES)
}

/// Sending half of one connection.
#[derive(Clone)]
pub struct Link {
    id: LinkId,
    peer: Arc<str>,
    outbound: mpsc::Sender<Bytes>,
    write_timeout: Duration,
    closed: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Queues one envelope for the writer task.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let frame = encode_frame(envelope)?;
        match tokio::time::timeout(self.write_timeout, self.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Tears the connection down; the inbound stream ends shortly after.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Closes the wrapped link when dropped.
pub struct CloseOnDrop(pub Link);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Receiving half of one connection. Yields decoded envelopes, or the decode
/// error for a frame that arrived intact but could not be parsed, and ends
/// when the connection closes.
pub struct Inbound {
    link_id: LinkId,
    rx: mpsc::Receiver<Result<Envelope, ProtocolError>>,
}

impl Inbound {
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    pub async fn recv(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        self.rx.recv().await
    }
}

/// Node-id keyed view over the live links.
#[derive(Clone, Default)]
pub struct Router {
    links: Arc<RwLock<HashMap<String, Link>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `node_id` to `link`, returning the link it replaced.
    pub fn bind(&self, node_id: &str, link: Link) -> Option<Link> {
        self.links.write().insert(node_id.to_string(), link)
    }

    /// Removes the binding only if it still points at `link_id`.
    pub fn unbind(&self, node_id: &str, link_id: LinkId) -> bool {
        let mut guard = self.links.write();
        match guard.get(node_id) {
            Some(link) if link.id() == link_id => {
                guard.remove(node_id);
                true
            }
            _ => false,
        }
    }

    pub fn link(&self, node_id: &str) -> Option<Link> {
        self.links.read().get(node_id).cloned()
    }

    pub async fn send(&self, node_id: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let link = self
            .link(node_id)
            .ok_or_else(|| TransportError::UnknownNode(node_id.to_string()))?;
        link.send(envelope).await
    }

    pub fn close_all(&self) {
        let links: Vec<Link> = self.links.write().drain().map(|(_, link)| link).collect();
        for link in links {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_wire::Message;

    #[test_timeout::tokio_timeout_test(10)]
    async fn frames_cross_a_memory_pipe() {
        let (left, right) = memory_pipe();
        let (left_link, _left_in) = spawn_link(left, "left", Duration::from_secs(1));
        let (_right_link, mut right_in) = spawn_link(right, "right", Duration::from_secs(1));

        for id in 0..3 {
            left_link
                .send(&Envelope::new("node-a", id, Message::Heartbeat { node_time_us: id as i64 }))
                .await
                .expect("send");
        }
        for id in 0..3 {
            let envelope = right_in.recv().await.expect("open").expect("decoded");
            assert_eq!(envelope.id, id);
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_one_side_ends_the_other_stream() {
        let (left, right) = memory_pipe();
        let (left_link, _left_in) = spawn_link(left, "left", Duration::from_secs(1));
        let (right_link, mut right_in) = spawn_link(right, "right", Duration::from_secs(1));

        left_link.close();
        assert!(right_in.recv().await.is_none());
        let err = left_link
            .send(&Envelope::new("n", 0, Message::Heartbeat { node_time_us: 0 }))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Disconnected);
        drop(right_link);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn router_ignores_stale_unbind() {
        let router = Router::new();
        let (a, _b) = memory_pipe();
        let (c, _d) = memory_pipe();
        let (first, _first_in) = spawn_link(a, "first", Duration::from_secs(1));
        let (second, _second_in) = spawn_link(c, "second", Duration::from_secs(1));

        assert!(router.bind("node-a", first.clone()).is_none());
        let replaced = router.bind("node-a", second.clone()).expect("replaced");
        assert_eq!(replaced.id(), first.id());

        assert!(!router.unbind("node-a", first.id()));
        assert_eq!(router.link("node-a").map(|l| l.id()), Some(second.id()));
        assert!(router.unbind("node-a", second.id()));
        assert!(matches!(
            router
                .send("node-a", &Envelope::new("node-a", 0, Message::Heartbeat { node_time_us: 0 }))
                .await,
            Err(TransportError::UnknownNode(_))
        ));
    }
}
