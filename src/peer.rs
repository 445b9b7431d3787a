//! The ordered peer set and message delivery.

use futures::future::join_all;
use parking_lot::RwLock;
use prost::Message;
use std::{collections::HashSet, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{error::OracleError, protos::oracle::v1::PeerMessage};

/// Point-to-point delivery of peer messages.
///
/// Sends are fire-and-forget: the engine logs a failed send and relies on the round
/// timeouts instead of retrying at this level.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn send(&self, from: u32, to: u32, message: PeerMessage) -> Result<(), OracleError>;
}

/// Round-robin leader for `(epoch, round_id)` over `peer_count` peers.
pub fn leader_index(epoch: u64, round_id: u64, peer_count: usize) -> u32 {
    let n = peer_count.max(1) as u64;
    ((epoch % n + round_id % n) % n) as u32
}

pub struct PeerManager {
    local_index: u32,
    peer_count: usize,
    transport: Arc<dyn PeerTransport>,
}

impl PeerManager {
    pub fn new(
        local_index: u32,
        peer_count: usize,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, OracleError> {
        if peer_count == 0 {
            return Err(OracleError::InvalidConfiguration(
                "peer set must not be empty".to_string(),
            ));
        }
        if local_index as usize >= peer_count {
            return Err(OracleError::InvalidPeerIndex {
                index: local_index,
                peer_count,
            });
        }
        Ok(Self {
            local_index,
            peer_count,
            transport,
        })
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    pub fn leader_index(&self, epoch: u64, round_id: u64) -> u32 {
        leader_index(epoch, round_id, self.peer_count)
    }

    pub fn is_leader(&self, epoch: u64, round_id: u64) -> bool {
        self.leader_index(epoch, round_id) == self.local_index
    }

    /// Checks that `index` names a remote member of the peer set.
    pub fn validate_sender(&self, index: u32) -> Result<(), OracleError> {
        if index as usize >= self.peer_count {
            return Err(OracleError::InvalidPeerIndex {
                index,
                peer_count: self.peer_count,
            });
        }
        if index == self.local_index {
            return Err(OracleError::SelfMessage);
        }
        Ok(())
    }

    pub async fn send(&self, to: u32, message: PeerMessage) {
        if to == self.local_index {
            return;
        }
        let kind = message.kind();
        if let Err(e) = self.transport.send(self.local_index, to, message).await {
            warn!(to, kind, error = %e, "Failed to send peer message");
        }
    }

    pub async fn send_to_leader(&self, message: PeerMessage) {
        let leader = self.leader_index(message.epoch, message.round_id);
        self.send(leader, message).await;
    }

    /// Sends `message` to every other peer concurrently.
    pub async fn broadcast(&self, message: PeerMessage) {
        let sends = (0..self.peer_count as u32)
            .filter(|to| *to != self.local_index)
            .map(|to| self.send(to, message.clone()));
        join_all(sends).await;
    }
}

/// An encoded message as delivered to a peer's inbox.
pub type Envelope = (u32, Vec<u8>);

/// In-process transport connecting a whole peer set through unbounded channels.
///
/// Messages are prost-encoded on send, so receivers go through the same decode path as a
/// real wire. Individual links can be taken down to simulate loss and partitions.
pub struct LocalNetwork {
    inboxes: Vec<mpsc::UnboundedSender<Envelope>>,
    down: RwLock<HashSet<(u32, u32)>>,
}

impl LocalNetwork {
    pub fn new(peer_count: usize) -> (Arc<Self>, Vec<mpsc::UnboundedReceiver<Envelope>>) {
        let (inboxes, receivers): (Vec<_>, Vec<_>) =
            (0..peer_count).map(|_| mpsc::unbounded_channel()).unzip();
        let network = Arc::new(Self {
            inboxes,
            down: RwLock::new(HashSet::new()),
        });
        (network, receivers)
    }

    pub fn set_link(&self, from: u32, to: u32, up: bool) {
        let mut down = self.down.write();
        if up {
            down.remove(&(from, to));
        } else {
            down.insert((from, to));
        }
    }

    /// Cuts (or restores) every link into and out of `index`.
    pub fn isolate(&self, index: u32, isolated: bool) {
        for other in 0..self.inboxes.len() as u32 {
            if other != index {
                self.set_link(index, other, !isolated);
                self.set_link(other, index, !isolated);
            }
        }
    }

    fn is_up(&self, from: u32, to: u32) -> bool {
        !self.down.read().contains(&(from, to))
    }
}

#[async_trait::async_trait]
impl PeerTransport for LocalNetwork {
    async fn send(&self, from: u32, to: u32, message: PeerMessage) -> Result<(), OracleError> {
        let inbox = self
            .inboxes
            .get(to as usize)
            .ok_or(OracleError::InvalidPeerIndex {
                index: to,
                peer_count: self.inboxes.len(),
            })?;
        if !self.is_up(from, to) {
            debug!(from, to, kind = message.kind(), "Link down, dropping message");
            return Ok(());
        }
        inbox
            .send((from, message.encode_to_vec()))
            .map_err(|e| OracleError::Transport(e.to_string()))
    }
}
