use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

pub type MemberId = u64;

#[derive(Debug, Clone)]
struct Member {
    outbox: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

/// Broadcast membership. Fan-out works on a snapshot taken under the map's
/// shard locks, so joins and leaves never block or invalidate a delivery in
/// progress, and members flagged closed are skipped.
#[derive(Debug, Default)]
pub struct Registry {
    members: DashMap<MemberId, Member>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, outbox: mpsc::UnboundedSender<Message>, open: Arc<AtomicBool>) -> MemberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.members.insert(id, Member { outbox, open });
        id
    }

    pub fn leave(&self, id: MemberId) -> bool {
        self.members.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Queues `message` for every open member except `origin`. Returns the
    /// number of members it was queued for.
    pub fn fan_out(&self, origin: MemberId, message: &Message) -> usize {
        let targets: Vec<(MemberId, Member)> = self
            .members
            .iter()
            .filter(|entry| *entry.key() != origin)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, member) in targets {
            if !member.open.load(Ordering::Acquire) {
                continue;
            }
            if member.outbox.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                trace!("Dropping member {} with closed outbox", id);
                self.members.remove(&id);
            }
        }
        delivered
    }
}
