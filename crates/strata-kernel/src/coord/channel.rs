//! The shared announcement channel every context of an origin listens on.

use strata_types::ContextId;
use tokio::sync::broadcast;

/// Messages on the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// A context exists. The primary answers with `PrimaryChanged`.
    Announce { id: ContextId },
    /// `id` now owns the store.
    PrimaryChanged { id: ContextId },
    /// `id` is gone; its lifetime lock was acquired by a peer.
    Departed { id: ContextId },
}

impl Announcement {
    pub fn id(&self) -> ContextId {
        match self {
            Announcement::Announce { id }
            | Announcement::PrimaryChanged { id }
            | Announcement::Departed { id } => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedChannel {
    tx: broadcast::Sender<Announcement>,
}

impl SharedChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of listeners reached.
    pub fn publish(&self, announcement: Announcement) -> usize {
        tracing::trace!(?announcement, "announce");
        self.tx.send(announcement).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.tx.subscribe()
    }
}
