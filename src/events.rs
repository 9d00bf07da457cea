//! Chain notifications.

use crate::blockchain::Block;
use crate::index::Entry;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum ChainEvent {
    Connect { entry: Entry, block: Arc<Block> },
    Disconnect { entry: Entry, block: Arc<Block> },
    /// Emitted once per reorganization, after its disconnects and connects.
    Reorganize { from: Entry, to: Entry },
}

/// Receives events synchronously, after the commit that produced them.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: &ChainEvent);
}

/// Forwards events over a crossbeam channel.
pub struct ChannelSink {
    sender: Sender<ChainEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<ChainEvent>) {
        let (sender, receiver) = unbounded();
        (ChannelSink { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn notify(&self, event: &ChainEvent) {
        if self.sender.send(event.clone()).is_err() {
            warn!("event receiver dropped");
        }
    }
}
