//! Chain events delivered to subscribers.

use std::sync::Arc;

use btcnode_primitives::block::Block;

#[derive(Clone, Debug)]
pub enum Notification {
    /// The block passed contextual checks and was added to the index, on
    /// any branch.
    BlockAccepted(Arc<Block>),
    /// The block became the new tip of the best chain.
    BlockConnected(Arc<Block>),
    /// The block stopped being the tip of the best chain.
    BlockDisconnected(Arc<Block>),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BlockAccepted(_) => "BlockAccepted",
            Notification::BlockConnected(_) => "BlockConnected",
            Notification::BlockDisconnected(_) => "BlockDisconnected",
        }
    }

    pub fn block(&self) -> &Arc<Block> {
        match self {
            Notification::BlockAccepted(block)
            | Notification::BlockConnected(block)
            | Notification::BlockDisconnected(block) => block,
        }
    }
}

pub type NotificationCallback = Box<dyn Fn(&Notification) + Send + Sync>;
