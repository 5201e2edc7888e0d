//! Interface to the Bitcoin network.
//!
//! Broadcast transactions, follow the chain tip, gather fee estimates. The
//! backend itself lives out of tree.

use std::{fmt, sync::Arc};

use miniscript::bitcoin::{Amount, BlockHash, Transaction};

/// Information about the best block in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChainTip {
    pub hash: BlockHash,
    pub height: i32,
}

impl fmt::Display for BlockChainTip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.height, self.hash)
    }
}

/// Notified of each new best block.
pub trait HeadersListener: Send + Sync {
    fn on_new_tip(&self, tip: BlockChainTip);
}

/// Our Bitcoin backend.
pub trait Chain: Send {
    /// Get the best block info.
    fn chain_tip(&self) -> BlockChainTip;

    /// Feerate estimate in satoshis per 1000 virtual bytes for confirmation
    /// within this number of blocks, if the backend has one.
    fn fee_rate_per_kvb(&self, target_blocks: u16) -> Option<Amount>;

    /// Broadcast this transaction to the Bitcoin P2P network.
    fn broadcast_tx(&self, tx: &Transaction) -> Result<(), String>;

    /// Register a listener notified of each new chain tip.
    fn subscribe_headers(&mut self, listener: Arc<dyn HeadersListener>);
}
