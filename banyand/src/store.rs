//! Interface to the wallet's transaction and coin index.

use std::collections::HashMap;

use banyan::sign::SpendableOutput;
use miniscript::bitcoin::OutPoint;

/// The wallet's view of its coins. Indexing and persistence live out of
/// tree; the daemon only ever asks for what is currently spendable.
pub trait TransactionStore: Send {
    /// All outputs currently spendable by the wallet.
    fn spendable_outputs(&self) -> HashMap<OutPoint, SpendableOutput>;
}
