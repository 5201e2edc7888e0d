//! Implementation of the commands the wallet's request surface calls into.

use crate::{chain::Chain, store::TransactionStore};

use std::{
    collections::HashMap,
    error, fmt,
    sync::{Arc, Mutex},
};

use banyan::{
    sign::{
        self, Address, AddressBook, Keystores, ScriptVerifier, SigningError, SpendableOutput,
    },
    spend::{self, SpendCreationError, TxProposal},
};
use miniscript::bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid};

/// Feerate floor, used when the backend has no estimate for a target.
pub const MINIMUM_FEE_RATE_PER_KVB: Amount = Amount::from_sat(1_000);

/// What to send: an explicit amount, or everything the wallet owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAmount {
    All,
    Value(Amount),
}

/// The confirmation speed a fee rate can be requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeTarget {
    /// Confirmation within 2 blocks.
    High,
    /// Confirmation within 6 blocks.
    Normal,
    /// Confirmation within 24 blocks.
    Economy,
    /// An explicit fee rate in satoshis per 1000 virtual bytes.
    Rate(Amount),
}

impl FeeTarget {
    fn target_blocks(self) -> Option<u16> {
        match self {
            Self::High => Some(2),
            Self::Normal => Some(6),
            Self::Economy => Some(24),
            Self::Rate(..) => None,
        }
    }
}

#[derive(Debug)]
pub enum CommandError {
    InvalidAmount(Amount),
    SpendCreation(SpendCreationError),
    Signing(SigningError),
    TxBroadcast(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidAmount(amount) => write!(f, "Invalid amount '{}'.", amount),
            Self::SpendCreation(e) => write!(f, "Creating spend: {}", e),
            Self::Signing(e) => write!(f, "Signing spend: {}", e),
            Self::TxBroadcast(e) => write!(f, "Broadcasting transaction: {}", e),
        }
    }
}

impl error::Error for CommandError {}

impl From<SpendCreationError> for CommandError {
    fn from(e: SpendCreationError) -> Self {
        Self::SpendCreation(e)
    }
}

/// How a send command concluded. An abort on the device is a benign
/// non-success, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(Txid),
    Aborted,
}

/// Source of fresh change addresses for the wallet.
pub trait ChangeAddressSource: Send + Sync {
    fn next_change_address(&self) -> Arc<dyn Address>;
}

/// The API the external world (typically a request handler) uses to talk to
/// the wallet. Every collaborator is injected, the control owns no global
/// state.
pub struct DaemonControl {
    chain: Arc<Mutex<dyn Chain>>,
    store: Arc<Mutex<dyn TransactionStore>>,
    address_book: Arc<dyn AddressBook + Send + Sync>,
    change_addresses: Arc<dyn ChangeAddressSource>,
    verifier: Arc<dyn ScriptVerifier + Send + Sync>,
}

impl DaemonControl {
    pub fn new(
        chain: Arc<Mutex<dyn Chain>>,
        store: Arc<Mutex<dyn TransactionStore>>,
        address_book: Arc<dyn AddressBook + Send + Sync>,
        change_addresses: Arc<dyn ChangeAddressSource>,
        verifier: Arc<dyn ScriptVerifier + Send + Sync>,
    ) -> DaemonControl {
        DaemonControl {
            chain,
            store,
            address_book,
            change_addresses,
            verifier,
        }
    }

    // The fee rate to use for this target, never below the floor.
    fn fee_rate_per_kvb(&self, fee_target: FeeTarget) -> Amount {
        let estimate = match fee_target {
            FeeTarget::Rate(rate) => Some(rate),
            target => target
                .target_blocks()
                .and_then(|blocks| self.chain.lock().unwrap().fee_rate_per_kvb(blocks)),
        };
        match estimate {
            Some(rate) if rate >= MINIMUM_FEE_RATE_PER_KVB => rate,
            Some(rate) => {
                log::debug!("Fee rate {} below the floor, clamping.", rate);
                MINIMUM_FEE_RATE_PER_KVB
            }
            None => {
                log::debug!("No fee estimate for {:?}, using the floor.", fee_target);
                MINIMUM_FEE_RATE_PER_KVB
            }
        }
    }

    /// Create a spend transaction to `recipient_pk_script`. Returns the
    /// proposal together with the wallet outputs it may spend, ready for
    /// [DaemonControl::send_spend].
    pub fn create_spend(
        &self,
        recipient_pk_script: ScriptBuf,
        amount: SendAmount,
        fee_target: FeeTarget,
    ) -> Result<(TxProposal, HashMap<OutPoint, SpendableOutput>), CommandError> {
        let fee_rate = self.fee_rate_per_kvb(fee_target);
        let previous_outputs = self.store.lock().unwrap().spendable_outputs();
        let coins: HashMap<OutPoint, TxOut> = previous_outputs
            .iter()
            .map(|(out_point, spendable)| (*out_point, spendable.tx_out.clone()))
            .collect();

        let proposal = match amount {
            SendAmount::All => spend::create_spend_all(&coins, recipient_pk_script, fee_rate)?,
            SendAmount::Value(value) => {
                if value == Amount::ZERO {
                    return Err(CommandError::InvalidAmount(value));
                }
                spend::create_spend(
                    &coins,
                    TxOut {
                        value,
                        script_pubkey: recipient_pk_script,
                    },
                    fee_rate,
                    || self.change_addresses.next_change_address(),
                )?
            }
        };
        Ok((proposal, previous_outputs))
    }

    /// Sign the proposal with the given keystores and broadcast it.
    pub fn send_spend(
        &self,
        keystores: &Keystores,
        proposal: &mut TxProposal,
        previous_outputs: &HashMap<OutPoint, SpendableOutput>,
    ) -> Result<SendOutcome, CommandError> {
        match sign::sign_transaction(
            keystores,
            proposal,
            previous_outputs,
            self.address_book.as_ref(),
            self.verifier.as_ref(),
        ) {
            Ok(()) => {}
            Err(SigningError::UserAborted) => {
                log::info!("Transaction signing was aborted by the user.");
                return Ok(SendOutcome::Aborted);
            }
            Err(e) => return Err(CommandError::Signing(e)),
        }

        self.chain
            .lock()
            .unwrap()
            .broadcast_tx(&proposal.transaction)
            .map_err(CommandError::TxBroadcast)?;
        let txid = proposal.transaction.compute_txid();
        log::info!("Broadcast transaction {}.", txid);
        Ok(SendOutcome::Sent(txid))
    }
}
