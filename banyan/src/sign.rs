//! Coordinate the signing of a transaction proposal.
//!
//! Keystores fill a per-input, per-cosigner signature matrix from a shared
//! BIP-143 sighash cache. The wallet addresses then weave the signatures
//! into each input's signature script and witness, and the result is checked
//! by executing every input against the output it spends.

use crate::spend::{is_bip69_sorted, TxProposal};

use std::{collections::HashMap, error, fmt, sync::Arc};

use miniscript::bitcoin::{
    consensus, ecdsa,
    hashes::{sha256, Hash},
    secp256k1,
    sighash::{EcdsaSighashType, SighashCache},
    Amount, OutPoint, Script, ScriptBuf, Transaction, TxOut, Witness,
};
use serde::{Deserialize, Serialize};

/// The wallet-internal identifier of a pk_script: the hex encoding of its
/// byte-reversed SHA-256 hash, as used by the Electrum protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptHashHex(String);

impl ScriptHashHex {
    pub fn from_pk_script(pk_script: &Script) -> ScriptHashHex {
        let mut hash = sha256::Hash::hash(pk_script.as_bytes()).to_byte_array();
        hash.reverse();
        ScriptHashHex(hex::encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHashHex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An unspent transaction output owned by the wallet, keyed by the hash of
/// its pk_script in the wallet's address book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
    pub tx_out: TxOut,
    pub script_hash: ScriptHashHex,
}

impl SpendableOutput {
    pub fn new(tx_out: TxOut) -> SpendableOutput {
        let script_hash = ScriptHashHex::from_pk_script(&tx_out.script_pubkey);
        SpendableOutput {
            tx_out,
            script_hash,
        }
    }
}

/// A wallet address, able to produce the scripts involved in spending coins
/// paying to it.
pub trait Address: Send + Sync {
    /// The script this address pays to.
    fn pk_script(&self) -> ScriptBuf;

    /// The script code against which BIP-143 signature hashes of an input
    /// spending this address are computed.
    fn script_code(&self) -> ScriptBuf;

    /// Assemble the signature script and witness of an input spending this
    /// address, from the signatures of all cosigners in cosigner order.
    fn signature_script(&self, signatures: Vec<ecdsa::Signature>) -> (ScriptBuf, Witness);
}

/// Resolution from a script hash to the wallet address owning it. Total over
/// the hashes of wallet-owned outputs.
pub trait AddressBook {
    fn get_address(&self, script_hash: &ScriptHashHex) -> Option<Arc<dyn Address>>;
}

#[derive(Debug)]
pub enum SigningError {
    /// The user declined the transaction on the device. Not retried.
    UserAborted,
    /// The device requires its PIN before it can sign.
    PinRequired,
    /// The device is locked and refuses to sign.
    DeviceLocked,
    /// I/O failure while talking to a signing device. The device stays
    /// registered, retrying is at the caller's discretion.
    Communication(String),
    /// Signing requires at least one keystore.
    NoKeystore,
    InvalidInputIndex(usize),
    InvalidCosignerIndex(usize),
    /// An input spends an output missing from the previous outputs map.
    MissingPreviousOutput(OutPoint),
    /// No wallet address resolves this script hash.
    UnknownScriptHash(ScriptHashHex),
    /// A keystore returned success without filling its column of the
    /// signature matrix.
    MissingSignature {
        input_index: usize,
        cosigner_index: usize,
    },
    NotBip69Sorted,
    /// The signed transaction failed script verification against the
    /// outputs it spends. A bug in the transaction builder or a keystore,
    /// never a user error: the signing flow is halted.
    ConsensusValidation {
        input_index: usize,
        reason: String,
    },
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UserAborted => write!(f, "Aborted by the user on the device."),
            Self::PinRequired => write!(f, "The device requires its PIN to be entered."),
            Self::DeviceLocked => write!(f, "The device is locked."),
            Self::Communication(details) => {
                write!(f, "Failed to communicate with the device: {}.", details)
            }
            Self::NoKeystore => write!(f, "No keystore to sign with."),
            Self::InvalidInputIndex(index) => write!(f, "No input at index {}.", index),
            Self::InvalidCosignerIndex(index) => write!(f, "No cosigner at index {}.", index),
            Self::MissingPreviousOutput(out_point) => write!(
                f,
                "There needs to be exactly one output being spent per input, none known for '{}'.",
                out_point
            ),
            Self::UnknownScriptHash(script_hash) => write!(
                f,
                "No wallet address for the script hash '{}'.",
                script_hash
            ),
            Self::MissingSignature {
                input_index,
                cosigner_index,
            } => write!(
                f,
                "Missing signature for input {} from cosigner {}.",
                input_index, cosigner_index
            ),
            Self::NotBip69Sorted => write!(f, "Transaction is not BIP-69 conformant."),
            Self::ConsensusValidation {
                input_index,
                reason,
            } => write!(
                f,
                "BUG! Please report this. The signed transaction failed verification on \
                input {}: {}.",
                input_index, reason
            ),
        }
    }
}

impl error::Error for SigningError {}

#[derive(Debug, Clone)]
pub struct ScriptVerificationError(pub String);

impl fmt::Display for ScriptVerificationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for ScriptVerificationError {}

/// Execution of an input's scripts against the output it spends.
pub trait ScriptVerifier {
    /// Check that input `input_index` of the consensus-serialized
    /// `spending_tx` correctly spends an output paying `value` to
    /// `pk_script`.
    fn verify_input(
        &self,
        pk_script: &Script,
        value: Amount,
        spending_tx: &[u8],
        input_index: usize,
    ) -> Result<(), ScriptVerificationError>;
}

/// The default [ScriptVerifier], backed by libbitcoinconsensus with all
/// standard verification flags.
pub struct ConsensusVerifier;

impl ScriptVerifier for ConsensusVerifier {
    fn verify_input(
        &self,
        pk_script: &Script,
        value: Amount,
        spending_tx: &[u8],
        input_index: usize,
    ) -> Result<(), ScriptVerificationError> {
        bitcoinconsensus::verify_with_flags(
            pk_script.as_bytes(),
            value.to_sat(),
            spending_tx,
            input_index,
            bitcoinconsensus::VERIFY_ALL,
        )
        .map_err(|e| ScriptVerificationError(e.to_string()))
    }
}

/// A signer for one cosigner of the wallet.
pub trait Keystore {
    /// Provide a signature for every input of the proposed transaction, in
    /// column `cosigner_index` of its signature matrix.
    fn sign_transaction(
        &self,
        transaction: &mut ProposedTransaction,
        cosigner_index: usize,
    ) -> Result<(), SigningError>;
}

/// The non-empty, ordered set of keystores signing for a wallet, one per
/// cosigner.
pub struct Keystores(Vec<Arc<dyn Keystore>>);

impl std::fmt::Debug for Keystores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystores")
            .field("len", &self.0.len())
            .finish()
    }
}

impl Keystores {
    pub fn new(keystores: Vec<Arc<dyn Keystore>>) -> Result<Keystores, SigningError> {
        if keystores.is_empty() {
            return Err(SigningError::NoKeystore);
        }
        Ok(Keystores(keystores))
    }

    pub fn cosigner_count(&self) -> usize {
        self.0.len()
    }

    fn sign_transaction(&self, transaction: &mut ProposedTransaction) -> Result<(), SigningError> {
        for (cosigner_index, keystore) in self.0.iter().enumerate() {
            keystore.sign_transaction(transaction, cosigner_index)?;
        }
        Ok(())
    }
}

/// All the information needed by keystores to sign a transaction proposal.
///
/// The signature matrix is laid out `[input][cosigner]`: inputs are authored
/// independently and cosigners fan in. It is allocated with its final
/// dimensions and fully empty, and must be fully populated by the keystores.
pub struct ProposedTransaction<'a> {
    pub tx_proposal: &'a TxProposal,
    pub previous_outputs: &'a HashMap<OutPoint, SpendableOutput>,
    pub address_book: &'a dyn AddressBook,
    signatures: Vec<Vec<Option<ecdsa::Signature>>>,
    // BIP-143 midstates over the unsigned transaction, computed once and
    // shared by all inputs and all cosigners.
    sig_hashes: SighashCache<Transaction>,
}

impl<'a> ProposedTransaction<'a> {
    pub fn new(
        tx_proposal: &'a TxProposal,
        previous_outputs: &'a HashMap<OutPoint, SpendableOutput>,
        address_book: &'a dyn AddressBook,
        cosigner_count: usize,
    ) -> ProposedTransaction<'a> {
        let num_inputs = tx_proposal.transaction.input.len();
        let sig_hashes = SighashCache::new(tx_proposal.transaction.clone());
        ProposedTransaction {
            tx_proposal,
            previous_outputs,
            address_book,
            signatures: vec![vec![None; cosigner_count]; num_inputs],
            sig_hashes,
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.tx_proposal.transaction.input.len()
    }

    pub fn cosigner_count(&self) -> usize {
        self.signatures.first().map(Vec::len).unwrap_or(0)
    }

    /// The wallet output spent by the input at `input_index`.
    pub fn previous_output(&self, input_index: usize) -> Result<&SpendableOutput, SigningError> {
        let tx_in = self
            .tx_proposal
            .transaction
            .input
            .get(input_index)
            .ok_or(SigningError::InvalidInputIndex(input_index))?;
        self.previous_outputs
            .get(&tx_in.previous_output)
            .ok_or(SigningError::MissingPreviousOutput(tx_in.previous_output))
    }

    /// The BIP-143 signature hash committing to the input at `input_index`.
    /// The script code comes from the address owning the spent output;
    /// segwit v0 hashing is the same for P2WPKH and P2WSH once the script
    /// code is known.
    pub fn signature_hash(&mut self, input_index: usize) -> Result<[u8; 32], SigningError> {
        let tx_in = self
            .tx_proposal
            .transaction
            .input
            .get(input_index)
            .ok_or(SigningError::InvalidInputIndex(input_index))?;
        let spent_output = self
            .previous_outputs
            .get(&tx_in.previous_output)
            .ok_or(SigningError::MissingPreviousOutput(tx_in.previous_output))?;
        let address = self
            .address_book
            .get_address(&spent_output.script_hash)
            .ok_or_else(|| SigningError::UnknownScriptHash(spent_output.script_hash.clone()))?;
        let sighash = self
            .sig_hashes
            .p2wsh_signature_hash(
                input_index,
                &address.script_code(),
                spent_output.tx_out.value,
                EcdsaSighashType::All,
            )
            .map_err(|_| SigningError::InvalidInputIndex(input_index))?;
        Ok(sighash.to_byte_array())
    }

    /// Record the signature of cosigner `cosigner_index` for the input at
    /// `input_index`.
    pub fn add_signature(
        &mut self,
        input_index: usize,
        cosigner_index: usize,
        signature: secp256k1::ecdsa::Signature,
    ) -> Result<(), SigningError> {
        let cell = self
            .signatures
            .get_mut(input_index)
            .ok_or(SigningError::InvalidInputIndex(input_index))?
            .get_mut(cosigner_index)
            .ok_or(SigningError::InvalidCosignerIndex(cosigner_index))?;
        *cell = Some(ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        });
        Ok(())
    }
}

/// Sign every input of the proposal. Assumes all spent outputs belong to the
/// wallet: `previous_outputs` must contain the output spent by each input of
/// the transaction. On success, every input of the proposal's transaction
/// carries its final signature script and witness and the transaction has
/// passed script verification against the outputs it spends. The proposal is
/// only mutated on success: on any error it keeps its unsigned transaction.
pub fn sign_transaction(
    keystores: &Keystores,
    tx_proposal: &mut TxProposal,
    previous_outputs: &HashMap<OutPoint, SpendableOutput>,
    address_book: &dyn AddressBook,
    verifier: &dyn ScriptVerifier,
) -> Result<(), SigningError> {
    let signatures = {
        let mut proposed = ProposedTransaction::new(
            tx_proposal,
            previous_outputs,
            address_book,
            keystores.cosigner_count(),
        );
        keystores.sign_transaction(&mut proposed)?;
        proposed.signatures
    };

    // Assemble the signature scripts on a local copy of the transaction. The
    // proposal gets it only once every input could be assembled and the
    // whole transaction passed the validity check, so a half-signed
    // transaction never escapes to the caller.
    let mut signed_transaction = tx_proposal.transaction.clone();
    for (input_index, tx_in) in signed_transaction.input.iter_mut().enumerate() {
        let spent_output = previous_outputs
            .get(&tx_in.previous_output)
            .ok_or(SigningError::MissingPreviousOutput(tx_in.previous_output))?;
        let address = address_book
            .get_address(&spent_output.script_hash)
            .ok_or_else(|| SigningError::UnknownScriptHash(spent_output.script_hash.clone()))?;

        let row = &signatures[input_index];
        let mut input_signatures = Vec::with_capacity(row.len());
        for (cosigner_index, signature) in row.iter().enumerate() {
            match signature {
                Some(signature) => input_signatures.push(*signature),
                None => {
                    return Err(SigningError::MissingSignature {
                        input_index,
                        cosigner_index,
                    })
                }
            }
        }
        let (script_sig, witness) = address.signature_script(input_signatures);
        tx_in.script_sig = script_sig;
        tx_in.witness = witness;
    }

    // Sanity check: the transaction we just signed must actually be valid.
    tx_validity_check(&signed_transaction, previous_outputs, verifier)?;

    tx_proposal.transaction = signed_transaction;
    Ok(())
}

// Check the fully signed transaction is BIP-69 conformant and that every
// input's scripts execute against the output it spends.
fn tx_validity_check(
    transaction: &Transaction,
    previous_outputs: &HashMap<OutPoint, SpendableOutput>,
    verifier: &dyn ScriptVerifier,
) -> Result<(), SigningError> {
    if !is_bip69_sorted(transaction) {
        return Err(SigningError::NotBip69Sorted);
    }
    let tx_bytes = consensus::serialize(transaction);
    for (input_index, tx_in) in transaction.input.iter().enumerate() {
        let spent_output = previous_outputs
            .get(&tx_in.previous_output)
            .ok_or(SigningError::MissingPreviousOutput(tx_in.previous_output))?;
        if let Err(e) = verifier.verify_input(
            &spent_output.tx_out.script_pubkey,
            spent_output.tx_out.value,
            &tx_bytes,
            input_index,
        ) {
            log::error!(
                "Signed transaction failed the validity check on input {}: {}.",
                input_index,
                e
            );
            return Err(SigningError::ConsensusValidation {
                input_index,
                reason: e.to_string(),
            });
        }
    }
    Ok(())
}
