//! Dummy wallet collaborators for unit tests, with deterministic keys.

use crate::sign::{
    Address, AddressBook, Keystore, ProposedTransaction, ScriptHashHex, ScriptVerificationError,
    ScriptVerifier, SigningError, SpendableOutput,
};

use std::{collections::HashMap, sync::Arc};

use miniscript::bitcoin::{
    consensus, ecdsa,
    hashes::Hash,
    secp256k1::{self, Secp256k1, SecretKey},
    sighash::SighashCache,
    Amount, CompressedPublicKey, OutPoint, Script, ScriptBuf, Transaction, TxOut, Witness,
};

/// A single-sig P2WPKH address.
pub struct TestAddress {
    public_key: CompressedPublicKey,
}

impl Address for TestAddress {
    fn pk_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash())
    }

    fn script_code(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.public_key.pubkey_hash())
    }

    fn signature_script(&self, signatures: Vec<ecdsa::Signature>) -> (ScriptBuf, Witness) {
        let signature = signatures.first().expect("a single cosigner");
        let mut witness = Witness::new();
        witness.push(signature.serialize().to_vec());
        witness.push(self.public_key.0.serialize());
        (ScriptBuf::new(), witness)
    }
}

/// An in-memory wallet: address book plus the matching secret keys.
pub struct TestWallet {
    secp: Secp256k1<secp256k1::All>,
    addresses: HashMap<ScriptHashHex, Arc<dyn Address>>,
    keys: HashMap<ScriptHashHex, SecretKey>,
}

impl TestWallet {
    pub fn new() -> TestWallet {
        TestWallet {
            secp: Secp256k1::new(),
            addresses: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Derive a fresh address for the deterministic key at `index`.
    pub fn new_address(&mut self, index: u8) -> Arc<dyn Address> {
        assert!(index > 0, "index 0 is not a valid secret key");
        let secret_key = SecretKey::from_slice(&[index; 32]).expect("deterministic test key");
        let public_key = CompressedPublicKey(secp256k1::PublicKey::from_secret_key(
            &self.secp,
            &secret_key,
        ));
        let address: Arc<dyn Address> = Arc::new(TestAddress { public_key });
        let script_hash = ScriptHashHex::from_pk_script(&address.pk_script());
        self.addresses.insert(script_hash.clone(), address.clone());
        self.keys.insert(script_hash, secret_key);
        address
    }

    /// A wallet-owned coin of `value` sats at `out_point`, paying to the
    /// address at `index`.
    pub fn spendable_output(
        &mut self,
        index: u8,
        out_point: OutPoint,
        value: u64,
    ) -> (OutPoint, SpendableOutput) {
        let address = self.new_address(index);
        let tx_out = TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.pk_script(),
        };
        (out_point, SpendableOutput::new(tx_out))
    }

    /// A software keystore holding every key of this wallet.
    pub fn keystore(&self) -> Arc<dyn Keystore> {
        Arc::new(SoftwareKeystore {
            secp: self.secp.clone(),
            keys: self.keys.clone(),
        })
    }
}

impl AddressBook for TestWallet {
    fn get_address(&self, script_hash: &ScriptHashHex) -> Option<Arc<dyn Address>> {
        self.addresses.get(script_hash).cloned()
    }
}

/// Signs every input with in-memory keys, like a hardware keystore would.
pub struct SoftwareKeystore {
    secp: Secp256k1<secp256k1::All>,
    keys: HashMap<ScriptHashHex, SecretKey>,
}

impl Keystore for SoftwareKeystore {
    fn sign_transaction(
        &self,
        transaction: &mut ProposedTransaction,
        cosigner_index: usize,
    ) -> Result<(), SigningError> {
        for input_index in 0..transaction.num_inputs() {
            let script_hash = transaction.previous_output(input_index)?.script_hash.clone();
            let message = secp256k1::Message::from_digest(transaction.signature_hash(input_index)?);
            let secret_key = self
                .keys
                .get(&script_hash)
                .ok_or_else(|| SigningError::UnknownScriptHash(script_hash.clone()))?;
            let signature = self.secp.sign_ecdsa_low_r(&message, secret_key);
            transaction.add_signature(input_index, cosigner_index, signature)?;
        }
        Ok(())
    }
}

/// Fails every signing request like a device whose user pressed the wrong
/// touch button.
pub struct AbortingKeystore;

impl Keystore for AbortingKeystore {
    fn sign_transaction(
        &self,
        _transaction: &mut ProposedTransaction,
        _cosigner_index: usize,
    ) -> Result<(), SigningError> {
        Err(SigningError::UserAborted)
    }
}

/// Returns success without providing any signature.
pub struct NoopKeystore;

impl Keystore for NoopKeystore {
    fn sign_transaction(
        &self,
        _transaction: &mut ProposedTransaction,
        _cosigner_index: usize,
    ) -> Result<(), SigningError> {
        Ok(())
    }
}

/// Signs only the first input, leaving the rest of its column empty.
pub struct FirstInputKeystore;

impl Keystore for FirstInputKeystore {
    fn sign_transaction(
        &self,
        transaction: &mut ProposedTransaction,
        cosigner_index: usize,
    ) -> Result<(), SigningError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x43; 32]).expect("valid test key");
        let message = secp256k1::Message::from_digest(transaction.signature_hash(0)?);
        transaction.add_signature(0, cosigner_index, secp.sign_ecdsa(&message, &secret_key))
    }
}

/// Fills the matrix with well-formed signatures over the wrong digest.
pub struct GarbageKeystore;

impl Keystore for GarbageKeystore {
    fn sign_transaction(
        &self,
        transaction: &mut ProposedTransaction,
        cosigner_index: usize,
    ) -> Result<(), SigningError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x42; 32]).expect("valid test key");
        let message = secp256k1::Message::from_digest([0x21; 32]);
        for input_index in 0..transaction.num_inputs() {
            let signature = secp.sign_ecdsa(&message, &secret_key);
            transaction.add_signature(input_index, cosigner_index, signature)?;
        }
        Ok(())
    }
}

/// Script verification for P2WPKH inputs without the consensus engine: the
/// witness must carry a signature, valid over the recomputed BIP-143
/// sighash, from the key the spent script pays to.
pub struct SigCheckVerifier {
    secp: Secp256k1<secp256k1::All>,
}

impl SigCheckVerifier {
    pub fn new() -> SigCheckVerifier {
        SigCheckVerifier {
            secp: Secp256k1::new(),
        }
    }
}

impl ScriptVerifier for SigCheckVerifier {
    fn verify_input(
        &self,
        pk_script: &Script,
        value: Amount,
        spending_tx: &[u8],
        input_index: usize,
    ) -> Result<(), ScriptVerificationError> {
        let transaction: Transaction = consensus::deserialize(spending_tx)
            .map_err(|e| ScriptVerificationError(e.to_string()))?;
        let tx_in = transaction
            .input
            .get(input_index)
            .ok_or_else(|| ScriptVerificationError("no input at this index".to_string()))?;
        if tx_in.witness.len() != 2 {
            return Err(ScriptVerificationError(
                "expected a signature and a pubkey witness".to_string(),
            ));
        }
        let signature = ecdsa::Signature::from_slice(tx_in.witness.nth(0).expect("two items"))
            .map_err(|e| ScriptVerificationError(e.to_string()))?;
        let public_key =
            secp256k1::PublicKey::from_slice(tx_in.witness.nth(1).expect("two items"))
                .map_err(|e| ScriptVerificationError(e.to_string()))?;
        let expected_script = ScriptBuf::new_p2wpkh(&CompressedPublicKey(public_key).wpubkey_hash());
        if pk_script.as_bytes() != expected_script.as_bytes() {
            return Err(ScriptVerificationError(
                "pubkey does not match the spent script".to_string(),
            ));
        }
        let mut sig_hashes = SighashCache::new(&transaction);
        let sighash = sig_hashes
            .p2wpkh_signature_hash(input_index, pk_script, value, signature.sighash_type)
            .map_err(|e| ScriptVerificationError(e.to_string()))?;
        let message = secp256k1::Message::from_digest(sighash.to_byte_array());
        self.secp
            .verify_ecdsa(&message, &signature.signature, &public_key)
            .map_err(|e| ScriptVerificationError(e.to_string()))
    }
}

// An address whose script is too large for the change policy.
struct OversizedAddress;

impl Address for OversizedAddress {
    fn pk_script(&self) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x00; 26])
    }

    fn script_code(&self) -> ScriptBuf {
        self.pk_script()
    }

    fn signature_script(&self, _signatures: Vec<ecdsa::Signature>) -> (ScriptBuf, Witness) {
        (ScriptBuf::new(), Witness::new())
    }
}

pub fn oversized_script_address() -> Arc<dyn Address> {
    Arc::new(OversizedAddress)
}
