//! A keystore signing through a registered hardware device.

use crate::device::{Device, DeviceError, SignRequest};

use std::sync::Arc;

use banyan::sign::{Keystore, ProposedTransaction, ScriptHashHex, SigningError};

/// Resolution from a wallet script hash to the keypath the matching key
/// lives at on the device.
pub trait KeypathLookup: Send + Sync {
    fn keypath(&self, script_hash: &ScriptHashHex) -> Option<String>;
}

fn signing_error(e: DeviceError) -> SigningError {
    match e {
        DeviceError::UserAborted => SigningError::UserAborted,
        DeviceError::Locked => SigningError::DeviceLocked,
        DeviceError::PinRequired => SigningError::PinRequired,
        e => SigningError::Communication(e.to_string()),
    }
}

/// One cosigner of the wallet, signing on its hardware device. The sighashes
/// of all inputs are sent as a single batch, confirmed once on the device
/// screen.
pub struct DeviceKeystore {
    device: Arc<Device>,
    keypaths: Arc<dyn KeypathLookup>,
}

impl DeviceKeystore {
    pub fn new(device: Arc<Device>, keypaths: Arc<dyn KeypathLookup>) -> DeviceKeystore {
        DeviceKeystore { device, keypaths }
    }
}

impl Keystore for DeviceKeystore {
    fn sign_transaction(
        &self,
        transaction: &mut ProposedTransaction,
        cosigner_index: usize,
    ) -> Result<(), SigningError> {
        let mut requests = Vec::with_capacity(transaction.num_inputs());
        for input_index in 0..transaction.num_inputs() {
            let script_hash = transaction.previous_output(input_index)?.script_hash.clone();
            let keypath = self
                .keypaths
                .keypath(&script_hash)
                .ok_or_else(|| SigningError::UnknownScriptHash(script_hash.clone()))?;
            let hash = transaction.signature_hash(input_index)?;
            requests.push(SignRequest { hash, keypath });
        }

        let signatures = self.device.sign_hashes(&requests).map_err(signing_error)?;
        if signatures.len() != requests.len() {
            return Err(SigningError::Communication(format!(
                "expected {} signatures from the device, got {}",
                requests.len(),
                signatures.len()
            )));
        }
        for (input_index, signature) in signatures.into_iter().enumerate() {
            transaction.add_signature(input_index, cosigner_index, signature)?;
        }
        Ok(())
    }
}
