//! The USB-HID signing device and its JSON dialogue.

pub mod keystore;

use crate::usb::communication::{Communication, CommunicationError};

use std::{error, fmt, sync::Arc};

use miniscript::bitcoin::secp256k1;
use serde_json::json;

/// Fixed product name of the devices we manage, part of their identifier.
pub const PRODUCT_NAME: &str = "bitbox";

// Firmware error codes we map to dedicated errors.
const ERR_TOUCH_ABORT: u64 = 600;
const ERR_DEVICE_LOCKED: u64 = 601;
const ERR_PIN_REQUIRED: u64 = 602;

/// Which mode the device is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    App,
    Bootloader,
}

#[derive(Debug)]
pub enum DeviceError {
    Communication(CommunicationError),
    /// The user declined the operation on the device.
    UserAborted,
    /// The device refuses the operation until it is unlocked.
    Locked,
    /// The device requires its PIN first.
    PinRequired,
    /// An error reported by the firmware.
    Firmware { code: u64, message: String },
    /// The device answered something we do not understand.
    UnexpectedResponse(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Communication(e) => write!(f, "{}", e),
            Self::UserAborted => write!(f, "Aborted by the user on the device."),
            Self::Locked => write!(f, "The device is locked."),
            Self::PinRequired => write!(f, "The device requires its PIN to be entered."),
            Self::Firmware { code, message } => {
                write!(f, "Device error {}: {}", code, message)
            }
            Self::UnexpectedResponse(details) => {
                write!(f, "Unexpected response from the device: {}", details)
            }
        }
    }
}

impl error::Error for DeviceError {}

impl From<CommunicationError> for DeviceError {
    fn from(e: CommunicationError) -> Self {
        Self::Communication(e)
    }
}

/// A request for the signature of one 32-byte hash with the key at a
/// keypath on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub hash: [u8; 32],
    pub keypath: String,
}

/// A signing device currently plugged in.
pub struct Device {
    id: String,
    product: Product,
    firmware_version: semver::Version,
    communication: Communication,
}

impl Device {
    pub fn new(
        id: String,
        product: Product,
        firmware_version: semver::Version,
        communication: Communication,
    ) -> Device {
        Device {
            id,
            product,
            firmware_version,
            communication,
        }
    }

    /// The identifier this device is keyed by in the registry.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub fn firmware_version(&self) -> &semver::Version {
        &self.firmware_version
    }

    pub fn communication(&self) -> &Communication {
        &self.communication
    }

    fn query(&self, command: serde_json::Value) -> Result<serde_json::Value, DeviceError> {
        let response = self.communication.query(&command)?;
        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(|c| c.as_u64()).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            return Err(match code {
                ERR_TOUCH_ABORT => DeviceError::UserAborted,
                ERR_DEVICE_LOCKED => DeviceError::Locked,
                ERR_PIN_REQUIRED => DeviceError::PinRequired,
                code => DeviceError::Firmware { code, message },
            });
        }
        Ok(response)
    }

    /// Check the device is responsive.
    pub fn ping(&self) -> Result<(), DeviceError> {
        self.query(json!({ "ping": "" }))?;
        Ok(())
    }

    /// Unlock the device with its PIN.
    pub fn login(&self, pin: &str) -> Result<(), DeviceError> {
        let response = self.query(json!({ "password": pin }))?;
        match response.get("password").and_then(|v| v.as_str()) {
            Some("success") => Ok(()),
            _ => Err(DeviceError::UnexpectedResponse(response.to_string())),
        }
    }

    /// Have the device sign a batch of hashes. The device first echoes the
    /// request back and displays it for confirmation on its screen, the
    /// second round returns one compact signature per request, in order.
    pub fn sign_hashes(
        &self,
        requests: &[SignRequest],
    ) -> Result<Vec<secp256k1::ecdsa::Signature>, DeviceError> {
        let data: Vec<serde_json::Value> = requests
            .iter()
            .map(|request| {
                json!({
                    "hash": hex::encode(request.hash),
                    "keypath": request.keypath,
                })
            })
            .collect();
        self.query(json!({ "sign": { "data": data } }))?;
        let response = self.query(json!({ "sign": "" }))?;

        let entries = response
            .get("sign")
            .and_then(|v| v.as_array())
            .ok_or_else(|| DeviceError::UnexpectedResponse(response.to_string()))?;
        if entries.len() != requests.len() {
            return Err(DeviceError::UnexpectedResponse(format!(
                "expected {} signatures, got {}",
                requests.len(),
                entries.len()
            )));
        }
        entries
            .iter()
            .map(|entry| {
                let signature_hex = entry
                    .get("sig")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| DeviceError::UnexpectedResponse(entry.to_string()))?;
                let signature = hex::decode(signature_hex)
                    .map_err(|e| DeviceError::UnexpectedResponse(e.to_string()))?;
                secp256k1::ecdsa::Signature::from_compact(&signature)
                    .map_err(|e| DeviceError::UnexpectedResponse(e.to_string()))
            })
            .collect()
    }

    /// Close the device's transport. Any further operation on it will fail.
    pub fn close(&self) {
        self.communication.close();
    }
}

/// Callbacks notified of the device lifecycle, registered once with the
/// manager.
pub trait Listener: Send + Sync {
    /// A device was plugged in and opened. Returning an error prevents its
    /// registration and closes its transport.
    fn on_register(&self, device: &Arc<Device>) -> Result<(), DeviceError>;

    /// The device with this identifier was unplugged.
    fn on_unregister(&self, device_id: &str);
}
