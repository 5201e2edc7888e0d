//! Framed JSON exchanges with a signing device over HID reports.

use crate::usb::{UsbError, UsbTransport};

use std::{error, fmt, sync::Mutex, time::Duration};

// How long to wait for each input report before giving up on a response.
const READ_TIMEOUT: Duration = Duration::from_secs(30);
// Cap on the size of a device response.
const MAX_RESPONSE_SIZE: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub enum CommunicationError {
    Usb(UsbError),
    /// The device did not answer within the read timeout.
    Timeout,
    /// The transport was closed, the device is gone.
    Closed,
    InvalidResponse(String),
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Usb(e) => write!(f, "USB transport error: {}", e),
            Self::Timeout => write!(f, "Timed out waiting for the device response."),
            Self::Closed => write!(f, "The device transport was closed."),
            Self::InvalidResponse(details) => {
                write!(f, "Invalid response from the device: {}", details)
            }
        }
    }
}

impl error::Error for CommunicationError {}

impl From<UsbError> for CommunicationError {
    fn from(e: UsbError) -> Self {
        Self::Usb(e)
    }
}

/// A JSON request/response channel over HID reports of fixed sizes.
///
/// The transport lock is held for the whole exchange: there is at most one
/// in-flight exchange per device at any time, and requests from concurrent
/// signing flows are strictly serialized.
pub struct Communication {
    transport: Mutex<Option<Box<dyn UsbTransport>>>,
    write_report_size: usize,
    read_report_size: usize,
}

impl Communication {
    pub fn new(
        transport: Box<dyn UsbTransport>,
        write_report_size: usize,
        read_report_size: usize,
    ) -> Communication {
        Communication {
            transport: Mutex::new(Some(transport)),
            write_report_size,
            read_report_size,
        }
    }

    pub fn write_report_size(&self) -> usize {
        self.write_report_size
    }

    pub fn read_report_size(&self) -> usize {
        self.read_report_size
    }

    /// Send a JSON command to the device and wait for its JSON response.
    pub fn query(
        &self,
        command: &serde_json::Value,
    ) -> Result<serde_json::Value, CommunicationError> {
        let mut guard = self
            .transport
            .lock()
            .expect("transport lock must not be poisoned");
        let transport = guard.as_mut().ok_or(CommunicationError::Closed)?;

        // Send the payload chunked into zero-padded output reports, each
        // prefixed with the zero report id.
        let message = command.to_string();
        for chunk in message.as_bytes().chunks(self.write_report_size) {
            let mut report = vec![0u8; self.write_report_size + 1];
            report[1..1 + chunk.len()].copy_from_slice(chunk);
            transport.write(&report)?;
        }

        // Accumulate input reports until the response parses as a complete
        // JSON value. The device zero-pads its last report.
        let mut response = Vec::new();
        loop {
            let mut report = vec![0u8; self.read_report_size];
            let read = transport.read_timeout(&mut report, READ_TIMEOUT)?;
            if read == 0 {
                return Err(CommunicationError::Timeout);
            }
            response.extend_from_slice(&report[..read]);
            let end = response
                .iter()
                .rposition(|byte| *byte != 0)
                .map(|pos| pos + 1)
                .unwrap_or(0);
            if let Ok(value) = serde_json::from_slice(&response[..end]) {
                return Ok(value);
            }
            if response.len() > MAX_RESPONSE_SIZE {
                return Err(CommunicationError::InvalidResponse(
                    "response too large".to_string(),
                ));
            }
        }
    }

    /// Close the underlying transport. Done exactly once, when the device is
    /// removed or its registration failed. Subsequent queries fail with
    /// `Closed`.
    pub fn close(&self) {
        self.transport
            .lock()
            .expect("transport lock must not be poisoned")
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockTransport;

    use serde_json::json;

    #[test]
    fn query_roundtrip() {
        let transport = MockTransport::new();
        transport.queue_json(&json!({"ping": "password"}), 64);
        let communication = Communication::new(Box::new(transport.clone()), 64, 64);

        let response = communication.query(&json!({"ping": ""})).unwrap();
        assert_eq!(response, json!({"ping": "password"}));

        // A single zero-padded report of the report size plus the report id,
        // carrying the serialized command.
        let writes = transport.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 65);
        assert_eq!(writes[0][0], 0);
        assert!(writes[0][1..].starts_with(br#"{"ping":""}"#));
    }

    #[test]
    fn chunked_write_and_read() {
        let transport = MockTransport::new();
        // A response spanning several 16-byte input reports.
        let long_value: String = std::iter::repeat('x').take(50).collect();
        transport.queue_json(&json!({ "echo": long_value.clone() }), 16);
        let communication = Communication::new(Box::new(transport.clone()), 16, 16);

        let command = json!({"command": "a somewhat long command payload"});
        let response = communication.query(&command).unwrap();
        assert_eq!(response, json!({ "echo": long_value }));

        // The command did not fit a single report.
        let writes = transport.writes();
        assert!(writes.len() > 1);
        assert!(writes.iter().all(|report| report.len() == 17));
        let payload: Vec<u8> = writes
            .iter()
            .flat_map(|report| report[1..].iter().copied())
            .take_while(|byte| *byte != 0)
            .collect();
        assert_eq!(payload, command.to_string().into_bytes());
    }

    #[test]
    fn timeout_on_silent_device() {
        let transport = MockTransport::new();
        let communication = Communication::new(Box::new(transport), 64, 64);
        assert!(matches!(
            communication.query(&json!({"ping": ""})),
            Err(CommunicationError::Timeout)
        ));
    }

    #[test]
    fn closed_transport() {
        let transport = MockTransport::new();
        transport.queue_json(&json!({}), 64);
        let communication = Communication::new(Box::new(transport), 64, 64);
        communication.close();
        assert!(matches!(
            communication.query(&json!({"ping": ""})),
            Err(CommunicationError::Closed)
        ));
    }
}
