//! Mock USB collaborators for unit tests.

use crate::{
    device::{Device, DeviceError, Listener},
    usb::{DeviceInfo, UsbEnumerator, UsbError, UsbTransport},
};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use miniscript::bitcoin::hashes::Hash;

pub fn hash_from_byte<H: Hash<Bytes = [u8; 32]>>(byte: u8) -> H {
    H::from_byte_array([byte; 32])
}

#[derive(Default)]
struct MockTransportInner {
    writes: Vec<Vec<u8>>,
    reads: VecDeque<Vec<u8>>,
}

/// A scripted HID transport. Cloning shares the underlying state, so a test
/// can keep inspecting a transport handed over to a device.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Queue a response, chunked into input reports of `report_size` bytes.
    pub fn queue_json(&self, value: &serde_json::Value, report_size: usize) {
        let payload = value.to_string().into_bytes();
        let mut inner = self.inner.lock().unwrap();
        for chunk in payload.chunks(report_size) {
            inner.reads.push_back(chunk.to_vec());
        }
    }

    /// The raw output reports written so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// The written payload with report ids and trailing padding stripped.
    pub fn written_payload(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut payload: Vec<u8> = inner
            .writes
            .iter()
            .flat_map(|report| report[1..].iter().copied())
            .collect();
        let end = payload
            .iter()
            .rposition(|byte| *byte != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        payload.truncate(end);
        payload
    }
}

impl UsbTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_timeout(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize, UsbError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.reads.pop_front() {
            Some(chunk) => {
                buffer[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            // No scripted response: behave like a read timeout.
            None => Ok(0),
        }
    }
}

struct MockEnumeratorInner {
    infos: Vec<DeviceInfo>,
    empty_next: bool,
    enumerations: usize,
    transports: HashMap<String, MockTransport>,
}

/// A scripted USB enumerator. Cloning shares the underlying state.
#[derive(Clone)]
pub struct MockEnumerator {
    inner: Arc<Mutex<MockEnumeratorInner>>,
}

impl MockEnumerator {
    pub fn new(infos: Vec<DeviceInfo>) -> MockEnumerator {
        MockEnumerator {
            inner: Arc::new(Mutex::new(MockEnumeratorInner {
                infos,
                empty_next: false,
                enumerations: 0,
                transports: HashMap::new(),
            })),
        }
    }

    pub fn set_infos(&self, infos: Vec<DeviceInfo>) {
        self.inner.lock().unwrap().infos = infos;
    }

    /// Report no device on the next enumeration only, then `infos`.
    pub fn set_infos_once_empty(&self, infos: Vec<DeviceInfo>) {
        let mut inner = self.inner.lock().unwrap();
        inner.infos = infos;
        inner.empty_next = true;
    }

    pub fn enumeration_count(&self) -> usize {
        self.inner.lock().unwrap().enumerations
    }

    /// Use this transport for the device at `path` instead of a fresh one.
    pub fn set_transport(&self, path: &str, transport: MockTransport) {
        self.inner
            .lock()
            .unwrap()
            .transports
            .insert(path.to_string(), transport);
    }
}

impl UsbEnumerator for MockEnumerator {
    fn device_infos(&mut self) -> Vec<DeviceInfo> {
        let mut inner = self.inner.lock().unwrap();
        inner.enumerations += 1;
        if inner.empty_next {
            inner.empty_next = false;
            return Vec::new();
        }
        inner.infos.clone()
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn UsbTransport>, UsbError> {
        let mut inner = self.inner.lock().unwrap();
        let transport = inner
            .transports
            .entry(path.to_string())
            .or_insert_with(MockTransport::new)
            .clone();
        Ok(Box::new(transport))
    }
}

#[derive(Default)]
struct RecordingListenerInner {
    registered: Vec<String>,
    unregistered: Vec<String>,
    refuse: bool,
}

/// Records lifecycle callbacks, optionally refusing registrations.
#[derive(Default)]
pub struct RecordingListener {
    inner: Mutex<RecordingListenerInner>,
}

impl RecordingListener {
    pub fn new() -> RecordingListener {
        RecordingListener::default()
    }

    pub fn registered(&self) -> Vec<String> {
        self.inner.lock().unwrap().registered.clone()
    }

    pub fn unregistered(&self) -> Vec<String> {
        self.inner.lock().unwrap().unregistered.clone()
    }

    pub fn refuse_registrations(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse = refuse;
    }
}

impl Listener for RecordingListener {
    fn on_register(&self, device: &Arc<Device>) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse {
            return Err(DeviceError::UnexpectedResponse(
                "listener refused the device".to_string(),
            ));
        }
        inner.registered.push(device.id().to_string());
        Ok(())
    }

    fn on_unregister(&self, device_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .unregistered
            .push(device_id.to_string());
    }
}
