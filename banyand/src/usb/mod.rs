//! Enumeration of the signing devices plugged in over USB-HID, and the
//! manager keeping the registry of them.

pub mod communication;

use crate::device::{Device, DeviceError, Listener, Product, PRODUCT_NAME};
use communication::Communication;

use std::{
    collections::HashMap,
    error, fmt,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

pub const VENDOR_ID: u16 = 0x03eb;
pub const PRODUCT_ID: u16 = 0x2402;

// The HID interface the device talks on, or the usage page on platforms
// reporting it that way.
const HID_INTERFACE: i32 = 0;
const HID_USAGE_PAGE: u16 = 0xffff;

// Bootloaders report one of these product strings.
const BOOTLOADER_PRODUCT_NAMES: [&str; 2] = ["bootloader", "Digital Bitbox bootloader"];

// A device is considered removed only when absent from this many
// enumerations in a row: on some platforms enumeration comes up empty for a
// very short time while the device is still plugged in.
const REMOVAL_CHECKS: usize = 5;
const REMOVAL_CHECK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct UsbError(pub String);

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for UsbError {}

/// An enumerated HID entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub serial: String,
    pub product: String,
    pub interface: i32,
    pub usage_page: u16,
}

/// Enumeration of, and access to, the HID devices of this machine.
pub trait UsbEnumerator: Send {
    /// All HID entries matching our vendor and product identifiers.
    fn device_infos(&mut self) -> Vec<DeviceInfo>;

    /// Open the HID transport behind this path.
    fn open(&mut self, path: &str) -> Result<Box<dyn UsbTransport>, UsbError>;
}

/// A raw HID transport.
pub trait UsbTransport: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError>;

    /// Read one input report, waiting at most `timeout`. Returns 0 on
    /// timeout.
    fn read_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UsbError>;
}

/// The hidapi-backed [UsbEnumerator].
pub struct HidEnumerator {
    api: hidapi::HidApi,
}

impl HidEnumerator {
    pub fn new() -> Result<HidEnumerator, UsbError> {
        hidapi::HidApi::new()
            .map(|api| HidEnumerator { api })
            .map_err(|e| UsbError(e.to_string()))
    }
}

impl UsbEnumerator for HidEnumerator {
    fn device_infos(&mut self) -> Vec<DeviceInfo> {
        if let Err(e) = self.api.refresh_devices() {
            log::error!("Error refreshing the HID device list: {}.", e);
        }
        self.api
            .device_list()
            .filter(|info| info.vendor_id() == VENDOR_ID && info.product_id() == PRODUCT_ID)
            .map(|info| DeviceInfo {
                path: info.path().to_string_lossy().into_owned(),
                serial: info.serial_number().unwrap_or("").to_string(),
                product: info.product_string().unwrap_or("").to_string(),
                interface: info.interface_number(),
                usage_page: info.usage_page(),
            })
            .collect()
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn UsbTransport>, UsbError> {
        let path = std::ffi::CString::new(path).map_err(|e| UsbError(e.to_string()))?;
        self.api
            .open_path(&path)
            .map(|device| Box::new(HidTransport { device }) as Box<dyn UsbTransport>)
            .map_err(|e| UsbError(e.to_string()))
    }
}

struct HidTransport {
    device: hidapi::HidDevice,
}

impl UsbTransport for HidTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, UsbError> {
        self.device.write(data).map_err(|e| UsbError(e.to_string()))
    }

    fn read_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.device
            .read_timeout(buffer, timeout.as_millis() as i32)
            .map_err(|e| UsbError(e.to_string()))
    }
}

// Whether this enumerated entry is a device we manage. Entries with an empty
// serial or product are skipped: enumerating too quickly after an insertion
// returns entries whose input report is not ready yet.
fn usable_device_info(info: &DeviceInfo) -> bool {
    (info.interface == HID_INTERFACE || info.usage_page == HID_USAGE_PAGE)
        && !info.serial.is_empty()
        && !info.product.is_empty()
}

/// The identifier a device is keyed by in the registry.
pub fn device_identifier(product_name: &str, path: &str) -> String {
    hex::encode(format!("{}{}", product_name, path))
}

// The firmware version is embedded in the serial string as
// "v<major>.<minor>.<patch>".
fn firmware_version(serial: &str) -> Option<semver::Version> {
    serial.split('v').skip(1).find_map(|candidate| {
        let end = candidate
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(candidate.len());
        semver::Version::parse(&candidate[..end]).ok()
    })
}

// Bootloaders before 3.0.0 predate the switch to composite USB and use the
// legacy report lengths.
fn report_sizes(product: Product, firmware_version: &semver::Version) -> (usize, usize) {
    if product == Product::Bootloader && *firmware_version < semver::Version::new(3, 0, 0) {
        (4098, 256)
    } else {
        (64, 64)
    }
}

#[derive(Debug)]
pub enum RegistrationError {
    /// The serial string does not contain a firmware version.
    MalformedSerial(String),
    Usb(UsbError),
    /// The on-register callback refused the device.
    Callback(DeviceError),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MalformedSerial(serial) => {
                write!(f, "Could not find the firmware version in '{}'.", serial)
            }
            Self::Usb(e) => write!(f, "Failed to open the device: {}.", e),
            Self::Callback(e) => write!(f, "Failed to execute on-register: {}.", e),
        }
    }
}

impl error::Error for RegistrationError {}

#[derive(Debug)]
pub enum ManagerMessage {
    Shutdown,
    /// Ask the manager to poll immediately, get notified through the passed
    /// channel once it's done.
    PollNow(mpsc::SyncSender<()>),
}

/// Keeps the registry of the devices currently plugged in, notifying the
/// listener of registrations and removals. The registry is owned by the
/// thread running the poll loop: all its mutations happen there.
pub struct Manager {
    devices: HashMap<String, Arc<Device>>,
    enumerator: Box<dyn UsbEnumerator>,
    listener: Arc<dyn Listener>,
    initial_pin: Option<String>,
}

impl Manager {
    /// Create a new manager. The listener is called on each registration and
    /// removal. `initial_pin`, if set, is tried on each newly registered
    /// device; a failed login is logged but does not prevent the
    /// registration.
    pub fn new(
        enumerator: Box<dyn UsbEnumerator>,
        listener: Arc<dyn Listener>,
        initial_pin: Option<String>,
    ) -> Manager {
        Manager {
            devices: HashMap::new(),
            enumerator,
            listener,
            initial_pin,
        }
    }

    fn device_infos(&mut self) -> Vec<DeviceInfo> {
        self.enumerator
            .device_infos()
            .into_iter()
            .filter(usable_device_info)
            .collect()
    }

    fn register(&mut self, info: &DeviceInfo) -> Result<(), RegistrationError> {
        let device_id = device_identifier(PRODUCT_NAME, &info.path);
        // Skip if already registered.
        if self.devices.contains_key(&device_id) {
            return Ok(());
        }
        log::info!("Registering device {}.", device_id);

        let product = if BOOTLOADER_PRODUCT_NAMES.contains(&info.product.as_str()) {
            Product::Bootloader
        } else {
            Product::App
        };
        let firmware_version = firmware_version(&info.serial).ok_or_else(|| {
            log::error!("Serial number '{}' is malformed.", info.serial);
            RegistrationError::MalformedSerial(info.serial.clone())
        })?;

        let transport = self
            .enumerator
            .open(&info.path)
            .map_err(RegistrationError::Usb)?;
        let (write_report_size, read_report_size) = report_sizes(product, &firmware_version);
        log::info!(
            "write report size {}, read report size {}",
            write_report_size,
            read_report_size
        );
        let device = Arc::new(Device::new(
            device_id.clone(),
            product,
            firmware_version,
            Communication::new(transport, write_report_size, read_report_size),
        ));

        if let Err(e) = self.listener.on_register(&device) {
            device.close();
            return Err(RegistrationError::Callback(e));
        }
        self.devices.insert(device_id, device.clone());

        if let Some(pin) = &self.initial_pin {
            match device.login(pin) {
                Ok(()) => log::info!("Successfully unlocked the device with the configured PIN."),
                Err(e) => log::error!("Failed to unlock the device with the configured PIN: {}.", e),
            }
        }
        Ok(())
    }

    // Whether a device that was plugged in is not plugged in anymore. The
    // enumeration is retried a few times before concluding to a removal.
    fn check_if_removed(&mut self, device_id: &str) -> bool {
        for _ in 0..REMOVAL_CHECKS {
            if self
                .device_infos()
                .iter()
                .any(|info| device_identifier(PRODUCT_NAME, &info.path) == device_id)
            {
                return false;
            }
            thread::sleep(REMOVAL_CHECK_INTERVAL);
        }
        true
    }

    /// One pass over the registry: process removals, then registrations from
    /// a fresh enumeration. Registration failures are logged and retried on
    /// the next pass.
    pub fn poll_once(&mut self) {
        let known: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in known {
            if self.check_if_removed(&device_id) {
                if let Some(device) = self.devices.remove(&device_id) {
                    device.close();
                }
                self.listener.on_unregister(&device_id);
                log::info!("Unregistered device {}.", device_id);
            }
        }

        for info in self.device_infos() {
            if let Err(e) = self.register(&info) {
                log::error!("Failed to register device: {}", e);
            }
        }
    }

    /// The currently registered device identifiers.
    pub fn registered_device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// A handle on a registered device.
    pub fn registered_device(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).cloned()
    }

    /// Continuously watch for device insertions and removals.
    /// - `poll_interval`: how frequently to check the connected devices.
    /// - `receiver`: send a `Shutdown` message to make this function return.
    ///
    /// Typically this would run for the whole duration of the program in a
    /// thread.
    pub fn poll_forever(
        &mut self,
        poll_interval: Duration,
        receiver: mpsc::Receiver<ManagerMessage>,
    ) {
        let mut last_poll = None;

        loop {
            // How long to wait before the next poll.
            let time_before_poll = if let Some(last_poll) = last_poll {
                let time_since_poll = Instant::now().duration_since(last_poll);
                poll_interval.saturating_sub(time_since_poll)
            } else {
                // Don't wait before doing the first poll.
                Duration::ZERO
            };

            // Wait for the duration of the interval between polls, but
            // listen to messages in the meantime.
            match receiver.recv_timeout(time_before_poll) {
                Ok(ManagerMessage::Shutdown) => {
                    log::info!("Device manager was told to shut down.");
                    return;
                }
                Ok(ManagerMessage::PollNow(sender)) => {
                    last_poll = Some(Instant::now());
                    self.poll_once();
                    if let Err(e) = sender.send(()) {
                        log::error!("Error sending immediate poll completion signal: {}.", e);
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // It's been long enough since the last poll.
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::error!("Device manager communication channel got disconnected. Exiting.");
                    return;
                }
            }
            last_poll = Some(Instant::now());

            self.poll_once();
        }
    }
}
