//! Daemon around the Banyan wallet core: watches the signing devices
//! plugged in over USB-HID and exposes the wallet commands.

pub mod chain;
pub mod commands;
pub mod config;
pub mod device;
pub mod store;
pub mod usb;

#[cfg(test)]
pub(crate) mod testutils;

pub use banyan;
pub use miniscript;

use crate::{
    config::Config,
    device::Listener,
    usb::{HidEnumerator, Manager, ManagerMessage, UsbEnumerator, UsbError},
};

use std::{
    error, fmt,
    sync::{mpsc, Arc},
    thread,
};

#[cfg(not(test))]
use std::panic;
// A panic in any thread should stop the main thread, and print the panic.
#[cfg(not(test))]
pub fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info
            .location()
            .map(|l| l.file())
            .unwrap_or_else(|| "'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());

        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!(
            "panic occurred at line {} of file {}: {:?}\n{:?}",
            line,
            file,
            info,
            bt
        );
    }));
}

#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}-dev", self.major, self.minor)
    }
}

pub const VERSION: Version = Version { major: 0, minor: 1 };

#[derive(Debug)]
pub enum StartupError {
    Usb(UsbError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Usb(e) => write!(f, "Error setting up the USB-HID interface: '{}'.", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<UsbError> for StartupError {
    fn from(e: UsbError) -> Self {
        Self::Usb(e)
    }
}

/// The handle to a running Banyan daemon: a background thread watching the
/// connected signing devices and notifying the listener.
pub struct DaemonHandle {
    manager_sender: mpsc::SyncSender<ManagerMessage>,
    manager_handle: thread::JoinHandle<()>,
}

impl DaemonHandle {
    /// Start the daemon. A user of this interface should regularly poll the
    /// `is_alive` method to check for internal errors. To shut down the
    /// daemon use the `stop` method.
    ///
    /// The listener is notified of each device registration and removal.
    /// `initial_pin`, if set, is tried on each device right after its
    /// registration; the caller is in charge of sourcing it (typically from
    /// the environment, read once at startup).
    ///
    /// You may specify a custom USB enumerator through the `enumerator`
    /// parameter. If `None`, the default hidapi-backed enumerator is used.
    pub fn start(
        config: Config,
        enumerator: Option<Box<dyn UsbEnumerator>>,
        listener: Arc<dyn Listener>,
        initial_pin: Option<String>,
    ) -> Result<DaemonHandle, StartupError> {
        let enumerator = match enumerator {
            Some(enumerator) => enumerator,
            None => Box::new(HidEnumerator::new()?) as Box<dyn UsbEnumerator>,
        };
        let mut manager = Manager::new(enumerator, listener, initial_pin);

        // Start the device manager thread. Keep the thread handle to be able
        // to check if it crashed. Store a sender to be able to stop it.
        let (manager_sender, manager_receiver) = mpsc::sync_channel(0);
        let manager_handle = thread::Builder::new()
            .name("Device manager".to_string())
            .spawn({
                let poll_interval = config.device_poll_interval;
                move || {
                    log::info!("Device manager started.");
                    manager.poll_forever(poll_interval, manager_receiver);
                    log::info!("Device manager stopped.");
                }
            })
            .expect("Spawning the device manager thread must never fail.");

        Ok(DaemonHandle {
            manager_sender,
            manager_handle,
        })
    }

    /// Check whether the daemon is still up and running. This needs to be
    /// regularly polled to check for internal errors. If this returns
    /// `false`, the device manager thread died.
    pub fn is_alive(&self) -> bool {
        !self.manager_handle.is_finished()
    }

    /// Trigger an immediate device poll and wait for its completion.
    pub fn poll_now(&self) {
        let (sender, receiver) = mpsc::sync_channel(0);
        if self
            .manager_sender
            .send(ManagerMessage::PollNow(sender))
            .is_ok()
        {
            let _ = receiver.recv();
        }
    }

    /// Stop the daemon.
    pub fn stop(self) -> Result<(), Box<dyn error::Error>> {
        self.manager_sender
            .send(ManagerMessage::Shutdown)
            .expect("The other end should never have hung up before this.");
        self.manager_handle
            .join()
            .expect("Device manager thread must not panic");
        Ok(())
    }
}
