use std::{env, path::PathBuf, process, sync::Arc, thread, time};

use banyand::{
    config::{Config, ConfigError},
    device::{Device, DeviceError, Listener},
    DaemonHandle, VERSION,
};

fn print_help_exit(code: i32) {
    eprintln!("banyand version {}", VERSION);
    eprintln!("A TOML configuration file may be provided with '--conf <config file path>'. By default banyand looks for a 'banyand.toml' file in its working directory.");
    eprintln!("If the BITBOX_PIN environment variable is set, newly plugged devices are unlocked with it.");
    process::exit(code);
}

fn print_version() {
    eprintln!("{}", VERSION);
    process::exit(0);
}

fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args[1] == "--help" || args[1] == "-h" {
        print_help_exit(0)
    } else if args[1] == "--version" || args[1] == "-v" {
        print_version()
    } else if args[1] != "--conf" {
        eprintln!("Only a single command line argument is supported: --conf. All other configuration parameters must be specified in the configuration file.");
        print_help_exit(1);
    }

    if args.len() != 3 {
        print_help_exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][thread {}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                thread::current().name().unwrap_or("unnamed"),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;

    Ok(())
}

// Log the device lifecycle and sanity check newly plugged devices.
struct LoggingListener;

impl Listener for LoggingListener {
    fn on_register(&self, device: &Arc<Device>) -> Result<(), DeviceError> {
        device.ping()?;
        log::info!(
            "Device {} registered: {:?} firmware {}.",
            device.id(),
            device.product(),
            device.firmware_version()
        );
        Ok(())
    }

    fn on_unregister(&self, device_id: &str) {
        log::info!("Device {} was removed.", device_id);
    }
}

fn main() {
    let args = env::args().collect();
    let conf_file = parse_args(args);

    let config = match conf_file {
        // A missing explicit config file is an error, no config file at the
        // default location means defaults.
        Some(path) => Config::from_file(Some(path)).unwrap_or_else(|e| {
            eprintln!("Error parsing config: {}", e);
            process::exit(1);
        }),
        None => match Config::from_file(None) {
            Ok(config) => config,
            Err(ConfigError::FileNotFound(..)) => Config::default(),
            Err(e) => {
                eprintln!("Error parsing config: {}", e);
                process::exit(1);
            }
        },
    };
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });
    banyand::setup_panic_hook();

    // The device manager takes the PIN as an explicit parameter: the
    // environment is consulted only here, once.
    let initial_pin = env::var("BITBOX_PIN").ok().filter(|pin| !pin.is_empty());

    let daemon = DaemonHandle::start(config, None, Arc::new(LoggingListener), initial_pin)
        .unwrap_or_else(|e| {
            log::error!("Error starting daemon: {}", e);
            process::exit(1);
        });
    log::info!("banyand version {} started.", VERSION);

    while daemon.is_alive() {
        thread::sleep(time::Duration::from_millis(500));
    }
    log::error!("The device manager thread exited unexpectedly.");
    process::exit(1);
}
