//! Daemon configuration.

use std::{error, fmt, fs, io, path::PathBuf, str::FromStr, time::Duration};

use serde::{de, Deserialize, Deserializer};

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// Static configuration of the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// What messages to log.
    #[serde(
        deserialize_with = "deserialize_fromstr",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// How often to check for inserted or removed signing devices.
    #[serde(
        rename = "device_poll_interval_secs",
        deserialize_with = "deserialize_duration",
        default = "default_poll_interval"
    )]
    pub device_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_level: default_loglevel(),
            device_poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound(PathBuf),
    ReadingFile(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FileNotFound(path) => {
                write!(f, "Configuration file not found at '{}'.", path.display())
            }
            Self::ReadingFile(e) => write!(f, "Error reading configuration file: {}", e),
        }
    }
}

impl error::Error for ConfigError {}

impl Config {
    /// Get the configuration from a file, defaulting to 'banyand.toml' in
    /// the working directory.
    pub fn from_file(path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let path = path.unwrap_or_else(|| PathBuf::from("banyand.toml"));
        let contents = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::FileNotFound(path.clone()),
            _ => ConfigError::ReadingFile(e.to_string()),
        })?;
        toml::from_slice(&contents).map_err(|e| ConfigError::ReadingFile(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parsing() {
        let config: Config = toml::from_str(
            r#"
            log_level = "debug"
            device_poll_interval_secs = 5
            "#,
        )
        .expect("valid config");
        assert_eq!(config.log_level, log::LevelFilter::Debug);
        assert_eq!(config.device_poll_interval, Duration::from_secs(5));

        // Every field has a default.
        let config: Config = toml::from_str("").expect("empty config");
        assert_eq!(config.log_level, log::LevelFilter::Info);
        assert_eq!(config.device_poll_interval, Duration::from_secs(1));

        toml::from_str::<Config>("log_level = \"noisy\"").expect_err("not a log level");
    }
}
