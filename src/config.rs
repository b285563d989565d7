//! Configuration module for the logger.
//!
//! Configuration is read once at startup from a JSON file. Unknown keys and
//! unknown sensor model codes are rejected, and every value is validated
//! before the agent is built. Host and credentials may be overridden from the
//! environment so secrets do not have to live in the file.

use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/thlogger/thlogger.json";

/// Default InfluxDB HTTP port
const DEFAULT_PORT: u16 = 8086;

/// Default sleep between readings in seconds
const DEFAULT_SLEEP_SECS: u64 = 60;

/// Minimum sleep between readings
const MIN_SLEEP_SECS: u64 = 1;

/// Maximum sleep between readings (one day)
const MAX_SLEEP_SECS: u64 = 86_400;

/// Default number of connection retries before the network is restarted
const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 5;

/// Default HTTP request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default network service restarted during remediation
const DEFAULT_NETWORK_SERVICE: &str = "networking";

/// Sensor helper defaults, matching the Adafruit `read_retry` behaviour.
const DEFAULT_READ_ATTEMPTS: u32 = 15;
const DEFAULT_READ_RETRY_DELAY_SECS: u64 = 2;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Supported DHT sensor models, identified in configuration by their
/// numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u16")]
pub enum SensorModel {
    Dht11,
    Dht22,
    Am2302,
}

impl SensorModel {
    /// Numeric code understood by the sensor helper.
    pub fn code(&self) -> u16 {
        match self {
            SensorModel::Dht11 => 11,
            SensorModel::Dht22 => 22,
            SensorModel::Am2302 => 2302,
        }
    }
}

impl TryFrom<u16> for SensorModel {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            11 => Ok(SensorModel::Dht11),
            22 => Ok(SensorModel::Dht22),
            2302 => Ok(SensorModel::Am2302),
            other => Err(format!(
                "unknown sensor model {} (expected 11, 22 or 2302)",
                other
            )),
        }
    }
}

impl fmt::Display for SensorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorModel::Dht11 => write!(f, "DHT11"),
            SensorModel::Dht22 => write!(f, "DHT22"),
            SensorModel::Am2302 => write!(f, "AM2302"),
        }
    }
}

/// Where readings come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorSource {
    /// Generated readings, for running without hardware
    Simulated,

    /// An external helper program that talks to the sensor
    Command(CommandSettings),
}

/// Settings for the external sensor helper.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSettings {
    /// Program to run
    pub program: String,

    /// Arguments placed before the model code and pin
    pub args: Vec<String>,

    /// How many times to run the helper before giving up on a reading
    pub read_attempts: u32,

    /// Pause between helper runs
    pub retry_delay: Duration,

    /// Upper bound on a single helper run
    pub timeout: Duration,
}

/// Validated configuration for the logger.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sensor model attached to the device
    pub sensor_model: SensorModel,

    /// GPIO pin the sensor is wired to
    pub sensor_pin: u32,

    /// InfluxDB host name or base URL
    pub host: String,

    /// InfluxDB HTTP port
    pub port: u16,

    /// Database the points are written to
    pub database: String,

    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,

    /// Value of the `location` tag on every point
    pub location: String,

    /// Fixed pause between loop iterations
    pub sleep_between_readings: Duration,

    /// Connection attempts tolerated before the network is restarted
    pub max_connection_retries: u32,

    /// Backlog size above which a failed write restarts the network
    pub write_failure_threshold: Option<usize>,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Default tracing filter when `RUST_LOG` is not set
    pub log_filter: Option<String>,

    /// Service restarted during network remediation
    pub network_service: String,

    pub sensor_source: SensorSource,
}

/// Error type for configuration loading failures.
///
/// Configuration errors are fatal: they abort startup and are never retried.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub key: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    fn for_key(key: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "Configuration error for {}: {}", key, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    sensor_model: SensorModel,
    sensor_pin: u32,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    database: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    token: Option<String>,
    location: String,
    #[serde(default = "default_sleep_secs")]
    sleep_between_readings_secs: u64,
    #[serde(default = "default_max_connection_retries")]
    max_connection_retries: u32,
    #[serde(default)]
    write_failure_threshold: Option<usize>,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default)]
    log_filter: Option<String>,
    #[serde(default = "default_network_service")]
    network_service: String,
    #[serde(default)]
    simulate_sensor: bool,
    #[serde(default)]
    sensor_command: Option<CommandFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandFile {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_read_attempts")]
    read_attempts: u32,
    #[serde(default = "default_read_retry_delay_secs")]
    retry_delay_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_sleep_secs() -> u64 {
    DEFAULT_SLEEP_SECS
}

fn default_max_connection_retries() -> u32 {
    DEFAULT_MAX_CONNECTION_RETRIES
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_network_service() -> String {
    DEFAULT_NETWORK_SERVICE.to_string()
}

fn default_read_attempts() -> u32 {
    DEFAULT_READ_ATTEMPTS
}

fn default_read_retry_delay_secs() -> u64 {
    DEFAULT_READ_RETRY_DELAY_SECS
}

fn default_read_timeout_secs() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

/// Checked both on the file values and after environment overrides.
fn validate_endpoint(host: &str, port: u16) -> Result<(), ConfigError> {
    if host.trim().is_empty() {
        return Err(ConfigError::for_key("host", "must not be empty"));
    }

    if port == 0 {
        return Err(ConfigError::for_key("port", "must be greater than 0"));
    }

    Ok(())
}

impl Config {
    /// Load configuration from a JSON file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, is not valid JSON,
    /// contains unknown keys, or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {}", path.display(), e))
        })?;

        Self::from_json(&contents)?.with_env_overrides()
    }

    /// Parse and validate configuration from a JSON document.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(contents)
            .map_err(|e| ConfigError::new(format!("invalid configuration file: {}", e)))?;

        Self::validate(file)
    }

    /// Override host, port and credentials from `THLOGGER_*` environment
    /// variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(host) = lookup("THLOGGER_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("THLOGGER_PORT") {
            self.port = port.parse().map_err(|_| {
                ConfigError::for_key(
                    "THLOGGER_PORT",
                    format!("'{}' is not a valid port", port),
                )
            })?;
        }

        if let Some(username) = lookup("THLOGGER_USERNAME") {
            self.username = Some(username);
        }

        if let Some(password) = lookup("THLOGGER_PASSWORD") {
            self.password = Some(password);
        }

        if let Some(token) = lookup("THLOGGER_TOKEN") {
            self.token = Some(token);
        }

        validate_endpoint(&self.host, self.port)?;
        Ok(self)
    }

    /// Base URL of the InfluxDB HTTP API.
    ///
    /// A host given with a scheme (`https://db.example`) is used as is, with
    /// the port appended.
    pub fn influx_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}:{}", host, self.port)
        } else {
            format!("http://{}:{}", host, self.port)
        }
    }

    fn validate(file: ConfigFile) -> Result<Self, ConfigError> {
        validate_endpoint(&file.host, file.port)?;

        if file.database.trim().is_empty() {
            return Err(ConfigError::for_key("database", "must not be empty"));
        }

        if file.location.trim().is_empty() {
            return Err(ConfigError::for_key("location", "must not be empty"));
        }

        if file.sleep_between_readings_secs < MIN_SLEEP_SECS {
            return Err(ConfigError::for_key(
                "sleep_between_readings_secs",
                format!(
                    "{} is below minimum ({}s)",
                    file.sleep_between_readings_secs, MIN_SLEEP_SECS
                ),
            ));
        }

        if file.sleep_between_readings_secs > MAX_SLEEP_SECS {
            return Err(ConfigError::for_key(
                "sleep_between_readings_secs",
                format!(
                    "{} exceeds maximum ({}s)",
                    file.sleep_between_readings_secs, MAX_SLEEP_SECS
                ),
            ));
        }

        if file.request_timeout_secs == 0 {
            return Err(ConfigError::for_key(
                "request_timeout_secs",
                "must be greater than 0",
            ));
        }

        if file.network_service.trim().is_empty() {
            return Err(ConfigError::for_key("network_service", "must not be empty"));
        }

        let sensor_source = match (file.simulate_sensor, file.sensor_command) {
            (true, None) => SensorSource::Simulated,
            (true, Some(_)) => {
                return Err(ConfigError::for_key(
                    "simulate_sensor",
                    "cannot be combined with sensor_command",
                ))
            }
            (false, Some(command)) => SensorSource::Command(Self::validate_command(command)?),
            (false, None) => {
                return Err(ConfigError::for_key(
                    "sensor_command",
                    "required unless simulate_sensor is true",
                ))
            }
        };

        Ok(Self {
            sensor_model: file.sensor_model,
            sensor_pin: file.sensor_pin,
            host: file.host,
            port: file.port,
            database: file.database,
            username: file.username,
            password: file.password,
            token: file.token,
            location: file.location,
            sleep_between_readings: Duration::from_secs(file.sleep_between_readings_secs),
            max_connection_retries: file.max_connection_retries,
            write_failure_threshold: file.write_failure_threshold,
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            log_filter: file.log_filter,
            network_service: file.network_service,
            sensor_source,
        })
    }

    fn validate_command(command: CommandFile) -> Result<CommandSettings, ConfigError> {
        if command.program.trim().is_empty() {
            return Err(ConfigError::for_key(
                "sensor_command.program",
                "must not be empty",
            ));
        }

        if command.read_attempts == 0 {
            return Err(ConfigError::for_key(
                "sensor_command.read_attempts",
                "must be greater than 0",
            ));
        }

        if command.timeout_secs == 0 {
            return Err(ConfigError::for_key(
                "sensor_command.timeout_secs",
                "must be greater than 0",
            ));
        }

        Ok(CommandSettings {
            program: command.program,
            args: command.args,
            read_attempts: command.read_attempts,
            retry_delay: Duration::from_secs(command.retry_delay_secs),
            timeout: Duration::from_secs(command.timeout_secs),
        })
    }
}

impl Default for Config {
    /// A configuration for a simulated sensor against a local InfluxDB.
    ///
    /// This is useful for testing.
    fn default() -> Self {
        Self {
            sensor_model: SensorModel::Dht22,
            sensor_pin: 4,
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: "thlogger".to_string(),
            username: None,
            password: None,
            token: None,
            location: "garage".to_string(),
            sleep_between_readings: Duration::from_secs(DEFAULT_SLEEP_SECS),
            max_connection_retries: DEFAULT_MAX_CONNECTION_RETRIES,
            write_failure_threshold: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            log_filter: None,
            network_service: DEFAULT_NETWORK_SERVICE.to_string(),
            sensor_source: SensorSource::Simulated,
        }
    }
}
