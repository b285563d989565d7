//! Sensor readers.
//!
//! A reader takes a sensor model and pin and returns a humidity/temperature
//! pair. Either value may be missing when the sensor did not answer; the
//! loop skips such readings.

use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::config::{CommandSettings, SensorModel};

/// A humidity/temperature pair, either of which may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reading {
    pub humidity: Option<i64>,
    pub temperature: Option<i64>,
}

impl Reading {
    pub fn new(humidity: Option<i64>, temperature: Option<i64>) -> Self {
        Self {
            humidity,
            temperature,
        }
    }

    /// A reading with both values present.
    pub fn complete(humidity: i64, temperature: i64) -> Self {
        Self::new(Some(humidity), Some(temperature))
    }

    /// `(humidity, temperature)` if both values are present.
    pub fn values(&self) -> Option<(i64, i64)> {
        Some((self.humidity?, self.temperature?))
    }
}

/// Errors from running the sensor helper.
#[derive(Debug)]
pub enum SensorError {
    /// The helper could not be started
    Spawn(std::io::Error),

    /// The helper did not finish in time
    Timeout(Duration),

    /// The helper exited unsuccessfully
    Exit { status: String, stderr: String },

    /// The helper printed something other than a reading
    Parse(String),
}

impl std::fmt::Display for SensorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorError::Spawn(e) => write!(f, "Failed to start sensor helper: {}", e),
            SensorError::Timeout(d) => write!(f, "Sensor helper timed out after {:?}", d),
            SensorError::Exit { status, stderr } => {
                write!(f, "Sensor helper failed ({}): {}", status, stderr.trim())
            }
            SensorError::Parse(e) => write!(f, "Invalid sensor helper output: {}", e),
        }
    }
}

impl std::error::Error for SensorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SensorError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Something that can take a reading from a physical sensor.
#[allow(async_fn_in_trait)]
pub trait SensorReader {
    async fn read(&self, model: SensorModel, pin: u32) -> Result<Reading, SensorError>;
}

/// Output printed by the sensor helper.
#[derive(Debug, Deserialize)]
struct HelperOutput {
    humidity: Option<f64>,
    temperature: Option<f64>,
}

/// Reads the sensor through an external helper program.
///
/// The helper is invoked as `program [args..] <model code> <pin>` and must
/// print `{"humidity": 48.2, "temperature": 21.9}` on stdout (`null` for a
/// value it could not read). Values are truncated to whole numbers.
///
/// DHT sensors often miss a reading, so the helper is run up to
/// `read_attempts` times with `retry_delay` between runs until both values
/// are present.
#[derive(Debug, Clone)]
pub struct CommandSensor {
    settings: CommandSettings,
}

impl CommandSensor {
    pub fn new(settings: CommandSettings) -> Self {
        Self { settings }
    }

    /// Run the helper once.
    async fn read_once(&self, model: SensorModel, pin: u32) -> Result<Reading, SensorError> {
        let mut command = Command::new(&self.settings.program);
        command
            .args(&self.settings.args)
            .arg(model.code().to_string())
            .arg(pin.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.settings.timeout, command.output())
            .await
            .map_err(|_| SensorError::Timeout(self.settings.timeout))?
            .map_err(SensorError::Spawn)?;

        if !output.status.success() {
            return Err(SensorError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        parse_helper_output(&output.stdout)
    }
}

impl SensorReader for CommandSensor {
    async fn read(&self, model: SensorModel, pin: u32) -> Result<Reading, SensorError> {
        let mut last = Ok(Reading::default());

        for attempt in 1..=self.settings.read_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.retry_delay).await;
            }

            last = self.read_once(model, pin).await;
            match &last {
                Ok(reading) if reading.values().is_some() => break,
                Ok(_) => debug!(attempt = attempt, "Incomplete sensor reading"),
                Err(e) => debug!(attempt = attempt, error = %e, "Sensor helper failed"),
            }
        }

        last
    }
}

fn parse_helper_output(stdout: &[u8]) -> Result<Reading, SensorError> {
    let output: HelperOutput =
        serde_json::from_slice(stdout).map_err(|e| SensorError::Parse(e.to_string()))?;

    Ok(Reading::new(
        output.humidity.map(|v| v as i64),
        output.temperature.map(|v| v as i64),
    ))
}

/// Generates plausible indoor readings, for running without hardware.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    /// Probability (0.0 - 1.0) that a reading comes back empty
    pub dropout_rate: f64,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self { dropout_rate: 0.05 }
    }
}

impl SensorReader for SimulatedSensor {
    async fn read(&self, model: SensorModel, _pin: u32) -> Result<Reading, SensorError> {
        let mut rng = rand::thread_rng();

        if rng.gen_bool(self.dropout_rate.clamp(0.0, 1.0)) {
            return Ok(Reading::default());
        }

        // DHT11 only covers 0-50C and 20-80%
        let (temperature, humidity) = match model {
            SensorModel::Dht11 => (rng.gen_range(15..=30), rng.gen_range(30..=70)),
            SensorModel::Dht22 | SensorModel::Am2302 => {
                (rng.gen_range(12..=32), rng.gen_range(20..=80))
            }
        };

        Ok(Reading::complete(humidity, temperature))
    }
}

/// The readers the binary can be configured with.
#[derive(Debug, Clone)]
pub enum Sensor {
    Command(CommandSensor),
    Simulated(SimulatedSensor),
}

impl SensorReader for Sensor {
    async fn read(&self, model: SensorModel, pin: u32) -> Result<Reading, SensorError> {
        match self {
            Sensor::Command(sensor) => sensor.read(model, pin).await,
            Sensor::Simulated(sensor) => sensor.read(model, pin).await,
        }
    }
}
