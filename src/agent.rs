//! The acquisition-forward loop.
//!
//! Every iteration reads the sensor, appends the measurement to the buffer,
//! tries to flush the buffer, and sleeps. Sensor and write failures are
//! logged and the loop carries on. A write backlog larger than the configured
//! threshold restarts the network.
//!
//! Shutdown is delivered out-of-band through a [`Shutdown`] signal rather
//! than as an error: the in-flight iteration is dropped where it stands and
//! [`Agent::work`] returns [`Interrupted`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::buffer::MeasurementBuffer;
use crate::client::{DbError, TimeSeriesClient};
use crate::config::{Config, SensorModel};
use crate::connection::ConnectionManager;
use crate::measurement::Measurement;
use crate::remediation::NetworkRemediation;
use crate::sensor::SensorReader;

/// Returned when the loop was stopped by a shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Interrupted by shutdown signal")
    }
}

impl std::error::Error for Interrupted {}

/// Errors that abort startup.
#[derive(Debug)]
pub enum StartupError {
    /// Shutdown was requested while connecting
    Interrupted,

    /// The database rejected the initial connection
    Database(DbError),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Interrupted => write!(f, "{}", Interrupted),
            StartupError::Database(e) => write!(f, "Failed to initialise database: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Database(e) => Some(e),
            StartupError::Interrupted => None,
        }
    }
}

/// Triggers a [`Shutdown`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolves once the paired [`ShutdownHandle`] has been triggered.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Wait for the shutdown signal.
    ///
    /// If every handle is dropped without triggering, this never resolves.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Create a connected shutdown handle and signal.
pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, Shutdown { rx })
}

/// Counters for the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentStats {
    /// Completed iterations
    pub iterations: u64,

    /// Iterations without a usable reading
    pub failed_reads: u64,

    /// Iterations whose flush failed
    pub failed_writes: u64,

    /// Network restarts triggered by the write backlog
    pub backlog_remediations: u64,
}

/// Reads the sensor and forwards measurements to the database.
pub struct Agent<S, C, R> {
    sensor: S,
    connection: ConnectionManager<C, R>,
    buffer: MeasurementBuffer,
    sensor_model: SensorModel,
    sensor_pin: u32,
    location: String,
    sleep_between_readings: Duration,
    write_failure_threshold: Option<usize>,
    shutdown: Shutdown,
    stats: AgentStats,
}

impl<S, C, R> Agent<S, C, R>
where
    S: SensorReader,
    C: TimeSeriesClient,
    R: NetworkRemediation,
{
    pub fn new(
        config: &Config,
        sensor: S,
        connection: ConnectionManager<C, R>,
        shutdown: Shutdown,
    ) -> Self {
        info!(sensor_model = %config.sensor_model, "Init sensor model");
        info!(sensor_pin = config.sensor_pin, "Using pin");
        info!(location = %config.location, "Location");

        Self {
            sensor,
            connection,
            buffer: MeasurementBuffer::new(),
            sensor_model: config.sensor_model,
            sensor_pin: config.sensor_pin,
            location: config.location.clone(),
            sleep_between_readings: config.sleep_between_readings,
            write_failure_threshold: config.write_failure_threshold,
            shutdown,
            stats: AgentStats::default(),
        }
    }

    /// Connect to the database before the loop starts.
    ///
    /// Waits for an unreachable server indefinitely; only a rejected
    /// connection or a shutdown signal ends the wait.
    pub async fn connect(&mut self) -> Result<(), StartupError> {
        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(StartupError::Interrupted),
            result = self.connection.ensure_connection() => {
                result.map_err(StartupError::Database)?;
                info!(database = %self.connection.database(), "Init InfluxDB connection");
                Ok(())
            }
        }
    }

    /// Run the loop.
    ///
    /// With `max_iterations` set, returns `Ok(())` after that many
    /// iterations; otherwise runs until shutdown. A shutdown signal ends the
    /// loop at once, without finishing the current flush, and returns
    /// `Err(Interrupted)`.
    pub async fn work(&mut self, max_iterations: Option<u64>) -> Result<(), Interrupted> {
        let mut shutdown = self.shutdown.clone();
        let mut iterations: u64 = 0;

        while max_iterations.map_or(true, |max| iterations < max) {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(Interrupted),
                _ = self.iterate() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(Interrupted),
                _ = tokio::time::sleep(self.sleep_between_readings) => {}
            }

            iterations += 1;
            self.stats.iterations += 1;
        }

        info!(iterations = iterations, "Iteration budget exhausted");
        Ok(())
    }

    /// One pass of acquire, buffer and write.
    async fn iterate(&mut self) {
        let Some(measurement) = self.acquire().await else {
            self.stats.failed_reads += 1;
            return;
        };

        self.buffer.append(measurement);
        info!(
            "Temp: {} C, hum: {} %",
            measurement.temperature, measurement.humidity
        );

        if let Err(e) = self.forward().await {
            self.stats.failed_writes += 1;
            error!(
                error = %e,
                backlog = self.buffer.len(),
                "Failed to write measurements"
            );

            if e.is_connectivity() {
                self.connection.invalidate();
            }

            if let Some(threshold) = self.write_failure_threshold {
                if self.buffer.len() > threshold {
                    warn!(
                        backlog = self.buffer.len(),
                        threshold = threshold,
                        "Write backlog above threshold, restarting network"
                    );
                    self.stats.backlog_remediations += 1;
                    self.connection.remediation().remediate();
                }
            }
        }
    }

    async fn acquire(&self) -> Option<Measurement> {
        match self.sensor.read(self.sensor_model, self.sensor_pin).await {
            Ok(reading) => match reading.values() {
                Some((humidity, temperature)) => Some(Measurement::new(temperature, humidity)),
                None => {
                    warn!("Failed to get a reading");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to get a reading");
                None
            }
        }
    }

    async fn forward(&mut self) -> Result<usize, DbError> {
        self.connection.ensure_connection().await?;
        self.buffer
            .flush(
                self.connection.client(),
                self.connection.database(),
                &self.location,
            )
            .await
    }

    pub fn buffer(&self) -> &MeasurementBuffer {
        &self.buffer
    }

    pub fn connection(&self) -> &ConnectionManager<C, R> {
        &self.connection
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }
}
