//! THLogger Library
//!
//! Components of a temperature/humidity logger that samples a DHT sensor,
//! buffers the readings and forwards them to InfluxDB, surviving sensor
//! glitches, database outages and dead network interfaces:
//!
//! - **config**: Typed configuration loaded from a JSON file
//! - **measurement**: Readings and their line protocol encoding
//! - **sensor**: Sensor readers (external helper or simulated)
//! - **client**: Time-series database client for InfluxDB
//! - **retry**: Retry helper with an explicit backoff schedule
//! - **remediation**: Network restart when connectivity is lost
//! - **connection**: Database session management with escalation
//! - **buffer**: All-or-nothing buffer of unwritten measurements
//! - **agent**: The acquisition-forward loop and shutdown signal
//!
//! # Example
//!
//! ```no_run
//! use thlogger::agent::{shutdown_channel, Agent};
//! use thlogger::client::InfluxClient;
//! use thlogger::config::Config;
//! use thlogger::connection::ConnectionManager;
//! use thlogger::remediation::SystemdRemediation;
//! use thlogger::sensor::SimulatedSensor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_file("thlogger.json").expect("Failed to load config");
//!
//!     let client = InfluxClient::new(&config).expect("Failed to create client");
//!     let remediation = SystemdRemediation::new(config.network_service.clone());
//!     let connection = ConnectionManager::new(
//!         client,
//!         config.database.clone(),
//!         config.max_connection_retries,
//!         remediation,
//!     );
//!
//!     let (_handle, shutdown) = shutdown_channel();
//!     let mut agent = Agent::new(&config, SimulatedSensor::default(), connection, shutdown);
//!
//!     agent.connect().await.expect("Failed to connect");
//!     agent.work(Some(10)).await.ok();
//! }
//! ```

// Module declarations
pub mod agent;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod measurement;
pub mod remediation;
pub mod retry;
pub mod sensor;

#[cfg(test)]
mod mock;

// Re-export commonly used types at crate root for convenience
pub use agent::{shutdown_channel, Agent, AgentStats, Interrupted, Shutdown, ShutdownHandle, StartupError};
pub use buffer::{BufferStats, MeasurementBuffer};
pub use client::{DbError, InfluxClient, TimeSeriesClient};
pub use config::{Config, ConfigError, SensorModel, SensorSource};
pub use connection::{ConnectionManager, Session};
pub use measurement::{Measurement, Point};
pub use remediation::{NetworkRemediation, SystemdRemediation};
pub use retry::Backoff;
pub use sensor::{CommandSensor, Reading, Sensor, SensorError, SensorReader, SimulatedSensor};
