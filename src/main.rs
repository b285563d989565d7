//! THLogger - temperature/humidity logger for InfluxDB
//!
//! Periodically reads a DHT11/DHT22/AM2302 sensor and writes the readings to
//! InfluxDB. Readings that cannot be written are kept in memory and retried
//! on the next cycle; a long database outage or write backlog restarts the
//! host's network.
//!
//! ## Usage
//!
//! ```bash
//! thlogger --config /etc/thlogger/thlogger.json
//!
//! # Take three readings and exit
//! thlogger --config thlogger.json --iterations 3
//! ```
//!
//! ## Logging
//!
//! The filter is taken from `RUST_LOG`, then `--log-filter`, then
//! `log_filter` in the configuration file, and defaults to `info`.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use thlogger::agent::{shutdown_channel, Agent, Interrupted, ShutdownHandle, StartupError};
use thlogger::client::InfluxClient;
use thlogger::config::{Config, SensorSource, DEFAULT_CONFIG_PATH};
use thlogger::connection::ConnectionManager;
use thlogger::remediation::SystemdRemediation;
use thlogger::sensor::{CommandSensor, Sensor, SimulatedSensor};

/// Default tracing filter
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "thlogger")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Log DHT sensor temperature and humidity to InfluxDB")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many readings (runs until interrupted by default)
    #[arg(short = 'n', long)]
    iterations: Option<u64>,

    /// Tracing filter used when RUST_LOG is not set (e.g. debug, thlogger=trace)
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config);

    let log_filter = cli
        .log_filter
        .clone()
        .or_else(|| config.as_ref().ok().and_then(|c| c.log_filter.clone()))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    init_tracing(&log_filter);

    info!("Starting THLogger...");

    let config = match config {
        Ok(config) => {
            info!(
                path = %cli.config.display(),
                influx_url = %config.influx_url(),
                database = %config.database,
                sleep_secs = config.sleep_between_readings.as_secs(),
                max_connection_retries = config.max_connection_retries,
                write_failure_threshold = ?config.write_failure_threshold,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sensor = match &config.sensor_source {
        SensorSource::Command(settings) => Sensor::Command(CommandSensor::new(settings.clone())),
        SensorSource::Simulated => {
            warn!("Using simulated sensor readings");
            Sensor::Simulated(SimulatedSensor::default())
        }
    };

    let client = match InfluxClient::new(&config) {
        Ok(client) => {
            info!(base_url = %client.base_url(), "InfluxDB client initialized");
            client
        }
        Err(e) => {
            error!(error = %e, "Failed to create InfluxDB client");
            std::process::exit(1);
        }
    };

    let remediation = SystemdRemediation::new(config.network_service.clone());
    let connection = ConnectionManager::new(
        client,
        config.database.clone(),
        config.max_connection_retries,
        remediation,
    );

    let (handle, shutdown) = shutdown_channel();
    tokio::spawn(forward_signals(handle));

    let mut agent = Agent::new(&config, sensor, connection, shutdown);

    match agent.connect().await {
        Ok(()) => {}
        Err(StartupError::Interrupted) => {
            info!("Shutdown signal received before connecting, stopping");
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to initialise InfluxDB connection");
            std::process::exit(1);
        }
    }

    info!("THLogger running. Press Ctrl+C to stop.");

    match agent.work(cli.iterations).await {
        Ok(()) => {}
        Err(Interrupted) => info!("Shutdown signal received, stopping..."),
    }

    let stats = agent.stats();
    let buffer_stats = agent.buffer().stats();
    info!(
        iterations = stats.iterations,
        failed_reads = stats.failed_reads,
        failed_writes = stats.failed_writes,
        backlog_remediations = stats.backlog_remediations,
        measurements = buffer_stats.appended,
        flushed = buffer_stats.flushed,
        failed_flushes = buffer_stats.failed_flushes,
        unflushed = agent.buffer().len(),
        "THLogger stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Trigger shutdown on SIGINT or SIGTERM.
async fn forward_signals(handle: ShutdownHandle) {
    wait_for_signal().await;
    handle.trigger();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "Failed to listen for SIGTERM");
            wait_for_ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
