//! Buffer module for measurements that have not been written yet.
//!
//! Measurements are kept oldest-first and flushed all-or-nothing: a flush
//! that fails part-way keeps every measurement, including those whose points
//! were already accepted. The next flush writes them again, so delivery is
//! at-least-once and relies on the database treating a repeated point
//! (same measurement, tags and timestamp) as an overwrite.

use tracing::debug;

use crate::client::{DbError, TimeSeriesClient};
use crate::measurement::Measurement;

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of measurements appended
    pub appended: u64,

    /// Total number of measurements removed by successful flushes
    pub flushed: u64,

    /// Number of flush attempts that failed
    pub failed_flushes: u64,
}

/// In-memory queue of unwritten measurements.
#[derive(Debug, Default)]
pub struct MeasurementBuffer {
    /// Pending measurements, oldest first
    measurements: Vec<Measurement>,

    /// Statistics about buffer operations
    stats: BufferStats,
}

impl MeasurementBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a measurement at the end of the buffer.
    pub fn append(&mut self, measurement: Measurement) {
        self.stats.appended += 1;
        self.measurements.push(measurement);
    }

    /// Write every buffered measurement, oldest first.
    ///
    /// Each measurement is written as one batch of two points (temperature
    /// and humidity) tagged with `location`. The buffer is cleared only when
    /// every write succeeded; on the first error it is left untouched and the
    /// error is returned. Returns the number of measurements flushed.
    pub async fn flush<C: TimeSeriesClient>(
        &mut self,
        client: &C,
        database: &str,
        location: &str,
    ) -> Result<usize, DbError> {
        for measurement in &self.measurements {
            let points = measurement.to_points(location);
            debug!(
                json = %serde_json::to_string(measurement).unwrap_or_default(),
                "Writing measurement"
            );

            if let Err(e) = client.write_points(database, &points).await {
                self.stats.failed_flushes += 1;
                return Err(e);
            }
        }

        let flushed = self.measurements.len();
        self.measurements.clear();
        self.stats.flushed += flushed as u64;

        if flushed > 0 {
            debug!(flushed = flushed, "Buffer flushed");
        }

        Ok(flushed)
    }

    /// Get the current number of measurements in the buffer.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Pending measurements, oldest first.
    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Get current buffer statistics.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
