//! Measurement data types and their InfluxDB line protocol encoding.
//!
//! A [`Measurement`] is one successful sensor reading. When it is flushed it
//! becomes two [`Point`]s (temperature and humidity) that share its timestamp.
//!
//! Line protocol format:
//! ```text
//! measurement,location=garage value=21i 1700000000000000000
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Measurement name used for temperature points.
pub const TEMPERATURE: &str = "temperature";

/// Measurement name used for humidity points.
pub const HUMIDITY: &str = "humidity";

/// A single temperature/humidity reading taken at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Measurement {
    /// UTC instant at which the reading was taken
    pub timestamp: DateTime<Utc>,

    /// Temperature in degrees Celsius
    pub temperature: i64,

    /// Relative humidity in percent
    pub humidity: i64,
}

impl Measurement {
    /// Create a measurement stamped with the current UTC time.
    pub fn new(temperature: i64, humidity: i64) -> Self {
        Self::at(Utc::now(), temperature, humidity)
    }

    /// Create a measurement with an explicit timestamp.
    pub fn at(timestamp: DateTime<Utc>, temperature: i64, humidity: i64) -> Self {
        Self {
            timestamp,
            temperature,
            humidity,
        }
    }

    /// Expand into the two points written to the database.
    pub fn to_points(&self, location: &str) -> [Point; 2] {
        [
            Point::new(TEMPERATURE, location, self.temperature, self.timestamp),
            Point::new(HUMIDITY, location, self.humidity, self.timestamp),
        ]
    }
}

/// A tagged, timestamped numeric point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Point {
    pub measurement: &'static str,
    pub location: String,
    pub value: i64,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(
        measurement: &'static str,
        location: impl Into<String>,
        value: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            measurement,
            location: location.into(),
            value,
            timestamp,
        }
    }

    /// Encode the point as a single line of InfluxDB line protocol.
    ///
    /// The value is written as an integer field (`i` suffix) and the timestamp
    /// in nanoseconds since the Unix epoch.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(self.measurement);
        line.push_str(",location=");
        line.push_str(&escape_tag(&self.location));
        line.push_str(" value=");
        line.push_str(&self.value.to_string());
        line.push('i');

        // Out-of-range instants (beyond year 2262) are written without a
        // timestamp and get the server's receive time.
        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }

        line
    }
}

/// Join points into a line protocol request body.
pub fn encode_points(points: &[Point]) -> String {
    points
        .iter()
        .map(Point::to_line_protocol)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Spaces and commas must be escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Commas, equals signs and spaces must be escaped in tag values.
fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
