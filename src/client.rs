//! Time-series database client.
//!
//! [`TimeSeriesClient`] is the capability the connection manager and the
//! buffer depend on. [`InfluxClient`] implements it over the InfluxDB 1.x
//! HTTP API (also served by InfluxDB 2.x compatibility endpoints).

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::Config;
use crate::measurement::{encode_points, Point};

/// Errors that can occur while talking to the database.
#[derive(Debug)]
pub enum DbError {
    /// The database endpoint could not be reached (connection refused,
    /// DNS failure, timeout)
    Connectivity(String),

    /// Server returned an error status code
    Status {
        code: StatusCode,
        message: String,
    },

    /// Failed to parse response body
    Parse(String),

    /// Any other request failure
    Request(String),

    /// Client configuration error
    Config(String),
}

impl DbError {
    /// Whether this error means the database is unreachable, as opposed to
    /// the database rejecting the request.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DbError::Connectivity(_))
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connectivity(e) => write!(f, "Database unreachable: {}", e),
            DbError::Status { code, message } => {
                write!(f, "Server error ({}): {}", code, message)
            }
            DbError::Parse(e) => write!(f, "Failed to parse response: {}", e),
            DbError::Request(e) => write!(f, "HTTP request failed: {}", e),
            DbError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for DbError {}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            DbError::Connectivity(err.to_string())
        } else {
            DbError::Request(err.to_string())
        }
    }
}

/// Operations the logger needs from a time-series database.
#[allow(async_fn_in_trait)]
pub trait TimeSeriesClient {
    /// Names of the databases that exist on the server.
    async fn list_databases(&self) -> Result<Vec<String>, DbError>;

    /// Create a database.
    async fn create_database(&self, name: &str) -> Result<(), DbError>;

    /// Write a batch of points into a database.
    async fn write_points(&self, database: &str, points: &[Point]) -> Result<(), DbError>;
}

/// Credentials sent with every request.
#[derive(Debug, Clone)]
enum Auth {
    None,
    Token(String),
    Basic {
        username: String,
        password: Option<String>,
    },
}

/// Response of the `/query` endpoint.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// HTTP client for InfluxDB.
///
/// The underlying reqwest client is built once and reused, so the
/// connection pool lives as long as the logger.
pub struct InfluxClient {
    client: Client,
    base_url: String,
    auth: Auth,
    timeout: Duration,
}

impl InfluxClient {
    /// Create a new client from the logger configuration.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, DbError> {
        let auth = match (&config.token, &config.username) {
            (Some(token), _) => Auth::Token(token.clone()),
            (None, Some(username)) => Auth::Basic {
                username: username.clone(),
                password: config.password.clone(),
            },
            (None, None) => Auth::None,
        };

        Self::with_settings(config.influx_url(), config.request_timeout, auth)
    }

    fn with_settings(
        base_url: impl Into<String>,
        timeout: Duration,
        auth: Auth,
    ) -> Result<Self, DbError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| DbError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            timeout,
        })
    }

    /// Base URL of the InfluxDB HTTP API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Token(token) => request.header("Authorization", format!("Token {}", token)),
            Auth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        }
    }

    /// Send a request and turn non-2xx responses into `DbError::Status`.
    async fn send(&self, request: RequestBuilder) -> Result<String, DbError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(DbError::Status {
                code: status,
                message: body,
            })
        }
    }
}

impl TimeSeriesClient for InfluxClient {
    async fn list_databases(&self) -> Result<Vec<String>, DbError> {
        let request = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[("q", "SHOW DATABASES")]);

        let body = self.send(request).await?;
        parse_database_list(&body)
    }

    async fn create_database(&self, name: &str) -> Result<(), DbError> {
        let statement = format!("CREATE DATABASE \"{}\"", name.replace('"', "\\\""));
        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .form(&[("q", statement.as_str())]);

        let body = self.send(request).await?;
        check_statement_errors(&body)
    }

    async fn write_points(&self, database: &str, points: &[Point]) -> Result<(), DbError> {
        let body = encode_points(points);
        debug!(database = database, body = %body, "Writing points");

        let request = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", database), ("precision", "ns")])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body);

        self.send(request).await?;
        Ok(())
    }
}

/// Extract database names from a `SHOW DATABASES` response.
fn parse_database_list(body: &str) -> Result<Vec<String>, DbError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| DbError::Parse(e.to_string()))?;

    let mut databases = Vec::new();
    for result in response.results {
        if let Some(error) = result.error {
            return Err(DbError::Parse(error));
        }
        for series in result.series {
            for row in series.values {
                if let Some(name) = row.first().and_then(|v| v.as_str()) {
                    databases.push(name.to_string());
                }
            }
        }
    }

    Ok(databases)
}

/// InfluxQL reports statement errors inside a 200 response.
fn check_statement_errors(body: &str) -> Result<(), DbError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| DbError::Parse(e.to_string()))?;

    match response.results.into_iter().find_map(|r| r.error) {
        Some(error) => Err(DbError::Status {
            code: StatusCode::OK,
            message: error,
        }),
        None => Ok(()),
    }
}
