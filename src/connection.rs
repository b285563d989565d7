//! Database connection management.
//!
//! The [`ConnectionManager`] establishes a usable session with the database,
//! makes sure the target database exists, and retries forever while the
//! server is unreachable. Every unreachable attempt is counted; once the
//! count exceeds `max_retries` the network is restarted and the count starts
//! over.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::{DbError, TimeSeriesClient};
use crate::remediation::NetworkRemediation;
use crate::retry::{retry, Backoff};

/// Delay before the first reconnection attempt.
pub const FIRST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Delay before every later reconnection attempt.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// A verified connection to the target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub database: String,
    pub connected_at: DateTime<Utc>,
}

pub struct ConnectionManager<C, R> {
    client: C,
    database: String,
    session: Option<Session>,
    retry_count: u32,
    max_retries: u32,
    backoff: Backoff,
    remediation: R,
}

impl<C, R> ConnectionManager<C, R>
where
    C: TimeSeriesClient,
    R: NetworkRemediation,
{
    /// Create a manager for `database`. No connection is made until
    /// [`ensure_connection`](Self::ensure_connection) is called.
    pub fn new(client: C, database: impl Into<String>, max_retries: u32, remediation: R) -> Self {
        Self {
            client,
            database: database.into(),
            session: None,
            retry_count: 0,
            max_retries,
            backoff: Backoff::two_phase(FIRST_RETRY_DELAY, RETRY_DELAY),
            remediation,
        }
    }

    /// Replace the reconnection backoff schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Make sure a session exists, connecting if needed.
    ///
    /// Connectivity errors are never returned: they are retried until the
    /// server answers, restarting the network whenever the attempt count
    /// exceeds `max_retries`. Any other error (authentication, malformed
    /// response) is returned to the caller.
    pub async fn ensure_connection(&mut self) -> Result<(), DbError> {
        if self.session.is_some() {
            return Ok(());
        }

        let client = &self.client;
        let database = self.database.as_str();
        let remediation = &self.remediation;
        let max_retries = self.max_retries;

        let session = retry(
            &self.backoff,
            &mut self.retry_count,
            DbError::is_connectivity,
            |retry_count, _| {
                if *retry_count > max_retries {
                    warn!(
                        retry_count = *retry_count,
                        max_retries = max_retries,
                        "Database unreachable after repeated attempts"
                    );
                    remediation.remediate();
                    *retry_count = 0;
                }
            },
            || open_session(client, database),
        )
        .await?;

        self.session = Some(session);
        Ok(())
    }

    /// Forget the current session so the next
    /// [`ensure_connection`](Self::ensure_connection) reconnects.
    pub fn invalidate(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                database = %session.database,
                connected_secs = (Utc::now() - session.connected_at).num_seconds(),
                "Session invalidated"
            );
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn remediation(&self) -> &R {
        &self.remediation
    }

    /// Unreachable attempts since the last network restart.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// One connection attempt: list databases and create the target if missing.
async fn open_session<C: TimeSeriesClient>(client: &C, database: &str) -> Result<Session, DbError> {
    let databases = client.list_databases().await?;
    debug!(databases = ?databases, "Available databases");

    if !databases.iter().any(|db| db == database) {
        client.create_database(database).await?;
        info!(database = database, "Created database");
    }

    info!(database = database, "Using database");

    Ok(Session {
        database: database.to_string(),
        connected_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockClient, MockRemediation};

    fn manager(client: MockClient, max_retries: u32) -> ConnectionManager<MockClient, MockRemediation> {
        ConnectionManager::new(client, "thlogger", max_retries, MockRemediation::default())
            .with_backoff(Backoff::fixed(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_existing_database_is_used() {
        let mut connection = manager(MockClient::with_databases(&["thlogger", "test"]), 3);
        let before = Utc::now();

        connection.ensure_connection().await.unwrap();

        assert!(connection.is_connected());
        let session = connection.session().unwrap();
        assert_eq!(session.database, "thlogger");
        assert!(session.connected_at >= before && session.connected_at <= Utc::now());
        assert_eq!(connection.client().lists(), 1);
        assert_eq!(connection.client().creates(), 0);
    }

    #[tokio::test]
    async fn test_missing_database_created_once() {
        let mut connection = manager(MockClient::with_databases(&["test", "test2"]), 3);

        connection.ensure_connection().await.unwrap();
        connection.ensure_connection().await.unwrap();
        assert_eq!(connection.client().creates(), 1);
        assert_eq!(connection.client().lists(), 1);

        // A reconnection finds the database that was created
        connection.invalidate();
        assert!(!connection.is_connected());
        connection.ensure_connection().await.unwrap();
        assert_eq!(connection.client().creates(), 1);
        assert_eq!(connection.client().lists(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server_retried_until_available() {
        let client = MockClient::with_databases(&["thlogger"]).unreachable_for(2);
        let mut connection = manager(client, 5);

        connection.ensure_connection().await.unwrap();

        assert!(connection.is_connected());
        assert_eq!(connection.client().lists(), 3);
        assert_eq!(connection.retry_count(), 2);
        assert_eq!(connection.remediation().count(), 0);
    }

    #[tokio::test]
    async fn test_remediation_fires_once_when_retries_exceeded() {
        let client = MockClient::with_databases(&["thlogger"]).unreachable_for(3);
        let mut connection = manager(client, 2);

        connection.ensure_connection().await.unwrap();

        assert_eq!(connection.remediation().count(), 1);
        assert_eq!(connection.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_remediation_repeats_for_long_outage() {
        let client = MockClient::with_databases(&["thlogger"]).unreachable_for(7);
        let mut connection = manager(client, 2);

        connection.ensure_connection().await.unwrap();

        // Restarts after the 3rd and 6th failures, one failure counted since
        assert_eq!(connection.remediation().count(), 2);
        assert_eq!(connection.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_count_persists_across_reconnects() {
        let client = MockClient::with_databases(&["thlogger"]).unreachable_for(1);
        let mut connection = manager(client, 5);

        connection.ensure_connection().await.unwrap();
        assert_eq!(connection.retry_count(), 1);

        connection.invalidate();
        connection.ensure_connection().await.unwrap();
        assert_eq!(connection.retry_count(), 1);
    }

    #[tokio::test]
    async fn test_non_connectivity_error_is_returned() {
        let client = MockClient::with_databases(&["thlogger"]).rejecting_list();
        let mut connection = manager(client, 1);

        let err = connection.ensure_connection().await.unwrap_err();

        assert!(!err.is_connectivity());
        assert!(!connection.is_connected());
        assert_eq!(connection.client().lists(), 1);
        assert_eq!(connection.remediation().count(), 0);
    }

    #[test]
    fn test_default_backoff() {
        let connection = ConnectionManager::new(
            MockClient::with_databases(&[]),
            "thlogger",
            3,
            MockRemediation::default(),
        );
        assert_eq!(connection.backoff.delay(0), FIRST_RETRY_DELAY);
        assert_eq!(connection.backoff.delay(1), RETRY_DELAY);
        assert_eq!(connection.backoff.delay(5), RETRY_DELAY);
        assert_eq!(connection.max_retries(), 3);
    }
}
