//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::agent::ShutdownHandle;
use crate::client::{DbError, TimeSeriesClient};
use crate::config::SensorModel;
use crate::measurement::Point;
use crate::remediation::NetworkRemediation;
use crate::sensor::{Reading, SensorError, SensorReader};

/// How `MockClient::write_points` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Succeed,
    /// Every write is rejected by the server
    Reject,
    /// Every write fails because the server is unreachable
    Unreachable,
    /// The first n writes succeed, the rest are rejected
    RejectAfter(usize),
}

pub struct MockClient {
    databases: Mutex<Vec<String>>,
    unreachable_for: AtomicUsize,
    reject_list: Mutex<bool>,
    write_mode: Mutex<WriteMode>,
    interrupt_on_write: Mutex<Option<ShutdownHandle>>,
    pub list_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub write_calls: AtomicUsize,
    pub written: Mutex<Vec<Point>>,
}

impl MockClient {
    /// A reachable server that already has the given databases.
    pub fn with_databases(databases: &[&str]) -> Self {
        Self {
            databases: Mutex::new(databases.iter().map(|s| s.to_string()).collect()),
            unreachable_for: AtomicUsize::new(0),
            reject_list: Mutex::new(false),
            write_mode: Mutex::new(WriteMode::Succeed),
            interrupt_on_write: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
        }
    }

    /// The next `attempts` database listings fail as unreachable.
    pub fn unreachable_for(self, attempts: usize) -> Self {
        self.unreachable_for.store(attempts, Ordering::SeqCst);
        self
    }

    /// Database listings are rejected by the server.
    pub fn rejecting_list(self) -> Self {
        *self.reject_list.lock().unwrap() = true;
        self
    }

    pub fn with_write_mode(self, mode: WriteMode) -> Self {
        self.set_write_mode(mode);
        self
    }

    pub fn set_write_mode(&self, mode: WriteMode) {
        *self.write_mode.lock().unwrap() = mode;
    }

    /// Writes trigger the shutdown handle and never complete.
    pub fn interrupting_writes(self, handle: ShutdownHandle) -> Self {
        *self.interrupt_on_write.lock().unwrap() = Some(handle);
        self
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn written_points(&self) -> Vec<Point> {
        self.written.lock().unwrap().clone()
    }
}

impl TimeSeriesClient for MockClient {
    async fn list_databases(&self) -> Result<Vec<String>, DbError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.unreachable_for.load(Ordering::SeqCst);
        if remaining > 0 {
            self.unreachable_for.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Connectivity("connection refused".to_string()));
        }

        if *self.reject_list.lock().unwrap() {
            return Err(DbError::Status {
                code: reqwest::StatusCode::UNAUTHORIZED,
                message: "authorization failed".to_string(),
            });
        }

        Ok(self.databases.lock().unwrap().clone())
    }

    async fn create_database(&self, name: &str) -> Result<(), DbError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.databases.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn write_points(&self, _database: &str, points: &[Point]) -> Result<(), DbError> {
        let call = self.write_calls.fetch_add(1, Ordering::SeqCst);

        let interrupt = self.interrupt_on_write.lock().unwrap().clone();
        if let Some(handle) = interrupt {
            handle.trigger();
            std::future::pending::<()>().await;
        }

        let mode = *self.write_mode.lock().unwrap();
        match mode {
            WriteMode::Succeed => {}
            WriteMode::Reject => return Err(rejected()),
            WriteMode::Unreachable => {
                return Err(DbError::Connectivity("connection refused".to_string()))
            }
            WriteMode::RejectAfter(n) if call >= n => return Err(rejected()),
            WriteMode::RejectAfter(_) => {}
        }

        self.written.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

fn rejected() -> DbError {
    DbError::Status {
        code: reqwest::StatusCode::BAD_REQUEST,
        message: "unable to parse points".to_string(),
    }
}

/// Counts remediation triggers.
#[derive(Debug, Clone, Default)]
pub struct MockRemediation {
    calls: Arc<AtomicUsize>,
}

impl MockRemediation {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NetworkRemediation for MockRemediation {
    fn remediate(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sensor returning scripted readings; the last one repeats.
pub struct MockSensor {
    readings: Mutex<VecDeque<Reading>>,
    interrupt: Option<ShutdownHandle>,
    pub calls: AtomicUsize,
}

impl MockSensor {
    /// Returns the same reading on every call.
    pub fn constant(reading: Reading) -> Self {
        Self::scripted(vec![reading])
    }

    pub fn scripted(readings: Vec<Reading>) -> Self {
        Self {
            readings: Mutex::new(readings.into()),
            interrupt: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Reads trigger the shutdown handle and never complete.
    pub fn interrupting(handle: ShutdownHandle) -> Self {
        Self {
            interrupt: Some(handle),
            ..Self::constant(Reading::complete(50, 20))
        }
    }

    pub fn reads(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SensorReader for MockSensor {
    async fn read(&self, _model: SensorModel, _pin: u32) -> Result<Reading, SensorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = &self.interrupt {
            handle.trigger();
            std::future::pending::<()>().await;
        }

        let mut readings = self.readings.lock().unwrap();
        let reading = if readings.len() > 1 {
            readings.pop_front()
        } else {
            readings.front().copied()
        };
        Ok(reading.unwrap_or_default())
    }
}
