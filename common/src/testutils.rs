//! In-memory fakes for exercising the pipeline without a database.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::batch::{Escape, Row};
use crate::copy::SourceCursor;
use crate::progress;
use crate::writer::{SinkConnection, SinkConnector};

/// Leaked so it can stand in for the process-wide counters in tests.
pub fn test_progress() -> &'static progress::Progress {
    Box::leak(Box::new(progress::Progress::new()))
}

/// Escape that copies bytes through unchanged.
pub struct PassthroughEscape;

impl Escape for PassthroughEscape {
    fn escape_into(&self, raw: &[u8], out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(raw);
        Ok(())
    }
}

/// Escape that always fails, for producer-side failure injection.
pub struct FailingEscape;

impl Escape for FailingEscape {
    fn escape_into(&self, _raw: &[u8], _out: &mut Vec<u8>) -> Result<()> {
        Err(anyhow!("induced escape failure"))
    }
}

/// Source cursor over a fixed set of rows, optionally failing mid-stream.
pub struct VecSource {
    rows: VecDeque<Row>,
    fail_after: Option<usize>,
    produced: usize,
}

impl VecSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into(),
            fail_after: None,
            produced: 0,
        }
    }

    /// Yields `produced` rows, then fails every subsequent read.
    pub fn failing_after(rows: Vec<Row>, produced: usize) -> Self {
        Self {
            rows: rows.into(),
            fail_after: Some(produced),
            produced: 0,
        }
    }
}

#[async_trait]
impl SourceCursor for VecSource {
    async fn next_row(&mut self) -> Result<Option<Row>> {
        if self.fail_after == Some(self.produced) {
            return Err(anyhow!("induced source failure"));
        }
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };
        self.produced += 1;
        Ok(Some(row))
    }
}

/// Connector whose connections record executed statements into a shared log.
///
/// Cloning the connector is not needed; wrap it in an `Arc` and hand it to the
/// pool, then inspect [`RecordingConnector::executed`] afterwards.
pub struct RecordingConnector {
    executed: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_needle: Option<Vec<u8>>,
    refuse_connections: bool,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            executed: Arc::new(Mutex::new(Vec::new())),
            fail_needle: None,
            refuse_connections: false,
        }
    }

    /// Connections fail any statement containing `needle`; other statements run.
    pub fn failing_on(needle: &[u8]) -> Self {
        Self {
            fail_needle: Some(needle.to_vec()),
            ..Self::new()
        }
    }

    /// Every connection attempt fails.
    pub fn refusing_connections() -> Self {
        Self {
            refuse_connections: true,
            ..Self::new()
        }
    }

    /// Statements executed so far, in per-connection completion order.
    pub fn executed(&self) -> Vec<Vec<u8>> {
        self.executed.lock().unwrap().clone()
    }
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecordingSink {
    executed: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_needle: Option<Vec<u8>>,
}

#[async_trait]
impl SinkConnection for RecordingSink {
    async fn execute(&mut self, statement: &[u8]) -> Result<()> {
        if let Some(needle) = &self.fail_needle {
            if statement.windows(needle.len()).any(|w| w == &needle[..]) {
                return Err(anyhow!("induced execution failure"));
            }
        }
        self.executed.lock().unwrap().push(statement.to_vec());
        Ok(())
    }
}

#[async_trait]
impl SinkConnector for RecordingConnector {
    type Connection = RecordingSink;

    async fn connect(&self) -> Result<RecordingSink> {
        if self.refuse_connections {
            return Err(anyhow!("induced connection failure"));
        }
        Ok(RecordingSink {
            executed: self.executed.clone(),
            fail_needle: self.fail_needle.clone(),
        })
    }
}
