//! Writer pool: concurrent batch execution against independent sink connections.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchPayload;
use crate::progress;
use queue::BoundedQueue;

/// One destination connection, exclusively owned by a single writer task.
#[async_trait]
pub trait SinkConnection: Send {
    /// Runs a pre-rendered statement. The statement bytes are passed through
    /// as-is; rendering and escaping already happened on the producer side.
    async fn execute(&mut self, statement: &[u8]) -> Result<()>;
}

/// Opens sink connections; called once per pool writer at startup.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    type Connection: SinkConnection + 'static;

    async fn connect(&self) -> Result<Self::Connection>;
}

/// Queue item: a rendered batch, or the per-writer shutdown marker.
///
/// Markers are enqueued once per writer after the last real batch; FIFO order
/// plus one-marker-per-pop guarantees every writer sees exactly one.
#[derive(Debug)]
pub enum Task {
    Execute(BatchPayload),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of writer tasks, each with its own connection
    pub writers: usize,
    /// Log execution failures and keep going instead of aborting the pipeline
    pub tolerant: bool,
}

#[derive(Copy, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub batches_written: usize,
    pub batches_failed: usize,
    pub rows_written: usize,
    pub bytes_written: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            batches_written: self.batches_written + other.batches_written,
            batches_failed: self.batches_failed + other.batches_failed,
            rows_written: self.rows_written + other.rows_written,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "batches written: {}\n\
            batches failed: {}\n\
            rows written: {}\n\
            bytes written: {}",
            self.batches_written,
            self.batches_failed,
            self.rows_written,
            bytesize::ByteSize(self.bytes_written),
        )
    }
}

/// Error type for writer tasks that preserves the task's summary even on failure.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

/// Spawns the writer pool onto `join_set`.
///
/// Each writer opens its own connection, then loops popping from `queue` until it
/// dequeues a [`Task::Shutdown`] marker or observes `cancel`. A connection
/// failure at startup is always fatal to the pipeline; an execution failure is
/// policy-gated by `settings.tolerant`.
pub fn spawn_writers<C>(
    join_set: &mut tokio::task::JoinSet<Result<Summary, Error>>,
    connector: Arc<C>,
    work_queue: Arc<BoundedQueue<Task>>,
    cancel: CancellationToken,
    settings: &Settings,
    prog_track: &'static progress::Progress,
) where
    C: SinkConnector + 'static,
{
    for id in 0..settings.writers {
        let connector = connector.clone();
        let work_queue = work_queue.clone();
        let cancel = cancel.clone();
        let tolerant = settings.tolerant;
        join_set.spawn(async move {
            let conn = match connector.connect().await {
                Ok(conn) => conn,
                Err(error) => {
                    let error = error.context(format!("writer {id}: could not open sink connection"));
                    tracing::error!("{:#}", &error);
                    // writers cannot run without a connection regardless of policy
                    cancel.cancel();
                    return Err(Error::new(error, Summary::default()));
                }
            };
            run_writer(id, conn, work_queue, cancel, tolerant, prog_track).await
        });
    }
}

async fn run_writer<C: SinkConnection>(
    id: usize,
    mut conn: C,
    work_queue: Arc<BoundedQueue<Task>>,
    cancel: CancellationToken,
    tolerant: bool,
    prog_track: &'static progress::Progress,
) -> Result<Summary, Error> {
    let mut summary = Summary::default();
    loop {
        let task = tokio::select! {
            biased;
            // a fail-fast abort on a peer stops this writer before its next pop
            () = cancel.cancelled() => break,
            task = work_queue.pop() => task,
        };
        let payload = match task {
            Task::Shutdown => break,
            Task::Execute(payload) => payload,
        };
        tracing::debug!(
            "writer {id}: executing batch of {} rows ({} bytes)",
            payload.rows(),
            payload.len()
        );
        match conn.execute(payload.statement()).await {
            Ok(()) => {
                summary.batches_written += 1;
                summary.rows_written += payload.rows();
                summary.bytes_written += payload.len() as u64;
                prog_track.batches_written.inc();
                prog_track.rows_written.add(payload.rows() as u64);
                prog_track.bytes_written.add(payload.len() as u64);
            }
            Err(error) => {
                let error = error.context(format!("writer {id}: could not insert batch"));
                if tolerant {
                    tracing::warn!("{:#}", &error);
                    summary.batches_failed += 1;
                    prog_track.batches_failed.inc();
                } else {
                    tracing::error!("{:#}", &error);
                    cancel.cancel();
                    return Err(Error::new(error, summary));
                }
            }
        }
    }
    tracing::debug!("writer {id}: done");
    Ok(summary)
}
