//! The copy orchestrator: wires the row reader to the writer pool through one
//! bounded queue and drives the shutdown handshake.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::batch::{BatchBuilder, Escape, Row};
use crate::progress;
use crate::writer;
use crate::writer::{SinkConnector, Task};
use queue::BoundedQueue;

/// Lazy, finite, non-restartable sequence of rows read from the source table.
#[async_trait]
pub trait SourceCursor: Send {
    /// Next row, or `None` once the cursor is exhausted. Exhaustion is final.
    async fn next_row(&mut self) -> Result<Option<Row>>;
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Number of writer tasks / destination connections
    pub writers: usize,
    /// Maximum number of batches buffered between the reader and the writers
    pub queue_depth: usize,
    /// Soft flush threshold for a single batch, in bytes
    pub batch_size: usize,
    /// Log insertion failures and keep copying instead of aborting
    pub tolerant: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            writers: 16,
            queue_depth: 100,
            batch_size: 1024 * 1024,
            tolerant: false,
        }
    }
}

impl Settings {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.writers == 0 {
            return Err("at least one writer connection is required".to_string());
        }
        if self.queue_depth == 0 {
            return Err("queue depth must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch size must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub rows_read: usize,
    pub batches_built: usize,
    pub write_summary: writer::Summary,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            rows_read: self.rows_read + other.rows_read,
            batches_built: self.batches_built + other.batches_built,
            write_summary: self.write_summary + other.write_summary,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "rows read: {}\n\
            batches built: {}\n\
            {}",
            self.rows_read, self.batches_built, &self.write_summary,
        )
    }
}

/// Error type for copy operations that preserves the operation summary even on
/// failure, and distinguishes a fail-fast write abort from a producer-side
/// failure.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so it can be logged
/// with any format specifier (`{}`, `{:#}`, `{:?}`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source cursor or row rendering failed; the shutdown handshake still
    /// ran, no writer is left behind.
    #[error("{source:#}")]
    Source {
        #[source]
        source: anyhow::Error,
        summary: Summary,
    },
    /// A writer failed (or could not connect) under the fail-fast policy and the
    /// whole pipeline was torn down.
    #[error("pipeline aborted: {source:#}")]
    Fatal {
        #[source]
        source: anyhow::Error,
        summary: Summary,
    },
}

impl Error {
    #[must_use]
    pub fn summary(&self) -> Summary {
        match self {
            Error::Source { summary, .. } | Error::Fatal { summary, .. } => *summary,
        }
    }
}

/// Copies every row of `source` into `table` at the destination.
///
/// The caller's task acts as the single producer: it renders rows into batches
/// and pushes them into a bounded queue shared with `settings.writers` writer
/// tasks, each on its own connection from `connector`. The bounded push is the
/// sole throttle bounding memory use when the destination is slower than the
/// source.
///
/// Writers dequeue batches in production order, but with more than one writer
/// the completion order against the destination is not the enqueue order; use a
/// single writer if destination-side ordering matters.
///
/// On a producer-side failure the shutdown handshake still runs: one marker per
/// writer is pushed (racing pipeline cancellation) and every writer is joined,
/// so no task outlives this call.
#[instrument(skip_all)]
pub async fn copy<S, C, E>(
    mut source: S,
    connector: Arc<C>,
    escape: &E,
    table: &str,
    settings: &Settings,
    prog_track: &'static progress::Progress,
) -> Result<Summary, Error>
where
    S: SourceCursor,
    C: SinkConnector + 'static,
    E: Escape,
{
    let work_queue = Arc::new(BoundedQueue::new(settings.queue_depth));
    let cancel = CancellationToken::new();
    let mut join_set = tokio::task::JoinSet::new();
    writer::spawn_writers(
        &mut join_set,
        connector,
        work_queue.clone(),
        cancel.clone(),
        &writer::Settings {
            writers: settings.writers,
            tolerant: settings.tolerant,
        },
        prog_track,
    );

    let mut builder = BatchBuilder::new(table, settings.batch_size, escape);
    let mut summary = Summary::default();
    let mut producer_error: Option<anyhow::Error> = None;
    let mut aborted = false;

    tracing::debug!("reading source rows");
    loop {
        let row = match source.next_row().await {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(error) => {
                producer_error = Some(error.context("could not read from source"));
                break;
            }
        };
        let maybe_payload = match builder.push_row(&row) {
            Ok(maybe_payload) => maybe_payload,
            Err(error) => {
                producer_error = Some(error.context("could not render row"));
                break;
            }
        };
        summary.rows_read += 1;
        prog_track.rows_read.inc();
        if let Some(payload) = maybe_payload {
            summary.batches_built += 1;
            prog_track.batches_built.inc();
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                () = work_queue.push(Task::Execute(payload)) => {}
            }
        }
    }

    // trailing partial batch, only on clean exhaustion
    if producer_error.is_none() && !aborted {
        if let Some(payload) = builder.finish() {
            summary.batches_built += 1;
            prog_track.batches_built.inc();
            tokio::select! {
                biased;
                // the pipeline is tearing down, the trailing batch is lost anyway
                () = cancel.cancelled() => {}
                () = work_queue.push(Task::Execute(payload)) => {}
            }
        }
    }

    // shutdown handshake: one marker per writer, pushed after all real batches;
    // this runs on the producer-error path too so no writer blocks forever
    tracing::debug!("pushing shutdown markers");
    for _ in 0..settings.writers {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = work_queue.push(Task::Shutdown) => {}
        }
    }

    let mut worker_error: Option<anyhow::Error> = None;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(write_summary)) => {
                summary.write_summary = summary.write_summary + write_summary;
            }
            Ok(Err(error)) => {
                // already logged at the writer; keep the first as the cause
                summary.write_summary = summary.write_summary + error.summary;
                if worker_error.is_none() {
                    worker_error = Some(error.source);
                }
            }
            Err(join_error) => {
                if worker_error.is_none() {
                    worker_error = Some(
                        anyhow::anyhow!(join_error).context("writer task terminated abnormally"),
                    );
                }
            }
        }
    }

    if let Some(source) = producer_error {
        return Err(Error::Source { source, summary });
    }
    if let Some(source) = worker_error {
        return Err(Error::Fatal { source, summary });
    }
    Ok(summary)
}
