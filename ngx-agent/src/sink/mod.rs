//! Durable destination for access records.
//!
//! [`RecordSink`] is the seam between the pipeline and the storage engine. [`BulkWriter`] sits in
//! front of it and turns one flushed batch into one atomic bulk write, retrying transient
//! connection failures with exponential backoff.

#[cfg(test)]
pub(crate) mod memory;
pub mod postgres;

pub use postgres::PgSink;

use crate::metrics::{BATCHES_WRITTEN_TOTAL, WRITE_DURATION};
use crate::record::AccessRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink could not be reached or the connection dropped mid-operation.
    #[error("sink connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    /// The sink refused the operation (constraint violation, column mismatch, bad data).
    #[error("sink rejected the operation: {0}")]
    Rejected(#[source] sqlx::Error),

    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Connection(_))
    }
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => SinkError::Closed,
            sqlx::Error::Database(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Decode(_) => SinkError::Rejected(err),
            other => SinkError::Connection(other),
        }
    }
}

/// A failed bulk write. The whole batch was rejected and is handed back for diagnostics.
#[derive(Debug, Error)]
#[error("bulk write of {} records failed after {attempts} attempt(s): {source}", .batch.len())]
pub struct WriteError {
    #[source]
    pub source: SinkError,
    pub attempts: u32,
    pub batch: Vec<AccessRecord>,
    /// Set when cancellation cut the retry backoff short rather than the attempt budget running out.
    pub interrupted: bool,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Creates the destination schema and table if they do not exist.
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    /// Latest stored ordering key, or `None` when the table is empty.
    async fn max_event_time(&self) -> Result<Option<DateTime<Utc>>, SinkError>;

    /// Inserts all `records` in one atomic operation and returns the number of rows accepted.
    async fn write_batch(&self, records: &[AccessRecord]) -> Result<u64, SinkError>;

    /// Releases the underlying connections. Further calls fail with [`SinkError::Closed`].
    async fn close(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
        }
    }
}

pub struct BulkWriter {
    sink: Arc<dyn RecordSink>,
    retry: RetryPolicy,
    cancel_token: CancellationToken,
}

impl BulkWriter {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        retry: RetryPolicy,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            sink,
            retry,
            cancel_token,
        }
    }

    /// Writes `records` as a single bulk operation.
    ///
    /// An empty batch returns `Ok(0)` without contacting the sink. Connection failures are
    /// retried up to the policy's attempt budget; rejections are returned immediately.
    pub async fn write(&self, records: Vec<AccessRecord>) -> Result<usize, WriteError> {
        if records.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.base_delay.max(Duration::from_millis(1));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let timer = WRITE_DURATION.start_timer();
            let result = self.sink.write_batch(&records).await;
            timer.observe_duration();

            let err = match result {
                Ok(rows) => {
                    BATCHES_WRITTEN_TOTAL.with_label_values(&["ok"]).inc();
                    return Ok(rows as usize);
                }
                Err(err) => err,
            };

            BATCHES_WRITTEN_TOTAL.with_label_values(&["error"]).inc();
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(WriteError {
                    source: err,
                    attempts: attempt,
                    batch: records,
                    interrupted: false,
                });
            }

            warn!(
                attempt,
                max_attempts,
                record_count = records.len(),
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "bulk write failed; retrying with backoff"
            );

            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    return Err(WriteError {
                        source: err,
                        attempts: attempt,
                        batch: records,
                        interrupted: true,
                    });
                }
                _ = sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff.saturating_mul(2), MAX_BACKOFF);
        }
    }
}
