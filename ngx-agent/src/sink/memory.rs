//! In-memory [`RecordSink`] used by unit tests.

use crate::record::AccessRecord;
use crate::sink::{RecordSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

type ErrorFactory = Box<dyn Fn() -> SinkError + Send + Sync>;

#[derive(Default)]
pub(crate) struct MemorySink {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    batches: Vec<Vec<AccessRecord>>,
    preexisting_max: Option<DateTime<Utc>>,
    write_calls: usize,
    schema_calls: usize,
    pending_failures: usize,
    failure: Option<ErrorFactory>,
    fail_recovery: bool,
    closed: bool,
}

impl MemorySink {
    /// A sink that already holds rows up to `max`.
    pub(crate) fn with_existing_max(max: DateTime<Utc>) -> Self {
        let sink = Self::default();
        sink.state.lock().unwrap().preexisting_max = Some(max);
        sink
    }

    pub(crate) fn fail_next_writes(
        &self,
        count: usize,
        make: impl Fn() -> SinkError + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock().unwrap();
        state.pending_failures = count;
        state.failure = Some(Box::new(make));
    }

    pub(crate) fn fail_recovery(&self) {
        self.state.lock().unwrap().fail_recovery = true;
    }

    pub(crate) fn batches(&self) -> Vec<Vec<AccessRecord>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub(crate) fn stored(&self) -> Vec<AccessRecord> {
        self.batches().into_iter().flatten().collect()
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    pub(crate) fn schema_calls(&self) -> usize {
        self.state.lock().unwrap().schema_calls
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.state.lock().unwrap().schema_calls += 1;
        Ok(())
    }

    async fn max_event_time(&self) -> Result<Option<DateTime<Utc>>, SinkError> {
        let state = self.state.lock().unwrap();
        if state.fail_recovery {
            return Err(SinkError::Connection(sqlx::Error::PoolTimedOut));
        }
        let stored_max = state.batches.iter().flatten().map(|r| r.event_time).max();
        Ok(stored_max.max(state.preexisting_max))
    }

    async fn write_batch(&self, records: &[AccessRecord]) -> Result<u64, SinkError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.write_calls += 1;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            if let Some(make) = state.failure.as_ref() {
                return Err(make());
            }
        }
        state.batches.push(records.to_vec());
        Ok(records.len() as u64)
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}
