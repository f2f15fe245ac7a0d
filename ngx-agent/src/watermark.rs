//! Restart-safe deduplication by ordering key.
//!
//! The mark is the newest `event_time` known to be durably stored. It is recovered from the sink
//! once at startup; records at or before it are dropped at flush time, which keeps lines that
//! the line source re-delivers (reopen from start, restart mid-batch) from being stored twice.
//!
//! Once batches are written during the run the mark also advances, but that part only drops
//! records strictly older than it. Timestamps have one-second resolution, so distinct entries
//! sharing the newest written second may still arrive in a later window.

use crate::metrics::HIGH_WATER_MARK_SECONDS;
use crate::record::AccessRecord;
use crate::sink::{RecordSink, SinkError};
use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighWaterMark {
    recovered: Option<DateTime<Utc>>,
    advanced: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, PartialEq)]
pub struct FilterOutcome {
    pub kept: Vec<AccessRecord>,
    pub skipped: usize,
}

impl HighWaterMark {
    pub fn new(mark: Option<DateTime<Utc>>) -> Self {
        let tracker = Self {
            recovered: mark,
            advanced: None,
        };
        tracker.publish();
        tracker
    }

    /// Reads the newest stored ordering key from `sink`.
    ///
    /// An empty table yields no mark. Query failures are returned so startup can abort instead of
    /// silently accepting everything.
    pub async fn recover(sink: &dyn RecordSink) -> Result<Self, SinkError> {
        let mark = sink.max_event_time().await?;
        match mark {
            Some(mark) => info!(last_entry_time = %mark, "recovered high-water mark"),
            None => info!("first sync; no stored entries"),
        }
        Ok(Self::new(mark))
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.recovered.max(self.advanced)
    }

    /// Keeps records strictly newer than the recovered mark and not older than the advanced one,
    /// preserving their order.
    pub fn filter(&self, batch: Vec<AccessRecord>) -> FilterOutcome {
        if self.recovered.is_none() && self.advanced.is_none() {
            return FilterOutcome {
                kept: batch,
                skipped: 0,
            };
        }

        let total = batch.len();
        let kept: Vec<AccessRecord> = batch
            .into_iter()
            .filter(|record| self.keeps(record.event_time))
            .collect();
        FilterOutcome {
            skipped: total - kept.len(),
            kept,
        }
    }

    /// Moves the mark forward to `newest`; never moves it back.
    pub fn advance(&mut self, newest: DateTime<Utc>) {
        if self.advanced.map_or(true, |mark| newest > mark) {
            self.advanced = Some(newest);
            self.publish();
        }
    }

    fn keeps(&self, event_time: DateTime<Utc>) -> bool {
        self.recovered.map_or(true, |mark| event_time > mark)
            && self.advanced.map_or(true, |mark| event_time >= mark)
    }

    fn publish(&self) {
        if let Some(mark) = self.current() {
            HIGH_WATER_MARK_SECONDS.set(mark.timestamp());
        }
    }
}
