//! Pipeline coordinator.
//!
//! Owns the accumulation loop: lines arrive from the bounded intake queue, are parsed and
//! buffered, and every closed flush window turns the buffer into one filtered bulk write.
//!
//! Lifecycle: `Initializing` (schema bootstrap) → `Recovering` (high-water mark) → `Running` →
//! `Draining` → `Stopped`. Failures before `Running` and failed writes are fatal; unparseable
//! lines are skipped until too many arrive in a row.

use crate::batch::BatchAccumulator;
use crate::config::Config;
use crate::metrics::{
    BUFFERED_RECORDS, PARSE_ERRORS_TOTAL, RECORDS_SKIPPED_TOTAL, RECORDS_STORED_TOTAL,
};
use crate::parsers::parse_line;
use crate::parsers::utils::{line_preview, LINE_PREVIEW_LIMIT};
use crate::record::time_range;
use crate::sink::{BulkWriter, RecordSink, RetryPolicy, WriteError};
use crate::watermark::{FilterOutcome, HighWaterMark};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Recovering,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub flush_window: Duration,
    pub flush_on_first_tick: bool,
    pub max_consecutive_parse_failures: u32,
    pub advance_mark_after_write: bool,
    pub drain_on_shutdown: bool,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    /// `flush_window` is passed separately so callers can apply runtime overrides.
    pub fn from_config(config: &Config, flush_window: Duration) -> Self {
        Self {
            flush_window,
            flush_on_first_tick: config.batch.flush_on_first_tick,
            max_consecutive_parse_failures: config.pipeline.max_consecutive_parse_failures,
            advance_mark_after_write: config.pipeline.advance_mark_after_write,
            drain_on_shutdown: config.pipeline.drain_on_shutdown,
            retry: RetryPolicy {
                max_attempts: config.sink.write_retry_max_attempts,
                base_delay: Duration::from_millis(config.sink.write_retry_base_delay_ms),
            },
        }
    }
}

/// Counters for one run of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub lines_received: u64,
    pub records_parsed: u64,
    pub parse_failures: u64,
    pub records_stored: u64,
    pub records_skipped: u64,
    pub batches_written: u64,
}

pub struct Pipeline {
    state: PipelineState,
    settings: PipelineSettings,
    writer: BulkWriter,
    mark: HighWaterMark,
    stats: PipelineStats,
    consecutive_parse_failures: u32,
    cancel_token: CancellationToken,
}

impl Pipeline {
    /// Bootstraps the sink schema and recovers the high-water mark.
    ///
    /// `Initializing` and `Recovering` only show up in logs: a returned pipeline is `Running`.
    pub async fn initialize(
        sink: Arc<dyn RecordSink>,
        settings: PipelineSettings,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        debug!(state = ?PipelineState::Initializing, "pipeline state");
        sink.ensure_schema().await.context("initializing sink")?;

        debug!(state = ?PipelineState::Recovering, "pipeline state");
        let mark = HighWaterMark::recover(sink.as_ref())
            .await
            .context("recovering high-water mark")?;

        let writer = BulkWriter::new(sink, settings.retry, cancel_token.clone());
        Ok(Self {
            state: PipelineState::Running,
            settings,
            writer,
            mark,
            stats: PipelineStats::default(),
            consecutive_parse_failures: 0,
            cancel_token,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn high_water_mark(&self) -> HighWaterMark {
        self.mark
    }

    /// Consumes `intake` until cancellation or until every sender is gone.
    pub async fn run(&mut self, intake: &mut mpsc::Receiver<String>) -> Result<PipelineStats> {
        let cancel_token = self.cancel_token.clone();
        let mut accumulator = BatchAccumulator::new(
            self.settings.flush_window,
            self.settings.flush_on_first_tick,
            Instant::now(),
        );

        info!(
            flush_window_ms = self.settings.flush_window.as_millis() as u64,
            high_water_mark = ?self.mark.current(),
            "pipeline running"
        );

        let reason = loop {
            let deadline = accumulator.deadline();
            let armed = !accumulator.is_empty();

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break "shutdown requested",
                maybe_line = intake.recv() => {
                    let Some(line) = maybe_line else {
                        break "line source closed";
                    };
                    self.ingest_line(&line, &mut accumulator)?;
                    if !accumulator.is_empty() && accumulator.should_flush(Instant::now()) {
                        self.flush(&mut accumulator).await?;
                    }
                }
                _ = sleep_until(deadline), if armed => {
                    self.flush(&mut accumulator).await?;
                }
            }
        };

        self.state = PipelineState::Draining;
        info!(reason, buffered = accumulator.len(), "pipeline draining");
        if !accumulator.is_empty() {
            if self.settings.drain_on_shutdown {
                self.flush(&mut accumulator).await?;
            } else {
                info!(
                    discarded = accumulator.len(),
                    "discarding buffered records on shutdown"
                );
                BUFFERED_RECORDS.set(0);
            }
        }

        self.state = PipelineState::Stopped;
        let stats = self.stats;
        info!(
            lines_received = stats.lines_received,
            records_parsed = stats.records_parsed,
            parse_failures = stats.parse_failures,
            records_stored = stats.records_stored,
            records_skipped = stats.records_skipped,
            batches_written = stats.batches_written,
            "pipeline stopped"
        );
        Ok(stats)
    }

    fn ingest_line(&mut self, line: &str, accumulator: &mut BatchAccumulator) -> Result<()> {
        self.stats.lines_received += 1;

        match parse_line(line) {
            Ok(record) => {
                self.stats.records_parsed += 1;
                self.consecutive_parse_failures = 0;
                accumulator.offer(record);
                BUFFERED_RECORDS.set(accumulator.len() as i64);
                Ok(())
            }
            Err(err) => {
                self.stats.parse_failures += 1;
                self.consecutive_parse_failures = self.consecutive_parse_failures.saturating_add(1);
                PARSE_ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
                warn!(
                    error = %err,
                    kind = err.kind(),
                    consecutive_failures = self.consecutive_parse_failures,
                    line = %line_preview(line, LINE_PREVIEW_LIMIT),
                    "skipping unparseable line"
                );

                if self.consecutive_parse_failures > self.settings.max_consecutive_parse_failures {
                    let streak = self.consecutive_parse_failures;
                    return Err(anyhow::Error::new(err)
                        .context(format!("{streak} consecutive lines could not be parsed")));
                }
                Ok(())
            }
        }
    }

    async fn flush(&mut self, accumulator: &mut BatchAccumulator) -> Result<()> {
        let batch = accumulator.take(Instant::now());
        BUFFERED_RECORDS.set(0);
        if batch.is_empty() {
            return Ok(());
        }

        let FilterOutcome { kept, skipped } = self.mark.filter(batch);
        let newest = kept.iter().map(|record| record.event_time).max();

        let stored = match self.writer.write(kept).await {
            Ok(stored) => stored,
            Err(err) if err.interrupted => {
                warn!(
                    error = %err.source,
                    attempts = err.attempts,
                    record_count = err.batch.len(),
                    "shutdown interrupted write retry; batch not stored"
                );
                for record in &err.batch {
                    debug!(?record, "unstored record");
                }
                return Ok(());
            }
            Err(err) => {
                report_failed_batch(&err);
                let WriteError {
                    source, attempts, ..
                } = err;
                return Err(anyhow::Error::new(source)
                    .context(format!("bulk write failed after {attempts} attempt(s)")));
            }
        };

        self.stats.records_skipped += skipped as u64;
        self.stats.records_stored += stored as u64;
        if stored > 0 {
            self.stats.batches_written += 1;
        }
        RECORDS_SKIPPED_TOTAL.inc_by(skipped as u64);
        RECORDS_STORED_TOTAL.inc_by(stored as u64);
        info!(stored, skipped, "flushed batch");

        if self.settings.advance_mark_after_write {
            if let Some(newest) = newest {
                self.mark.advance(newest);
            }
        }
        Ok(())
    }
}

fn report_failed_batch(err: &WriteError) {
    let (oldest, newest) = match time_range(&err.batch) {
        Some((oldest, newest)) => (Some(oldest), Some(newest)),
        None => (None, None),
    };
    error!(
        error = %err.source,
        attempts = err.attempts,
        record_count = err.batch.len(),
        oldest_event_time = ?oldest,
        newest_event_time = ?newest,
        "bulk write failed; batch not stored"
    );
    for record in &err.batch {
        debug!(?record, "unstored record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AccessRecord;
    use crate::sink::memory::MemorySink;
    use crate::sink::SinkError;
    use chrono::{DateTime, TimeZone, Utc};

    fn settings(window_ms: u64) -> PipelineSettings {
        PipelineSettings {
            flush_window: Duration::from_millis(window_ms),
            flush_on_first_tick: false,
            max_consecutive_parse_failures: 100,
            advance_mark_after_write: true,
            drain_on_shutdown: false,
            retry: RetryPolicy::default(),
        }
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap()
    }

    fn line(second: u32) -> String {
        format!(r#"{{"time":"2024-01-01T00:00:{second:02}Z","status":"200"}}"#)
    }

    fn stored_times(sink: &MemorySink) -> Vec<DateTime<Utc>> {
        sink.stored().iter().map(|record| record.event_time).collect()
    }

    async fn start(sink: &Arc<MemorySink>, settings: PipelineSettings) -> Pipeline {
        Pipeline::initialize(sink.clone(), settings, CancellationToken::new())
            .await
            .unwrap()
    }

    /// Feeds `lines` and closes the queue, then runs the pipeline to completion.
    async fn run_lines(pipeline: &mut Pipeline, lines: Vec<String>) -> Result<PipelineStats> {
        let (tx, mut rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.send(line).await.unwrap();
        }
        drop(tx);
        pipeline.run(&mut rx).await
    }

    #[tokio::test]
    async fn initialize_bootstraps_schema_and_recovers_mark() {
        let sink = Arc::new(MemorySink::with_existing_max(at(30)));
        let pipeline = start(&sink, settings(1_000)).await;
        assert_eq!(sink.schema_calls(), 1);
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert_eq!(pipeline.high_water_mark().current(), Some(at(30)));
    }

    #[tokio::test]
    async fn recovery_failure_is_fatal() {
        let sink = Arc::new(MemorySink::default());
        sink.fail_recovery();
        let err = Pipeline::initialize(sink, settings(1_000), CancellationToken::new())
            .await
            .err()
            .expect("recovery failure must abort startup");
        assert_eq!(err.to_string(), "recovering high-water mark");
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_grouped_by_flush_window() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(&sink, settings(1_000)).await;
        let (tx, mut rx) = mpsc::channel(10);
        let origin = Instant::now();

        let producer = tokio::spawn(async move {
            tx.send(line(0)).await.unwrap();
            sleep_until(origin + Duration::from_millis(400)).await;
            tx.send(line(1)).await.unwrap();
            sleep_until(origin + Duration::from_millis(1_200)).await;
            tx.send(line(2)).await.unwrap();
            sleep_until(origin + Duration::from_millis(2_500)).await;
        });

        let stats = pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        let batches: Vec<Vec<DateTime<Utc>>> = sink
            .batches()
            .iter()
            .map(|batch| batch.iter().map(|record| record.event_time).collect())
            .collect();
        assert_eq!(batches, vec![vec![at(0), at(1)], vec![at(2)]]);
        assert_eq!(stats.batches_written, 2);
        assert_eq!(stats.records_stored, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parsed_line_is_included_in_next_flush() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(&sink, settings(1_000)).await;
        let (tx, mut rx) = mpsc::channel(10);
        let origin = Instant::now();

        let producer = tokio::spawn(async move {
            tx.send(
                r#"{"time":"2024-01-01T00:00:05Z","status":"200","remote_port":"-","request_time":"-"}"#
                    .to_string(),
            )
            .await
            .unwrap();
            sleep_until(origin + Duration::from_millis(1_500)).await;
        });

        pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        let mut expected = AccessRecord::at(at(5));
        expected.status = Some(200);
        assert_eq!(sink.batches(), vec![vec![expected]]);
    }

    #[tokio::test]
    async fn records_at_or_before_mark_are_skipped() {
        let sink = Arc::new(MemorySink::with_existing_max(at(5)));
        let mut pipeline = start(&sink, settings(0)).await;

        let stats = run_lines(&mut pipeline, vec![line(3), line(5), line(7)])
            .await
            .unwrap();

        assert_eq!(stored_times(&sink), vec![at(7)]);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(stats.records_stored, 1);
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn advancing_mark_suppresses_redelivered_lines() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(&sink, settings(0)).await;
        let lines = vec![line(1), line(2), line(3), line(1), line(2), line(4)];

        let stats = run_lines(&mut pipeline, lines).await.unwrap();
        assert_eq!(stored_times(&sink), vec![at(1), at(2), at(3), at(4)]);
        assert_eq!(stats.records_skipped, 2);
        assert_eq!(pipeline.high_water_mark().current(), Some(at(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn same_second_entries_split_across_windows_are_all_stored() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(&sink, settings(1_000)).await;
        let (tx, mut rx) = mpsc::channel(10);
        let origin = Instant::now();

        let producer = tokio::spawn(async move {
            tx.send(r#"{"time":"2024-01-01T00:00:05Z","path":"/a"}"#.to_string())
                .await
                .unwrap();
            sleep_until(origin + Duration::from_millis(1_100)).await;
            tx.send(r#"{"time":"2024-01-01T00:00:05Z","path":"/b"}"#.to_string())
                .await
                .unwrap();
            sleep_until(origin + Duration::from_millis(2_500)).await;
        });

        let stats = pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        let paths: Vec<Option<String>> =
            sink.stored().iter().map(|record| record.path.clone()).collect();
        assert_eq!(paths, vec![Some("/a".to_string()), Some("/b".to_string())]);
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(stats.records_skipped, 0);
    }

    #[tokio::test]
    async fn fixed_mark_lets_redelivered_lines_through() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                advance_mark_after_write: false,
                ..settings(0)
            },
        )
        .await;

        run_lines(&mut pipeline, vec![line(1), line(2), line(1)])
            .await
            .unwrap();
        assert_eq!(stored_times(&sink), vec![at(1), at(2), at(1)]);
        assert_eq!(pipeline.high_water_mark().current(), None);
    }

    #[tokio::test]
    async fn isolated_parse_failures_are_skipped() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                max_consecutive_parse_failures: 2,
                drain_on_shutdown: true,
                ..settings(60_000)
            },
        )
        .await;

        let lines = vec![
            "garbage".to_string(),
            line(1),
            "{}".to_string(),
            r#"{"time":"yesterday"}"#.to_string(),
            line(2),
        ];
        let stats = run_lines(&mut pipeline, lines).await.unwrap();

        assert_eq!(stats.lines_received, 5);
        assert_eq!(stats.parse_failures, 3);
        assert_eq!(stats.records_parsed, 2);
        assert_eq!(stored_times(&sink), vec![at(1), at(2)]);
    }

    #[tokio::test]
    async fn too_many_consecutive_parse_failures_are_fatal() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                max_consecutive_parse_failures: 2,
                ..settings(60_000)
            },
        )
        .await;

        let lines = vec!["a".to_string(), "b".to_string(), "c".to_string(), line(1)];
        let err = run_lines(&mut pipeline, lines).await.unwrap_err();
        assert!(err.to_string().contains("3 consecutive lines"), "{err}");
        assert_eq!(pipeline.stats().lines_received, 3);
    }

    #[tokio::test]
    async fn zero_tolerance_fails_on_first_bad_line() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                max_consecutive_parse_failures: 0,
                ..settings(60_000)
            },
        )
        .await;

        assert!(run_lines(&mut pipeline, vec!["nope".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failed_write_is_fatal_and_nothing_is_stored() {
        let sink = Arc::new(MemorySink::default());
        sink.fail_next_writes(1, || {
            SinkError::Rejected(sqlx::Error::ColumnNotFound("geoip_country_code".into()))
        });
        let mut pipeline = start(&sink, settings(0)).await;

        let err = run_lines(&mut pipeline, vec![line(1), line(2)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bulk write failed"), "{err}");
        assert!(sink.stored().is_empty());
        assert_eq!(pipeline.high_water_mark().current(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_write_retry_stops_cleanly() {
        let sink = Arc::new(MemorySink::default());
        sink.fail_next_writes(5, || SinkError::Connection(sqlx::Error::PoolTimedOut));
        let cancel_token = CancellationToken::new();
        let mut pipeline = Pipeline::initialize(
            sink.clone(),
            PipelineSettings {
                drain_on_shutdown: true,
                retry: RetryPolicy {
                    max_attempts: 5,
                    base_delay: Duration::from_secs(10),
                },
                ..settings(60_000)
            },
            cancel_token.clone(),
        )
        .await
        .unwrap();
        let (tx, mut rx) = mpsc::channel(10);

        let producer = tokio::spawn(async move {
            tx.send(line(1)).await.unwrap();
            tx.send(line(2)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_token.cancel();
        });

        let stats = pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        assert_eq!(sink.write_calls(), 1);
        assert!(sink.stored().is_empty());
        assert_eq!(stats.records_stored, 0);
        assert_eq!(pipeline.high_water_mark().current(), None);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn buffered_records_are_discarded_without_drain() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(&sink, settings(60_000)).await;

        let stats = run_lines(&mut pipeline, vec![line(1), line(2)])
            .await
            .unwrap();
        assert_eq!(sink.write_calls(), 0);
        assert_eq!(stats.records_parsed, 2);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn drain_flushes_partial_buffer() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                drain_on_shutdown: true,
                ..settings(60_000)
            },
        )
        .await;

        run_lines(&mut pipeline, vec![line(1), line(2)])
            .await
            .unwrap();
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(stored_times(&sink), vec![at(1), at(2)]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let sink = Arc::new(MemorySink::default());
        let cancel_token = CancellationToken::new();
        let mut pipeline =
            Pipeline::initialize(sink.clone(), settings(1_000), cancel_token.clone())
                .await
                .unwrap();
        let (_tx, mut rx) = mpsc::channel::<String>(1);

        cancel_token.cancel();
        let stats = pipeline.run(&mut rx).await.unwrap();
        assert_eq!(stats, PipelineStats::default());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_on_first_tick_writes_first_record_immediately() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                flush_on_first_tick: true,
                ..settings(1_000)
            },
        )
        .await;
        let (tx, mut rx) = mpsc::channel(10);
        let origin = Instant::now();

        let producer = tokio::spawn(async move {
            tx.send(line(0)).await.unwrap();
            sleep_until(origin + Duration::from_millis(300)).await;
            tx.send(line(1)).await.unwrap();
            sleep_until(origin + Duration::from_millis(2_000)).await;
        });

        pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        assert_eq!(sink.batches().len(), 2);
        assert_eq!(sink.batches()[0].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_applies_to_a_late_first_record() {
        let sink = Arc::new(MemorySink::default());
        let mut pipeline = start(
            &sink,
            PipelineSettings {
                flush_on_first_tick: true,
                ..settings(1_000)
            },
        )
        .await;
        let (tx, mut rx) = mpsc::channel(10);
        let origin = Instant::now();

        let producer = tokio::spawn({
            let sink = sink.clone();
            async move {
                sleep_until(origin + Duration::from_millis(5_000)).await;
                tx.send(line(0)).await.unwrap();
                tx.send(line(1)).await.unwrap();
                sleep_until(origin + Duration::from_millis(5_100)).await;
                assert_eq!(sink.batches().len(), 1);
                sleep_until(origin + Duration::from_millis(7_000)).await;
            }
        });

        pipeline.run(&mut rx).await.unwrap();
        producer.await.unwrap();

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1]);
    }
}
