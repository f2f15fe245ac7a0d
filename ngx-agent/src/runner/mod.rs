//! Application runner for the ngx-agent.
//!
//! Wires the line source, the pipeline coordinator and the sink together, and makes sure the
//! sink is released however the run ends.

use crate::config::Config;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::sink::{PgSink, RecordSink};
use crate::tailer::{tail_lines, TailerConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Environment variable to force immediate flushing of every record (testing mode).
pub const FORCE_FLUSH_ENV: &str = "NGX_AGENT_FORCE_FLUSH";

const TAILER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to the database and runs the agent until `cancel_token` fires or a fatal error occurs.
pub async fn run(config: &Config, cancel_token: CancellationToken) -> Result<()> {
    info!(
        log_file = %config.log_file_path().display(),
        schema = %config.sink.schema,
        table = %config.sink.table,
        "ngx-agent starting"
    );

    let sink = PgSink::connect(&config.sink)
        .await
        .context("initializing sink")?;
    run_with_sink(config, Arc::new(sink), cancel_token).await
}

/// Runs the agent against an already constructed sink. The sink is closed before returning.
pub async fn run_with_sink(
    config: &Config,
    sink: Arc<dyn RecordSink>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let result = run_pipeline(config, sink.clone(), cancel_token.clone()).await;
    cancel_token.cancel();
    sink.close().await;
    result
}

async fn run_pipeline(
    config: &Config,
    sink: Arc<dyn RecordSink>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let flush_window = resolve_flush_window(config.flush_window());
    let settings = PipelineSettings::from_config(config, flush_window);
    let mut pipeline = Pipeline::initialize(sink, settings, cancel_token.clone()).await?;

    let (line_tx, mut line_rx) = mpsc::channel(config.source.queue_capacity.max(1));
    let tailer_config = TailerConfig {
        poll_interval: config.poll_interval(),
        start_at_end: config.source.start_at_end,
        cancel_token: cancel_token.clone(),
    };
    let tailer_handle = tokio::spawn(tail_lines(config.log_file_path(), tailer_config, line_tx));

    let mut coordinator = tokio::spawn(async move { pipeline.run(&mut line_rx).await });

    let joined = tokio::select! {
        joined = &mut coordinator => Some(joined),
        _ = cancel_token.cancelled() => None,
    };

    let grace = Duration::from_millis(config.pipeline.shutdown_grace_ms);
    let joined = match joined {
        Some(joined) => Some(joined),
        None => {
            info!(grace_ms = grace.as_millis() as u64, "shutdown requested; waiting for pipeline");
            match timeout(grace, &mut coordinator).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    warn!("pipeline did not stop within grace period; aborting");
                    coordinator.abort();
                    None
                }
            }
        }
    };

    // Whatever ended the coordinator, the tailer has no consumer left.
    cancel_token.cancel();
    let tailer_result = stop_tailer(tailer_handle).await;

    if let Some(joined) = joined {
        joined
            .context("pipeline task panicked")?
            .context("ingesting log lines")?;
    }
    tailer_result.context("following log file")
}

async fn stop_tailer(mut handle: JoinHandle<Result<()>>) -> Result<()> {
    match timeout(TAILER_STOP_TIMEOUT, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => Err(anyhow::Error::new(err).context("tailer task panicked")),
        Err(_) => {
            warn!("tailer did not stop within timeout; aborting");
            handle.abort();
            Ok(())
        }
    }
}

/// Resolve the effective flush window based on config and environment overrides.
pub fn resolve_flush_window(configured: Duration) -> Duration {
    flush_window_override(std::env::var(FORCE_FLUSH_ENV).ok().as_deref(), configured)
}

fn flush_window_override(value: Option<&str>, configured: Duration) -> Duration {
    let Some(value) = value else {
        return configured;
    };

    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
        warn!(
            env = FORCE_FLUSH_ENV,
            configured_ms = configured.as_millis() as u64,
            "forcing zero flush window for immediate flush (testing mode)"
        );
        Duration::ZERO
    } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" || trimmed.is_empty() {
        configured
    } else {
        warn!(
            env = FORCE_FLUSH_ENV,
            value = trimmed,
            configured_ms = configured.as_millis() as u64,
            "unrecognized value for {}; using configured flush window",
            FORCE_FLUSH_ENV
        );
        configured
    }
}

/// Completes on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed while waiting for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "shutdown signal received"),
        _ = terminate => info!(signal = "SIGTERM", "shutdown signal received"),
    }
}
