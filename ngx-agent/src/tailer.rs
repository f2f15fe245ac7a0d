//! Line source: follows a growing log file and feeds complete lines into a bounded queue.
//!
//! The file handle stays open between polls. Truncation (size below the read offset) rewinds
//! the same handle to the start; replacement (the path now points at a different inode, or
//! was removed) drains the old handle to its end before the new file is opened from offset 0.

use crate::metrics::{FILE_REOPENS_TOTAL, LINES_READ_TOTAL};
use crate::parsers::utils::{drain_complete_lines, trim_line_bytes};
use anyhow::{Context, Result};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const MAX_READ_CHUNK_BYTES: usize = 8 * 1024 * 1024; // 8 MiB per iteration

#[derive(Clone)]
pub struct TailerConfig {
    pub poll_interval: Duration,
    /// Skip whatever the file holds when the tailer starts. Ignored for files that appear later.
    pub start_at_end: bool,
    pub cancel_token: CancellationToken,
}

async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

struct OpenFile {
    file: fs::File,
    offset: u64,
    identity: Option<FileIdentity>,
}

impl OpenFile {
    /// Returns `Ok(None)` while the file does not exist.
    async fn open(path: &Path, at_end: bool) -> Result<Option<Self>> {
        let mut file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", path.display()))
            }
        };
        let meta = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let offset = if at_end {
            file.seek(SeekFrom::End(0))
                .await
                .with_context(|| format!("failed to seek to end of {}", path.display()))?
        } else {
            0
        };
        Ok(Some(Self {
            file,
            offset,
            identity: FileIdentity::of(&meta),
        }))
    }

    /// Reads up to [`MAX_READ_CHUNK_BYTES`] from the current position.
    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let read = (&mut self.file)
            .take(MAX_READ_CHUNK_BYTES as u64)
            .read_to_end(&mut buffer)
            .await
            .context("failed to read appended bytes")?;
        self.offset = self.offset.saturating_add(read as u64);
        Ok(buffer)
    }

    async fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .context("failed to rewind file")?;
        self.offset = 0;
        Ok(())
    }
}

/// Splits raw bytes into lines and pushes them to the consumer.
struct LineEmitter {
    tx: mpsc::Sender<String>,
    cancel_token: CancellationToken,
    pending: Vec<u8>,
}

impl LineEmitter {
    fn new(tx: mpsc::Sender<String>, cancel_token: CancellationToken) -> Self {
        Self {
            tx,
            cancel_token,
            pending: Vec::new(),
        }
    }

    /// Returns `false` once the consumer is gone or shutdown was requested.
    async fn push(&mut self, bytes: &[u8]) -> bool {
        self.pending.extend_from_slice(bytes);
        for line in drain_complete_lines(&mut self.pending) {
            if !self.emit(line).await {
                return false;
            }
        }
        true
    }

    /// Emits the unterminated tail of a file that will not be read again.
    async fn flush_partial(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let line = std::mem::take(&mut self.pending);
        self.emit(line).await
    }

    fn discard_partial(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    async fn emit(&self, line: Vec<u8>) -> bool {
        let line = trim_line_bytes(line);
        if line.is_empty() {
            return true;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        LINES_READ_TOTAL.inc();

        // A full queue parks the tailer here until the consumer catches up.
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => false,
            sent = self.tx.send(text) => sent.is_ok(),
        }
    }
}

/// Follows `path` until cancelled or until the receiving side of `tx` is dropped.
pub async fn tail_lines(
    path: PathBuf,
    config: TailerConfig,
    tx: mpsc::Sender<String>,
) -> Result<()> {
    let TailerConfig {
        poll_interval,
        start_at_end,
        cancel_token,
    } = config;

    let sleep_interval = if poll_interval.is_zero() {
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
    } else {
        poll_interval
    };

    let mut emitter = LineEmitter::new(tx, cancel_token.clone());
    let mut current: Option<OpenFile> = None;
    let mut first_open = true;
    let mut reported_missing = false;

    loop {
        if cancel_token.is_cancelled() {
            return Ok(());
        }

        if current.is_none() {
            match OpenFile::open(&path, first_open && start_at_end).await {
                Ok(Some(opened)) => {
                    if !first_open {
                        FILE_REOPENS_TOTAL.inc();
                    }
                    info!(path = %path.display(), offset = opened.offset, "following file");
                    current = Some(opened);
                    first_open = false;
                    reported_missing = false;
                    continue;
                }
                Ok(None) => {
                    if !reported_missing {
                        info!(path = %path.display(), "file not found; waiting for it to appear");
                        reported_missing = true;
                    }
                }
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "failed to open file; retrying");
                }
            }
            first_open = false;
            if sleep_or_cancel(sleep_interval, &cancel_token).await {
                return Ok(());
            }
            continue;
        }

        let Some(open) = current.as_mut() else {
            continue;
        };

        let path_meta = match fs::metadata(&path).await {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %path.display(),
                    "metadata unavailable; retrying"
                );
                if sleep_or_cancel(sleep_interval, &cancel_token).await {
                    return Ok(());
                }
                continue;
            }
        };

        let replaced = match &path_meta {
            None => true,
            Some(meta) => open.identity.is_some() && FileIdentity::of(meta) != open.identity,
        };

        if replaced {
            loop {
                let chunk = open.read_chunk().await?;
                if chunk.is_empty() {
                    break;
                }
                if !emitter.push(&chunk).await {
                    return Ok(());
                }
            }
            if !emitter.flush_partial().await {
                return Ok(());
            }
            info!(
                path = %path.display(),
                final_offset = open.offset,
                "file replaced or removed; reopening from start"
            );
            current = None;
            continue;
        }

        let current_size = path_meta.map(|meta| meta.len()).unwrap_or_default();
        if current_size < open.offset {
            let dropped_bytes = emitter.discard_partial();
            warn!(
                path = %path.display(),
                previous_offset = open.offset,
                current_size,
                dropped_bytes,
                "file truncated or rotated; resetting reader state"
            );
            open.rewind().await?;
            FILE_REOPENS_TOTAL.inc();
            continue;
        }

        match open.read_chunk().await {
            Ok(chunk) if !chunk.is_empty() => {
                debug!(
                    path = %path.display(),
                    chunk_len = chunk.len(),
                    offset = open.offset,
                    "read appended bytes"
                );
                if !emitter.push(&chunk).await {
                    return Ok(());
                }
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "failed to read newly appended bytes"
                );
            }
        }

        if sleep_or_cancel(sleep_interval, &cancel_token).await {
            return Ok(());
        }
    }
}
