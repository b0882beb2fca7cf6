//! Competitive-pull download scheduler with byte-range resume
//!
//! All pending entries go into one shared queue; whichever worker finishes
//! its current file first claims the next item. This self-balances even when
//! file sizes vary wildly, unlike a static partition. Downloads are
//! bandwidth-bound, not CPU-bound, so the pool defaults to the same
//! conservative `max(2, cpus / 4)` bound as validation.
//!
//! Each worker resumes partial files via ranged fetches and hands received
//! chunks to a dedicated writer task over a small bounded channel, so a slow
//! disk stalls the socket read only after that bound fills. A network
//! failure mid-transfer leaves the partial file in place for the next
//! attempt; the worker records the failure and moves on to the next queue
//! item without blocking siblings.
//!
//! Completion trust: a file whose on-disk byte count equals the declared
//! size is trusted as complete at this layer. Digests are re-checked only by
//! a later validation pass; re-hashing here would double the CPU cost of the
//! common success path.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::error::{Error, Result, TransferError};
use crate::manifest::ManifestEntry;
use crate::progress::{Phase, ProgressTracker};
use crate::source::ContentSource;

/// Outcome of draining the download queue
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    /// Entries whose on-disk size now matches the declared size
    pub completed: Vec<ManifestEntry>,
    /// Entries that ultimately failed this pass, with their first error
    pub failed: Vec<(ManifestEntry, TransferError)>,
}

impl DownloadOutcome {
    /// Whether every entry completed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Download every entry into `base_dir`, resuming partials
///
/// Drains the whole queue even when entries fail; the caller decides whether
/// a non-empty `failed` set fails the phase. The only error returned is
/// [`Error::Cancelled`].
pub async fn download_all(
    entries: Vec<ManifestEntry>,
    base_dir: &Path,
    source: Arc<dyn ContentSource>,
    config: &DownloadConfig,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
) -> Result<DownloadOutcome> {
    if entries.is_empty() {
        return Ok(DownloadOutcome::default());
    }

    let worker_count = config.concurrency.max(1).min(entries.len());
    let queue: Arc<Mutex<VecDeque<ManifestEntry>>> = Arc::new(Mutex::new(entries.into()));
    debug!(workers = worker_count, "starting download workers");

    let mut handles = Vec::with_capacity(worker_count);
    for worker_index in 0..worker_count {
        let queue = Arc::clone(&queue);
        let source = Arc::clone(&source);
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        let base_dir = base_dir.to_path_buf();
        let buffer_chunks = config.write_buffer_chunks;
        handles.push(tokio::spawn(async move {
            let mut local = DownloadOutcome::default();
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let entry = {
                    let mut queue = queue.lock().map_err(|_| {
                        Error::Other("download queue lock poisoned".to_string())
                    })?;
                    queue.pop_front()
                };
                let Some(entry) = entry else {
                    return Ok(local);
                };
                match download_entry(
                    &entry,
                    &base_dir,
                    source.as_ref(),
                    buffer_chunks,
                    &progress,
                    &cancel,
                )
                .await
                {
                    Ok(()) => local.completed.push(entry),
                    Err(EntryError::Cancelled) => return Err(Error::Cancelled),
                    Err(EntryError::Transfer(e)) => {
                        warn!(worker = worker_index, path = %entry.path, error = %e,
                              "entry failed, continuing with next queue item");
                        local.failed.push((entry, e));
                    }
                }
            }
        }));
    }

    let mut outcome = DownloadOutcome::default();
    let mut cancelled = false;
    for handle in handles {
        match handle
            .await
            .map_err(|e| Error::Other(format!("download worker panicked: {e}")))?
        {
            Ok(local) => {
                outcome.completed.extend(local.completed);
                outcome.failed.extend(local.failed);
            }
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => return Err(e),
        }
    }
    if cancelled {
        return Err(Error::Cancelled);
    }

    debug!(
        completed = outcome.completed.len(),
        failed = outcome.failed.len(),
        "download queue drained"
    );
    Ok(outcome)
}

enum EntryError {
    Transfer(TransferError),
    Cancelled,
}

impl EntryError {
    fn io(entry: &ManifestEntry, e: impl std::fmt::Display) -> Self {
        EntryError::Transfer(TransferError::Io {
            path: entry.path.clone(),
            reason: e.to_string(),
        })
    }

    fn network(entry: &ManifestEntry, e: impl std::fmt::Display) -> Self {
        EntryError::Transfer(TransferError::Network {
            path: entry.path.clone(),
            reason: e.to_string(),
        })
    }
}

async fn download_entry(
    entry: &ManifestEntry,
    base_dir: &Path,
    source: &dyn ContentSource,
    buffer_chunks: usize,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> std::result::Result<(), EntryError> {
    let dest = base_dir.join(&entry.path);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EntryError::io(entry, e))?;
    }

    if entry.size == 0 {
        // Nothing to fetch; just make sure the file exists and is empty.
        tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&dest)
            .await
            .map_err(|e| EntryError::io(entry, e))?;
        return Ok(());
    }

    let mut offset = partial_len(&dest).await.map_err(|e| EntryError::io(entry, e))?;
    if offset == entry.size {
        // Already complete from an earlier attempt; credit the bytes so the
        // phase's progress still reaches its total.
        progress.add(Phase::Download, entry.size);
        return Ok(());
    }
    if offset > entry.size {
        // A partial longer than the declared size is garbage; restart it.
        debug!(path = %entry.path, on_disk = offset, declared = entry.size,
               "oversized partial, truncating");
        truncate(&dest).await.map_err(|e| EntryError::io(entry, e))?;
        offset = 0;
    }

    if offset > 0 {
        debug!(path = %entry.path, offset, "resuming partial download");
    }
    let response = source
        .fetch_range(&entry.path, offset)
        .await
        .map_err(|e| EntryError::network(entry, e))?;
    if !response.resumed && offset > 0 {
        // Source degraded to a full transfer; the stream restarts at byte 0.
        truncate(&dest).await.map_err(|e| EntryError::io(entry, e))?;
        offset = 0;
    }
    // Resumed bytes already on disk count toward phase progress.
    progress.add(Phase::Download, offset);

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&dest)
        .await
        .map_err(|e| EntryError::io(entry, e))?;

    // Decouple disk writes from network reads: the socket loop only stalls
    // once `buffer_chunks` chunks are waiting on the writer.
    let (tx, mut rx) = mpsc::channel::<Bytes>(buffer_chunks.max(1));
    let writer = tokio::spawn(async move {
        let mut file = file;
        while let Some(chunk) = rx.recv().await {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok::<(), std::io::Error>(())
    });

    let mut stream = response.stream;
    let mut stream_error: Option<EntryError> = None;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            stream_error = Some(EntryError::Cancelled);
            break;
        }
        match chunk {
            Ok(chunk) => {
                progress.add(Phase::Download, chunk.len() as u64);
                if tx.send(chunk).await.is_err() {
                    // Writer died; its join result carries the I/O error.
                    break;
                }
            }
            Err(e) => {
                // Partial file stays on disk so the next attempt can resume.
                stream_error = Some(EntryError::network(entry, e));
                break;
            }
        }
    }
    drop(tx);

    let write_result = writer
        .await
        .map_err(|e| EntryError::io(entry, format!("writer task panicked: {e}")))?;
    if let Some(e) = stream_error {
        return Err(e);
    }
    write_result.map_err(|e| EntryError::io(entry, e))?;

    let final_len = partial_len(&dest).await.map_err(|e| EntryError::io(entry, e))?;
    if final_len != entry.size {
        return Err(EntryError::Transfer(TransferError::SizeMismatch {
            path: entry.path.clone(),
            expected: entry.size,
            actual: final_len,
        }));
    }
    Ok(())
}

async fn partial_len(path: &PathBuf) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn truncate(path: &PathBuf) -> std::io::Result<()> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await
        .map(|_| ())
}
