//! Parallel checksum validation
//!
//! Entries are partitioned across a bounded set of lanes by cumulative size
//! (greedy longest-processing-time-first): entries are sorted descending by
//! size and each is assigned to the lane with the smallest running byte sum,
//! so no lane stalls on one huge file while the others idle. Digest
//! computation is CPU- and disk-bound, so each lane runs on the blocking
//! thread pool and the lane count defaults to a conservative fraction of
//! host parallelism.
//!
//! Failures are collected, never thrown across lanes: a missing file or a
//! read error marks that one entry invalid and the lane moves on. All lanes
//! join before the phase is considered finished.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ValidationConfig;
use crate::error::{Error, Result};
use crate::manifest::ManifestEntry;
use crate::progress::{Phase, ProgressTracker};

/// Outcome of a validation pass
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    /// Entries whose on-disk digest matches the manifest
    pub valid: Vec<ManifestEntry>,
    /// Entries that are missing, unreadable, or digest-mismatched
    ///
    /// These fold into the download set alongside manifest-declared added
    /// and modified entries.
    pub invalid: Vec<ManifestEntry>,
}

/// Validate `entries` under `base_dir` against their manifest checksums
///
/// Runs `config.concurrency` lanes in parallel, streaming each file through
/// MD5 in `config.chunk_size` blocks and bumping the `Validate` progress
/// counter per block. Invalid entries are classified, not errored: the only
/// error this function returns is [`Error::Cancelled`].
pub async fn validate(
    entries: Vec<ManifestEntry>,
    base_dir: &Path,
    config: &ValidationConfig,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
) -> Result<ValidationOutcome> {
    if entries.is_empty() {
        return Ok(ValidationOutcome::default());
    }

    let lanes = partition_by_size(entries, config.concurrency);
    debug!(lanes = lanes.len(), "starting validation lanes");

    let mut handles = Vec::with_capacity(lanes.len());
    for lane in lanes {
        let base_dir = base_dir.to_path_buf();
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        let chunk_size = config.chunk_size;
        handles.push(tokio::task::spawn_blocking(move || {
            run_lane(lane, &base_dir, chunk_size, &progress, &cancel)
        }));
    }

    let mut outcome = ValidationOutcome::default();
    let mut cancelled = false;
    for handle in handles {
        let lane_outcome = handle
            .await
            .map_err(|e| Error::Other(format!("validation lane panicked: {e}")))?;
        match lane_outcome {
            Ok(lane) => {
                outcome.valid.extend(lane.valid);
                outcome.invalid.extend(lane.invalid);
            }
            Err(Error::Cancelled) => cancelled = true,
            Err(e) => return Err(e),
        }
    }
    if cancelled {
        return Err(Error::Cancelled);
    }

    debug!(
        valid = outcome.valid.len(),
        invalid = outcome.invalid.len(),
        "validation complete"
    );
    Ok(outcome)
}

/// Greedy LPT partitioning: sort descending by size, assign each entry to
/// the lane with the smallest running byte sum
fn partition_by_size(
    mut entries: Vec<ManifestEntry>,
    concurrency: usize,
) -> Vec<Vec<ManifestEntry>> {
    let lane_count = concurrency.max(1).min(entries.len().max(1));
    entries.sort_by(|a, b| b.size.cmp(&a.size));

    let mut lanes: Vec<Vec<ManifestEntry>> = vec![Vec::new(); lane_count];
    let mut sums = vec![0u64; lane_count];
    for entry in entries {
        let lightest = sums
            .iter()
            .enumerate()
            .min_by_key(|&(_, sum)| *sum)
            .map(|(index, _)| index)
            .unwrap_or(0);
        sums[lightest] += entry.size;
        lanes[lightest].push(entry);
    }
    lanes.retain(|lane| !lane.is_empty());
    lanes
}

fn run_lane(
    entries: Vec<ManifestEntry>,
    base_dir: &Path,
    chunk_size: usize,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<ValidationOutcome> {
    let mut outcome = ValidationOutcome::default();
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = base_dir.join(&entry.path);
        match digest_file(&path, chunk_size, progress, cancel) {
            Ok(Some(digest)) if digest == entry.checksum => outcome.valid.push(entry),
            Ok(Some(digest)) => {
                debug!(
                    path = %entry.path,
                    expected = %entry.checksum,
                    actual = %digest,
                    "checksum mismatch"
                );
                outcome.invalid.push(entry);
            }
            Ok(None) => {
                debug!(path = %entry.path, "file missing, marking invalid");
                outcome.invalid.push(entry);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(path = %entry.path, error = %e, "read failed, marking invalid");
                outcome.invalid.push(entry);
            }
        }
    }
    Ok(outcome)
}

/// Stream a file through MD5; `Ok(None)` means the file does not exist
fn digest_file(
    path: &PathBuf,
    chunk_size: usize,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut context = md5::Context::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
        progress.add(Phase::Validate, read as u64);
    }
    Ok(Some(format!("{:x}", context.compute())))
}
