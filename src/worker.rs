//! Patch and install workers
//!
//! A worker owns everything private to one update unit: its manifest pair,
//! its diff, its progress trackers, and its last error. The orchestrator
//! never reaches into that state; it only invokes the three phase operations
//! in order and reads the observable accessors.
//!
//! Two variants exist: [`PatchWorker`] applies an incremental content patch
//! (diff, validate, download the delta, delete obsolete files), and
//! [`InstallWorker`] delivers a monolithic package (download, extract,
//! install) with no diff/validate step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::download::download_all;
use crate::error::{Error, ManifestError, Result};
use crate::events::{Event, EventBus};
use crate::extraction::extract_zip;
use crate::manifest::{DiffInfo, Manifest, ManifestEntry};
use crate::progress::{Phase, ProgressTracker};
use crate::source::{AssetSource, ContentSource, Installer};
use crate::validate::validate;

/// Phase of the retry state machine, the unit of retry granularity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowPhase {
    /// Prepare: manifests, diff, validation
    Preprocess,
    /// Apply: downloads, baseline update
    Process,
    /// Clean up: deletions, install step
    Postprocess,
}

impl std::fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowPhase::Preprocess => write!(f, "preprocess"),
            FlowPhase::Process => write!(f, "process"),
            FlowPhase::Postprocess => write!(f, "postprocess"),
        }
    }
}

/// Three-phase worker contract driven by the orchestrator
///
/// Phase operations are asynchronous and may suspend for network I/O, disk
/// I/O, or nothing at all; they return `Ok` or the error that failed the
/// phase. The worker additionally caches its last error for external
/// observers polling [`Worker::error`].
#[async_trait]
pub trait Worker: Send {
    /// Stable name used in events and retry callbacks
    fn name(&self) -> &str;

    /// First phase: prepare state for the main operation
    async fn preprocess(&mut self) -> Result<()>;

    /// Second phase: perform the main operation
    async fn process(&mut self) -> Result<()>;

    /// Third phase: clean up after a successful main operation
    async fn postprocess(&mut self) -> Result<()>;

    /// Progress trackers for the observable sub-phases
    fn tracker(&self) -> Arc<ProgressTracker>;

    /// Last phase failure, if any (None = no error)
    fn error(&self) -> Option<String>;

    /// Record or clear the last failure (called by the orchestrator after
    /// each phase attempt)
    fn set_error(&mut self, error: Option<String>);

    /// Total bytes of a sub-phase
    fn size(&self, phase: Phase) -> u64 {
        self.tracker().snapshot(phase).total_bytes
    }

    /// Completion ratio of a sub-phase in `[0, 1]`
    fn progress(&self, phase: Phase) -> f64 {
        self.tracker().snapshot(phase).progress
    }

    /// Recent throughput of a sub-phase in bytes per second
    fn speed(&self, phase: Phase) -> u64 {
        self.tracker().snapshot(phase).speed_bps
    }
}

/// Worker applying an incremental content patch
pub struct PatchWorker {
    name: String,
    config: Config,
    source: Arc<dyn ContentSource>,
    assets: Option<Arc<dyn AssetSource>>,
    events: EventBus,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    local: Option<Manifest>,
    remote: Option<Manifest>,
    diff: Option<DiffInfo>,
    pending: Vec<ManifestEntry>,
    last_error: Option<String>,
}

impl PatchWorker {
    /// Create a patch worker
    pub fn new(config: Config, source: Arc<dyn ContentSource>, events: EventBus) -> Self {
        let tracker = Arc::new(ProgressTracker::new(config.speed_window));
        Self {
            name: "patch".to_string(),
            config,
            source,
            assets: None,
            events,
            tracker,
            cancel: CancellationToken::new(),
            local: None,
            remote: None,
            diff: None,
            pending: Vec::new(),
            last_error: None,
        }
    }

    /// Use a bundled-asset source when the local manifest is missing/corrupt
    pub fn with_asset_source(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Observe this cancellation token at chunk boundaries
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the worker name used in events and retry callbacks
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The computed diff, once Preprocess has run
    pub fn diff(&self) -> Option<&DiffInfo> {
        self.diff.as_ref()
    }

    /// The current local baseline manifest, once Preprocess has run
    ///
    /// Updated to the remote manifest when Process commits.
    pub fn baseline(&self) -> Option<&Manifest> {
        self.local.as_ref()
    }

    /// Load the local manifest, extracting bundled assets on miss/corruption
    ///
    /// A manifest still missing after extraction yields an empty baseline,
    /// not an error: everything then classifies as added.
    async fn load_local_manifest(&mut self) -> Result<Manifest> {
        let path = self.config.manifest_path();
        match Manifest::load(&path) {
            Ok(manifest) => return Ok(manifest),
            Err(ManifestError::NotFound { .. }) => {
                debug!(path = %path.display(), "no local manifest");
            }
            Err(ManifestError::Corrupt { ref reason, .. }) => {
                warn!(path = %path.display(), reason = %reason, "local manifest corrupt");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(assets) = self.assets.clone() {
            self.events.emit(Event::PhaseStarted {
                worker: self.name.clone(),
                phase: Phase::Extract,
                total_bytes: 0,
            });
            match assets.extract(&self.config.base_dir).await {
                Ok(written) => {
                    // Total is unknown up front; settle it once extraction ends.
                    self.tracker.set_total(Phase::Extract, written);
                    self.tracker.add(Phase::Extract, written);
                    self.events.emit(Event::PhaseSucceeded {
                        worker: self.name.clone(),
                        phase: Phase::Extract,
                    });
                }
                Err(e) => {
                    self.events.emit(Event::PhaseFailed {
                        worker: self.name.clone(),
                        phase: Phase::Extract,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        match Manifest::load(&path) {
            Ok(manifest) => Ok(manifest),
            Err(ManifestError::NotFound { .. }) | Err(ManifestError::Corrupt { .. }) => {
                Ok(Manifest::empty())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Worker for PatchWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn preprocess(&mut self) -> Result<()> {
        let local = self.load_local_manifest().await?;
        let remote = self.source.fetch_manifest().await?;
        let diff = local.diff(&remote);
        info!(
            worker = %self.name,
            added = diff.added.len(),
            modified = diff.modified.len(),
            deleted = diff.deleted.len(),
            "manifest diff computed"
        );

        // Validate every remote entry: files the diff already marks added or
        // modified come back invalid (missing or mismatched) and fold into
        // the download set together with silently corrupted unchanged files.
        self.tracker.set_total(Phase::Validate, remote.total_size());
        self.events.emit(Event::PhaseStarted {
            worker: self.name.clone(),
            phase: Phase::Validate,
            total_bytes: remote.total_size(),
        });
        let reporter = spawn_progress_reporter(
            self.events.clone(),
            self.name.clone(),
            Phase::Validate,
            Arc::clone(&self.tracker),
        );
        let outcome = validate(
            remote.entries.clone(),
            &self.config.base_dir,
            &self.config.validation,
            Arc::clone(&self.tracker),
            self.cancel.clone(),
        )
        .await;
        reporter.abort();
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.emit(Event::PhaseFailed {
                    worker: self.name.clone(),
                    phase: Phase::Validate,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        self.events.emit(Event::PhaseSucceeded {
            worker: self.name.clone(),
            phase: Phase::Validate,
        });

        // An invalid file whose length already matches the manifest (content
        // changed but size did not, or in-place corruption) would defeat the
        // scheduler's size-based completion shortcut. Drop it here so the
        // entry is fetched from scratch; shorter partials keep their
        // resumable prefix.
        for entry in &outcome.invalid {
            let path = self.config.base_dir.join(&entry.path);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.len() >= entry.size => {
                    debug!(path = %entry.path, len = meta.len(), "discarding stale full-length file");
                    tokio::fs::remove_file(&path).await?;
                }
                _ => {}
            }
        }

        self.pending = outcome.invalid;
        self.local = Some(local);
        self.remote = Some(remote);
        self.diff = Some(diff);
        Ok(())
    }

    async fn process(&mut self) -> Result<()> {
        let remote = self
            .remote
            .clone()
            .ok_or_else(|| Error::Other("process called before preprocess".to_string()))?;

        let total: u64 = self.pending.iter().map(|e| e.size).sum();
        self.tracker.set_total(Phase::Download, total);
        self.events.emit(Event::PhaseStarted {
            worker: self.name.clone(),
            phase: Phase::Download,
            total_bytes: total,
        });
        let reporter = spawn_progress_reporter(
            self.events.clone(),
            self.name.clone(),
            Phase::Download,
            Arc::clone(&self.tracker),
        );
        let result = download_all(
            self.pending.clone(),
            &self.config.base_dir,
            Arc::clone(&self.source),
            &self.config.download,
            Arc::clone(&self.tracker),
            self.cancel.clone(),
        )
        .await;
        reporter.abort();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.emit(Event::PhaseFailed {
                    worker: self.name.clone(),
                    phase: Phase::Download,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        if !outcome.is_complete() {
            let error = Error::PhaseFailed {
                phase: FlowPhase::Process,
                failed: outcome.failed.len(),
                detail: outcome.failed[0].1.to_string(),
            };
            self.events.emit(Event::PhaseFailed {
                worker: self.name.clone(),
                phase: Phase::Download,
                error: error.to_string(),
            });
            return Err(error);
        }
        self.events.emit(Event::PhaseSucceeded {
            worker: self.name.clone(),
            phase: Phase::Download,
        });

        // All bytes are on disk; commit the remote manifest as the new
        // baseline. This is the only point where the local manifest changes.
        remote.save(&self.config.manifest_path())?;
        self.local = Some(remote);
        // Completed entries stay completed across a Postprocess retry.
        self.pending.clear();
        Ok(())
    }

    async fn postprocess(&mut self) -> Result<()> {
        let diff = self
            .diff
            .clone()
            .ok_or_else(|| Error::Other("postprocess called before preprocess".to_string()))?;

        let mut failed = 0usize;
        let mut first_error = None;
        for entry in &diff.deleted {
            let path = self.config.base_dir.join(&entry.path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %entry.path, "deleted obsolete file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "failed to delete obsolete file");
                    failed += 1;
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        if failed > 0 {
            return Err(Error::PhaseFailed {
                phase: FlowPhase::Postprocess,
                failed,
                detail: first_error.unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    fn error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }
}

/// Worker delivering a monolithic application package
///
/// Structurally identical to [`PatchWorker`] but with no diff/validate step:
/// Preprocess resolves the package size, Process downloads (resumable) and
/// extracts it, Postprocess runs the external install step and removes the
/// package file.
pub struct InstallWorker {
    name: String,
    config: Config,
    package_path: String,
    source: Arc<dyn ContentSource>,
    installer: Arc<dyn Installer>,
    events: EventBus,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    package_size: Option<u64>,
    last_error: Option<String>,
}

impl InstallWorker {
    /// Create an install worker fetching `package_path` from the source
    pub fn new(
        config: Config,
        package_path: impl Into<String>,
        source: Arc<dyn ContentSource>,
        installer: Arc<dyn Installer>,
        events: EventBus,
    ) -> Self {
        let tracker = Arc::new(ProgressTracker::new(config.speed_window));
        Self {
            name: "install".to_string(),
            config,
            package_path: package_path.into(),
            source,
            installer,
            events,
            tracker,
            cancel: CancellationToken::new(),
            package_size: None,
            last_error: None,
        }
    }

    /// Observe this cancellation token at chunk boundaries
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn package_file(&self) -> PathBuf {
        self.config.base_dir.join(&self.package_path)
    }

    fn package_dir(&self) -> PathBuf {
        self.config.base_dir.join("package")
    }
}

#[async_trait]
impl Worker for InstallWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn preprocess(&mut self) -> Result<()> {
        let size = self
            .source
            .content_length(&self.package_path)
            .await?
            .ok_or_else(|| {
                Error::Other(format!(
                    "source cannot report size of package {}",
                    self.package_path
                ))
            })?;
        debug!(package = %self.package_path, size, "resolved package size");
        self.package_size = Some(size);
        Ok(())
    }

    async fn process(&mut self) -> Result<()> {
        let size = self
            .package_size
            .ok_or_else(|| Error::Other("process called before preprocess".to_string()))?;

        // The package has no manifest digest; completion is byte-count only.
        let entry = ManifestEntry::new(self.package_path.clone(), size, String::new());
        self.tracker.set_total(Phase::Download, size);
        self.events.emit(Event::PhaseStarted {
            worker: self.name.clone(),
            phase: Phase::Download,
            total_bytes: size,
        });
        let reporter = spawn_progress_reporter(
            self.events.clone(),
            self.name.clone(),
            Phase::Download,
            Arc::clone(&self.tracker),
        );
        let result = download_all(
            vec![entry],
            &self.config.base_dir,
            Arc::clone(&self.source),
            &self.config.download,
            Arc::clone(&self.tracker),
            self.cancel.clone(),
        )
        .await;
        reporter.abort();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.events.emit(Event::PhaseFailed {
                    worker: self.name.clone(),
                    phase: Phase::Download,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        if !outcome.is_complete() {
            let error = Error::PhaseFailed {
                phase: FlowPhase::Process,
                failed: 1,
                detail: outcome.failed[0].1.to_string(),
            };
            self.events.emit(Event::PhaseFailed {
                worker: self.name.clone(),
                phase: Phase::Download,
                error: error.to_string(),
            });
            return Err(error);
        }
        self.events.emit(Event::PhaseSucceeded {
            worker: self.name.clone(),
            phase: Phase::Download,
        });

        self.events.emit(Event::PhaseStarted {
            worker: self.name.clone(),
            phase: Phase::Extract,
            total_bytes: 0,
        });
        let archive = self.package_file();
        let dest = self.package_dir();
        tokio::fs::create_dir_all(&dest).await?;
        let extracted = tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
            .await
            .map_err(|e| Error::Other(format!("extraction task panicked: {e}")))?;
        match extracted {
            Ok(written) => {
                self.tracker.set_total(Phase::Extract, written);
                self.tracker.add(Phase::Extract, written);
                self.events.emit(Event::PhaseSucceeded {
                    worker: self.name.clone(),
                    phase: Phase::Extract,
                });
                Ok(())
            }
            Err(e) => {
                self.events.emit(Event::PhaseFailed {
                    worker: self.name.clone(),
                    phase: Phase::Extract,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn postprocess(&mut self) -> Result<()> {
        self.installer.install(&self.package_dir()).await?;
        match tokio::fs::remove_file(self.package_file()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(package = %self.package_path, "package installed");
        Ok(())
    }

    fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    fn error(&self) -> Option<String> {
        self.last_error.clone()
    }

    fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }
}

/// Emit a `PhaseProgress` event every 200ms until aborted
fn spawn_progress_reporter(
    events: EventBus,
    worker: String,
    phase: Phase,
    tracker: Arc<ProgressTracker>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(200));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let snapshot = tracker.snapshot(phase);
            events.emit(Event::PhaseProgress {
                worker: worker.clone(),
                phase,
                processed_bytes: snapshot.processed_bytes,
                total_bytes: snapshot.total_bytes,
                speed_bps: snapshot.speed_bps,
            });
        }
    })
}
