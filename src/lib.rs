//! # patch-dl
//!
//! Backend library for incremental content updates: manifest diffing,
//! parallel checksum validation, resumable concurrent downloads, and a
//! phased flow with pluggable retry.
//!
//! ## Design Philosophy
//!
//! patch-dl is designed to be:
//! - **Incremental** - Only bytes that changed (or rotted on disk) are fetched
//! - **Resumable** - Interrupted transfers continue from the partial file
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use patch_dl::{
//!     AlwaysPatch, Config, EventBus, HttpSource, Orchestrator, PatchWorker, Worker,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         base_dir: "/srv/app/content".into(),
//!         ..Default::default()
//!     };
//!     let source = Arc::new(HttpSource::new(
//!         "https://cdn.example.com/manifest.json".parse()?,
//!         "https://cdn.example.com/files/".parse()?,
//!     ));
//!     let events = EventBus::new();
//!
//!     // Subscribe to events
//!     let mut rx = events.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = rx.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let orchestrator = Orchestrator::new(events.clone());
//!     orchestrator
//!         .run(&AlwaysPatch, |_| {
//!             vec![Box::new(PatchWorker::new(config, source, events)) as Box<dyn Worker>]
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Concurrent, resumable download scheduler
pub mod download;
/// Error types
pub mod error;
/// Event bus and event types
pub mod events;
/// Archive extraction
pub mod extraction;
/// Manifest model and diffing
pub mod manifest;
/// Flow orchestration and retry loop
pub mod orchestrator;
/// Per-phase progress tracking
pub mod progress;
/// Retry policy seam with exponential backoff
pub mod retry;
/// Content source abstractions and the HTTP implementation
pub mod source;
/// Parallel checksum validation
pub mod validate;
/// Patch and install workers
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, RetryConfig, ValidationConfig};
pub use download::{download_all, DownloadOutcome};
pub use error::{Error, ExtractionError, ManifestError, Result, TransferError};
pub use events::{Event, EventBus};
pub use extraction::ZipAssetSource;
pub use manifest::{DiffInfo, Manifest, ManifestEntry};
pub use orchestrator::{AlwaysPatch, CheckDecision, CheckOutcome, Orchestrator};
pub use progress::{Phase, ProgressTracker, Snapshot};
pub use retry::{ExponentialBackoff, RetryDecision, RetryPolicy};
pub use source::{AssetSource, ContentSource, FetchResponse, HttpSource, Installer};
pub use validate::{validate, ValidationOutcome};
pub use worker::{FlowPhase, InstallWorker, PatchWorker, Worker};
