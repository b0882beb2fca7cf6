//! Shared in-memory fakes and helpers for unit tests

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::manifest::{Manifest, ManifestEntry};
use crate::source::{ByteStream, ContentSource, FetchResponse};

/// Hex MD5 of a byte slice
pub(crate) fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Manifest entry describing `data` stored at `path`
pub(crate) fn entry_for(path: &str, data: &[u8]) -> ManifestEntry {
    ManifestEntry::new(path, data.len() as u64, md5_hex(data))
}

/// Write a file under `dir`, creating parent directories
pub(crate) fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// In-memory [`ContentSource`] with failure-injection knobs
///
/// Records every requested (path, offset) pair so tests can assert on resume
/// behavior. Streams content in 3-byte chunks to exercise chunk loops.
pub(crate) struct FakeSource {
    files: HashMap<String, Vec<u8>>,
    manifest: Option<Manifest>,
    requested_offsets: Mutex<Vec<(String, u64)>>,
    honor_range: bool,
    fail_path: Option<String>,
    fail_once: AtomicBool,
    fail_manifest_fetches: Mutex<u32>,
}

impl FakeSource {
    pub(crate) fn new(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, data)| (name.to_string(), data.to_vec()))
                .collect(),
            manifest: None,
            requested_offsets: Mutex::new(Vec::new()),
            honor_range: true,
            fail_path: None,
            fail_once: AtomicBool::new(false),
            fail_manifest_fetches: Mutex::new(0),
        }
    }

    /// Serve `manifest` from `fetch_manifest`
    pub(crate) fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Make the first stream for `path` fail after one chunk
    pub(crate) fn failing_once_on(mut self, path: &str) -> Self {
        self.fail_path = Some(path.to_string());
        self.fail_once.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` manifest fetches
    pub(crate) fn failing_manifest_fetches(self, count: u32) -> Self {
        *self.fail_manifest_fetches.lock().unwrap() = count;
        self
    }

    /// Ignore range requests, always streaming from byte 0
    pub(crate) fn ignoring_ranges(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Offsets requested for `path`, in order
    pub(crate) fn offsets_for(&self, path: &str) -> Vec<u64> {
        self.requested_offsets
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|&(_, offset)| offset)
            .collect()
    }
}

#[async_trait]
impl ContentSource for FakeSource {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        {
            let mut remaining = self.fail_manifest_fetches.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::ManifestFetch("injected failure".to_string()));
            }
        }
        self.manifest
            .clone()
            .ok_or_else(|| Error::ManifestFetch("no manifest configured".to_string()))
    }

    async fn fetch_range(&self, path: &str, offset: u64) -> Result<FetchResponse> {
        self.requested_offsets
            .lock()
            .unwrap()
            .push((path.to_string(), offset));
        let data = self
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no such file: {path}")))?;

        let (start, resumed) = if self.honor_range {
            (offset as usize, true)
        } else {
            (0, offset == 0)
        };

        let should_fail = self.fail_path.as_deref() == Some(path)
            && self.fail_once.swap(false, Ordering::SeqCst);

        let chunks: Vec<Result<Bytes>> = data[start..]
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream: ByteStream = if should_fail {
            let first = chunks.into_iter().next().into_iter();
            futures::stream::iter(first.chain(std::iter::once(Err(Error::Other(
                "connection reset".to_string(),
            )))))
            .boxed()
        } else {
            futures::stream::iter(chunks).boxed()
        };
        Ok(FetchResponse { resumed, stream })
    }

    async fn content_length(&self, path: &str) -> Result<Option<u64>> {
        Ok(self.files.get(path).map(|d| d.len() as u64))
    }
}
