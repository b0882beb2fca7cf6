//! Per-phase progress and throughput tracking
//!
//! Every concurrent lane in the validator and the download scheduler reports
//! byte counts into a shared [`ProgressTracker`]. Counters are atomics, so
//! reporting from any number of lanes is safe and cheap; the throughput
//! sample ring is the only lock-protected piece, and it is held only long
//! enough to push or evict samples.
//!
//! Speed is derived from a bounded, time-ordered sample window (newest pushed,
//! samples older than the window evicted), so it reflects recent throughput
//! rather than a lifetime average.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable sub-phase of a patch or install flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Bundled-asset or package extraction
    Extract,
    /// Checksum validation of local files
    Validate,
    /// Content download
    Download,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Extract => write!(f, "extract"),
            Phase::Validate => write!(f, "validate"),
            Phase::Download => write!(f, "download"),
        }
    }
}

/// Point-in-time view of one phase's progress
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Total bytes this phase will process
    pub total_bytes: u64,
    /// Bytes processed so far
    pub processed_bytes: u64,
    /// Completion ratio clamped to `[0, 1]`; 0 when `total_bytes` is 0
    pub progress: f64,
    /// Recent throughput in bytes per second; 0 with fewer than two samples
    pub speed_bps: u64,
}

/// Progress state for a single phase
///
/// Owned by the component running the phase; external pollers only read
/// snapshots. Counters are monotonically non-decreasing within a phase and
/// reset only when the phase restarts.
#[derive(Debug)]
pub struct PhaseProgress {
    total: AtomicU64,
    processed: AtomicU64,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl PhaseProgress {
    /// Create a tracker with the given throughput averaging window
    pub fn new(window: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Set the total byte count and reset progress, called once per phase start
    pub fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
        }
    }

    /// Record `bytes` of progress; safe to call from any lane concurrently
    pub fn add(&self, bytes: u64) {
        // The counter update and the ring push happen under one lock so the
        // ring stays monotone in both time and byte count; two lanes racing
        // here could otherwise push an inverted pair.
        if let Ok(mut samples) = self.samples.lock() {
            let processed = self.processed.fetch_add(bytes, Ordering::Relaxed) + bytes;
            let now = Instant::now();
            samples.push_back((now, processed));
            Self::evict(&mut samples, now, self.window);
        } else {
            self.processed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Current progress snapshot
    pub fn snapshot(&self) -> Snapshot {
        let total = self.total.load(Ordering::Relaxed);
        let processed = self.processed.load(Ordering::Relaxed);
        let progress = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64).clamp(0.0, 1.0)
        };
        Snapshot {
            total_bytes: total,
            processed_bytes: processed,
            progress,
            speed_bps: self.speed_bps(),
        }
    }

    fn speed_bps(&self) -> u64 {
        let Ok(mut samples) = self.samples.lock() else {
            return 0;
        };
        let now = Instant::now();
        Self::evict(&mut samples, now, self.window);
        let (Some(&(t0, b0)), Some(&(t1, b1))) = (samples.front(), samples.back()) else {
            return 0;
        };
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if samples.len() < 2 || elapsed <= 0.0 {
            return 0;
        }
        (b1.saturating_sub(b0) as f64 / elapsed) as u64
    }

    fn evict(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some(&(t, _)) = samples.front() {
            if now.duration_since(t) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Progress trackers for all observable sub-phases of one worker
#[derive(Debug)]
pub struct ProgressTracker {
    extract: PhaseProgress,
    validate: PhaseProgress,
    download: PhaseProgress,
}

impl ProgressTracker {
    /// Create trackers sharing one throughput window setting
    pub fn new(window: Duration) -> Self {
        Self {
            extract: PhaseProgress::new(window),
            validate: PhaseProgress::new(window),
            download: PhaseProgress::new(window),
        }
    }

    /// The tracker for a specific phase
    pub fn phase(&self, phase: Phase) -> &PhaseProgress {
        match phase {
            Phase::Extract => &self.extract,
            Phase::Validate => &self.validate,
            Phase::Download => &self.download,
        }
    }

    /// Set a phase's total and reset its counters
    pub fn set_total(&self, phase: Phase, bytes: u64) {
        self.phase(phase).set_total(bytes);
    }

    /// Record progress for a phase
    pub fn add(&self, phase: Phase, bytes: u64) {
        self.phase(phase).add(bytes);
    }

    /// Snapshot a phase
    pub fn snapshot(&self, phase: Phase) -> Snapshot {
        self.phase(phase).snapshot()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn zero_total_reports_zero_progress_and_speed() {
        let progress = PhaseProgress::new(Duration::from_secs(1));
        let snap = progress.snapshot();
        assert_eq!(snap.progress, 0.0, "zero total must define progress as 0");
        assert_eq!(snap.speed_bps, 0, "no samples means speed 0");
    }

    #[test]
    fn progress_is_ratio_of_processed_to_total() {
        let progress = PhaseProgress::new(Duration::from_secs(1));
        progress.set_total(200);
        progress.add(50);
        let snap = progress.snapshot();
        assert_eq!(snap.processed_bytes, 50);
        assert!((snap.progress - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_clamps_at_one_when_overreported() {
        let progress = PhaseProgress::new(Duration::from_secs(1));
        progress.set_total(10);
        progress.add(15);
        assert_eq!(
            progress.snapshot().progress,
            1.0,
            "over-reporting must clamp to 1.0, not exceed it"
        );
    }

    #[test]
    fn single_sample_reports_zero_speed() {
        let progress = PhaseProgress::new(Duration::from_secs(5));
        progress.set_total(100);
        progress.add(10);
        assert_eq!(
            progress.snapshot().speed_bps,
            0,
            "fewer than two samples must report speed 0"
        );
    }

    #[test]
    fn speed_reflects_bytes_over_elapsed_time() {
        let progress = PhaseProgress::new(Duration::from_secs(5));
        progress.set_total(1_000_000);
        progress.add(1000);
        std::thread::sleep(Duration::from_millis(50));
        progress.add(1000);
        let speed = progress.snapshot().speed_bps;
        // 1000 bytes over ~50ms = ~20000 B/s; allow wide scheduling tolerance
        assert!(
            speed > 2_000 && speed < 200_000,
            "speed should be in the rough vicinity of 20 kB/s, was {speed}"
        );
    }

    #[test]
    fn samples_older_than_window_are_evicted() {
        let progress = PhaseProgress::new(Duration::from_millis(20));
        progress.set_total(100);
        progress.add(10);
        std::thread::sleep(Duration::from_millis(50));
        // The only sample is now stale; speed falls back to 0.
        assert_eq!(progress.snapshot().speed_bps, 0);
    }

    #[test]
    fn set_total_resets_processed_and_samples() {
        let progress = PhaseProgress::new(Duration::from_secs(1));
        progress.set_total(100);
        progress.add(40);
        progress.set_total(200);
        let snap = progress.snapshot();
        assert_eq!(snap.processed_bytes, 0, "restart must reset the counter");
        assert_eq!(snap.total_bytes, 200);
        assert_eq!(snap.speed_bps, 0, "restart must clear the sample ring");
    }

    #[test]
    fn concurrent_adds_sum_exactly() {
        let progress = Arc::new(PhaseProgress::new(Duration::from_secs(1)));
        progress.set_total(8 * 1000);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        progress.add(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            progress.snapshot().processed_bytes,
            8 * 1000,
            "atomic increments from 8 threads must not lose updates"
        );
    }

    #[test]
    fn concurrent_adds_keep_sample_ring_monotone() {
        let progress = Arc::new(PhaseProgress::new(Duration::from_secs(60)));
        progress.set_total(4 * 500);
        let adders: Vec<_> = (0..4)
            .map(|_| {
                let progress = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        progress.add(1);
                    }
                })
            })
            .collect();
        let snapshotter = {
            let progress = Arc::clone(&progress);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let _ = progress.snapshot();
                }
            })
        };
        for handle in adders {
            handle.join().unwrap();
        }
        snapshotter.join().unwrap();

        let samples = progress.samples.lock().unwrap();
        let mut prev = 0u64;
        for &(_, bytes) in samples.iter() {
            assert!(
                bytes >= prev,
                "ring byte counts must be non-decreasing, saw {bytes} after {prev}"
            );
            prev = bytes;
        }
    }

    #[test]
    fn tracker_routes_phases_independently() {
        let tracker = ProgressTracker::new(Duration::from_secs(1));
        tracker.set_total(Phase::Validate, 100);
        tracker.set_total(Phase::Download, 500);
        tracker.add(Phase::Validate, 100);
        assert_eq!(tracker.snapshot(Phase::Validate).progress, 1.0);
        assert_eq!(tracker.snapshot(Phase::Download).processed_bytes, 0);
        assert_eq!(tracker.snapshot(Phase::Extract).total_bytes, 0);
    }
}
