//! Segment watcher: detects when a segment file has finished being written.
//!
//! ffmpeg does not announce which segment it just closed, so completion is
//! inferred from the outside: a file is done once its size has been seen
//! unchanged (and nonzero) for `stable_polls` consecutive polls. Any size
//! change resets the count. Finished files are finalized, marked dispatched
//! and sent to the pipeline exactly once per session.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureKind, ChunkReady, SegmentFinalizer};
use crate::recordings::is_chunk_file;
use crate::utils::fs::io_error;
use crate::{Error, Result};

/// Watcher tunables.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay between directory scans.
    pub poll_interval: Duration,
    /// Consecutive unchanged observations required before a file counts as done.
    pub stable_polls: u32,
    /// Extension of segment files.
    pub extension: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            stable_polls: 2,
            extension: "mp4".to_string(),
        }
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stable_polls < 2 {
            return Err(Error::config("stable_polls must be at least 2"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Result of observing one file's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting, or the size changed since the last poll.
    Growing,
    /// Unchanged for this many consecutive polls, not yet enough.
    Settling(u32),
    /// Finished; dispatch it now.
    Stable,
    /// Already dispatched this session.
    Dispatched,
}

#[derive(Debug, Clone, Copy)]
struct Track {
    size: u64,
    unchanged: u32,
}

/// Size-stability bookkeeping, independent of the filesystem.
#[derive(Debug)]
pub struct StabilityTracker {
    stable_polls: u32,
    tracks: HashMap<PathBuf, Track>,
    dispatched: HashSet<PathBuf>,
}

impl StabilityTracker {
    pub fn new(stable_polls: u32) -> Self {
        Self {
            stable_polls: stable_polls.max(1),
            tracks: HashMap::new(),
            dispatched: HashSet::new(),
        }
    }

    /// Record the current size of `path`.
    pub fn observe(&mut self, path: &Path, size: u64) -> Observation {
        if self.dispatched.contains(path) {
            return Observation::Dispatched;
        }

        let Some(track) = self.tracks.get_mut(path) else {
            self.tracks.insert(
                path.to_path_buf(),
                Track {
                    size,
                    unchanged: 0,
                },
            );
            return Observation::Growing;
        };

        if track.size != size || size == 0 {
            track.size = size;
            track.unchanged = 0;
            return Observation::Growing;
        }

        track.unchanged += 1;
        if track.unchanged >= self.stable_polls {
            Observation::Stable
        } else {
            Observation::Settling(track.unchanged)
        }
    }

    /// Never report `path` again.
    pub fn mark_dispatched(&mut self, path: &Path) {
        self.tracks.remove(path);
        self.dispatched.insert(path.to_path_buf());
    }

    pub fn is_dispatched(&self, path: &Path) -> bool {
        self.dispatched.contains(path)
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.len()
    }

    /// Drop tracking state for files that are no longer present.
    ///
    /// The dispatched set is kept so a file that reappears is not sent twice.
    pub fn retain_present(&mut self, present: &HashSet<PathBuf>) {
        self.tracks.retain(|path, _| present.contains(path));
    }
}

/// A segment file seen during a scan.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Polls a directory and emits [`ChunkReady`] for finished segments.
pub struct SegmentWatcher {
    dir: PathBuf,
    config: WatcherConfig,
    finalizer: Arc<dyn SegmentFinalizer>,
    tracker: StabilityTracker,
}

impl SegmentWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        config: WatcherConfig,
        finalizer: Arc<dyn SegmentFinalizer>,
    ) -> Self {
        let tracker = StabilityTracker::new(config.stable_polls);
        Self {
            dir: dir.into(),
            config,
            finalizer,
            tracker,
        }
    }

    pub fn tracker(&self) -> &StabilityTracker {
        &self.tracker
    }

    /// Mark every segment already in the directory as dispatched.
    ///
    /// Leftovers from earlier sessions are not this session's chunks.
    pub async fn seed_existing(&mut self) -> Result<usize> {
        let candidates = self.list_candidates().await?;
        for candidate in &candidates {
            self.tracker.mark_dispatched(&candidate.path);
        }
        if !candidates.is_empty() {
            info!(
                count = candidates.len(),
                dir = %self.dir.display(),
                "Ignoring pre-existing segments"
            );
        }
        Ok(candidates.len())
    }

    async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("reading segment directory", &self.dir, e)),
        };

        let mut candidates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("reading segment directory", &self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_chunk_file(name, &self.config.extension) {
                continue;
            }
            // The file may vanish between listing and stat.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            candidates.push(Candidate {
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        // Creation order as far as the filesystem tells us.
        candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(candidates)
    }

    /// Scan once, dispatching every segment that became stable.
    ///
    /// Returns the number of chunks dispatched.
    pub async fn scan_once(&mut self, chunk_tx: &mpsc::Sender<ChunkReady>) -> Result<usize> {
        let candidates = self.list_candidates().await?;
        let present: HashSet<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
        let mut dispatched = 0;

        for candidate in candidates {
            match self.tracker.observe(&candidate.path, candidate.size) {
                Observation::Stable => {}
                Observation::Settling(polls) => {
                    debug!(path = %candidate.path.display(), polls, "Segment size unchanged");
                    continue;
                }
                Observation::Growing | Observation::Dispatched => continue,
            }

            if let Err(e) = self.finalizer.finalize(&candidate.path).await {
                warn!(
                    chunk = %candidate.path.display(),
                    error = %e,
                    "Finalize failed, dispatching original segment"
                );
            }
            self.tracker.mark_dispatched(&candidate.path);

            info!(chunk = %candidate.path.display(), size = candidate.size, "Segment ready");
            if chunk_tx
                .send(ChunkReady::new(candidate.path, CaptureKind::Segment))
                .await
                .is_err()
            {
                return Err(Error::Other("chunk receiver closed".to_string()));
            }
            dispatched += 1;
        }

        self.tracker.retain_present(&present);
        Ok(dispatched)
    }

    /// Poll until `cancel` fires. Scan errors are logged and the loop keeps
    /// its dispatched set, so no segment is ever sent twice.
    pub fn spawn(
        mut self,
        chunk_tx: mpsc::Sender<ChunkReady>,
        cancel: CancellationToken,
    ) -> JoinHandle<StabilityTracker> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(dir = %self.dir.display(), "Segment watcher started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.scan_once(&chunk_tx).await {
                            if chunk_tx.is_closed() {
                                warn!("Chunk receiver closed, stopping segment watcher");
                                break;
                            }
                            warn!(error = %e, "Segment scan failed");
                        }
                    }
                }
            }

            debug!(dispatched = self.tracker.dispatched_count(), "Segment watcher stopped");
            self.tracker
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::NoopFinalizer;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Feed a size sequence and return the poll indices that produced `Stable`.
    fn stable_at(tracker: &mut StabilityTracker, path: &Path, sizes: &[u64]) -> Vec<usize> {
        let mut hits = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            if tracker.observe(path, *size) == Observation::Stable {
                tracker.mark_dispatched(path);
                hits.push(i);
            }
        }
        hits
    }

    #[test]
    fn test_stable_after_n_unchanged_polls() {
        let mut tracker = StabilityTracker::new(2);
        let path = Path::new("chunk_a.mp4");
        assert_eq!(tracker.observe(path, 10), Observation::Growing);
        assert_eq!(tracker.observe(path, 20), Observation::Growing);
        assert_eq!(tracker.observe(path, 20), Observation::Settling(1));
        assert_eq!(tracker.observe(path, 20), Observation::Stable);
        tracker.mark_dispatched(path);
        assert_eq!(tracker.observe(path, 20), Observation::Dispatched);
    }

    #[test]
    fn test_shrink_resets_counter() {
        let mut tracker = StabilityTracker::new(3);
        let path = Path::new("chunk_a.mp4");
        tracker.observe(path, 100);
        assert_eq!(tracker.observe(path, 100), Observation::Settling(1));
        assert_eq!(tracker.observe(path, 100), Observation::Settling(2));
        assert_eq!(tracker.observe(path, 40), Observation::Growing);
        assert_eq!(tracker.observe(path, 40), Observation::Settling(1));
    }

    #[test]
    fn test_empty_file_never_stable() {
        let mut tracker = StabilityTracker::new(2);
        let path = Path::new("chunk_a.mp4");
        assert!(stable_at(&mut tracker, path, &[0; 20]).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Growth followed by N unchanged polls dispatches exactly once,
        /// on the N-th unchanged poll.
        #[test]
        fn prop_dispatch_exactly_once_after_n_stable(
            growth in proptest::collection::vec(1u64..1_000, 1..20),
            n in 2u32..6,
            extra in 0usize..10,
        ) {
            let mut sizes: Vec<u64> = growth
                .iter()
                .scan(0u64, |acc, step| {
                    *acc += step;
                    Some(*acc)
                })
                .collect();
            let last = *sizes.last().unwrap();
            sizes.extend(std::iter::repeat_n(last, n as usize + extra));

            let mut tracker = StabilityTracker::new(n);
            let hits = stable_at(&mut tracker, Path::new("chunk_p.mp4"), &sizes);

            prop_assert_eq!(hits, vec![growth.len() - 1 + n as usize]);
        }

        /// Any size change, including a shrink, restarts the count: the file
        /// is never dispatched before N unchanged polls follow the last change.
        #[test]
        fn prop_instability_only_delays(
            sizes in proptest::collection::vec(1u64..5, 1..40),
            n in 2u32..5,
        ) {
            let mut tracker = StabilityTracker::new(n);
            let hits = stable_at(&mut tracker, Path::new("chunk_p.mp4"), &sizes);

            prop_assert!(hits.len() <= 1);
            if let Some(&hit) = hits.first() {
                let n = n as usize;
                prop_assert!(hit >= n);
                let window = &sizes[hit - n..=hit];
                prop_assert!(window.iter().all(|s| *s == sizes[hit]));
            }
        }
    }

    async fn write(path: &Path, len: usize) {
        tokio::fs::write(path, vec![7u8; len]).await.unwrap();
    }

    fn watcher(dir: &Path, stable_polls: u32) -> SegmentWatcher {
        let config = WatcherConfig {
            poll_interval: Duration::from_millis(20),
            stable_polls,
            extension: "mp4".to_string(),
        };
        SegmentWatcher::new(dir, config, Arc::new(NoopFinalizer))
    }

    #[tokio::test]
    async fn test_scan_dispatches_once() {
        let temp = TempDir::new().unwrap();
        let segment = temp.path().join("chunk_20240101_000000.mp4");
        write(&segment, 10).await;
        write(&temp.path().join("notes.txt"), 10).await;

        let mut watcher = watcher(temp.path(), 2);
        let (tx, mut rx) = mpsc::channel(8);

        assert_eq!(watcher.scan_once(&tx).await.unwrap(), 0);
        write(&segment, 20).await;
        assert_eq!(watcher.scan_once(&tx).await.unwrap(), 0);
        assert_eq!(watcher.scan_once(&tx).await.unwrap(), 0);
        assert_eq!(watcher.scan_once(&tx).await.unwrap(), 1);

        // Later growth must not cause a second dispatch.
        write(&segment, 30).await;
        for _ in 0..4 {
            assert_eq!(watcher.scan_once(&tx).await.unwrap(), 0);
        }

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.path, segment);
        assert_eq!(chunk.origin, CaptureKind::Segment);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_seeded_segments_are_ignored() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("chunk_20230101_000000.mp4");
        write(&old, 10).await;

        let mut watcher = watcher(temp.path(), 2);
        assert_eq!(watcher.seed_existing().await.unwrap(), 1);

        let (tx, mut rx) = mpsc::channel(8);
        for _ in 0..4 {
            watcher.scan_once(&tx).await.unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert!(watcher.tracker().is_dispatched(&old));
    }

    #[tokio::test]
    async fn test_spawned_watcher_emits_and_stops() {
        let temp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = watcher(temp.path(), 2).spawn(tx, cancel.clone());

        let segment = temp.path().join("chunk_20240101_000001.mp4");
        write(&segment, 64).await;

        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.path, segment);

        cancel.cancel();
        let tracker = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.dispatched_count(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(WatcherConfig::default().validate().is_ok());
        let bad = WatcherConfig {
            stable_polls: 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
