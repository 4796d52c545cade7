//! Chunk file naming and recordings-directory maintenance.
//!
//! Every chunk file carries its capture timestamp in its name
//! (`chunk_YYYYMMDD_HHMMSS.<ext>`). The directory listing is the only handle
//! the watcher has for discovering new segments, so the naming scheme is
//! shared by the ffmpeg segment muxer, the fallback writer and the watcher.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::{info, warn};

use crate::Result;
use crate::utils::fs::io_error;

/// Prefix of every chunk file.
pub const CHUNK_PREFIX: &str = "chunk_";

/// strftime pattern of the timestamp part.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Extensions removed by [`purge_recordings`].
const VIDEO_EXTENSIONS: &[&str] = &["avi", "mp4", "mov", "mkv", "webm", "y4m"];

/// File name for a chunk captured at `at`.
pub fn chunk_file_name<Tz: TimeZone>(at: &DateTime<Tz>, ext: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}{}.{}", CHUNK_PREFIX, at.format(TIMESTAMP_FORMAT), ext)
}

/// A fresh chunk path in `dir` for the current local time.
///
/// Adds a numeric suffix if a file with the same second already exists.
pub fn next_chunk_path(dir: &Path, ext: &str) -> PathBuf {
    let now = Local::now();
    let candidate = dir.join(chunk_file_name(&now, ext));
    if !candidate.exists() {
        return candidate;
    }

    let stem = format!("{}{}", CHUNK_PREFIX, now.format(TIMESTAMP_FORMAT));
    (1u32..)
        .map(|n| dir.join(format!("{stem}_{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Output template for ffmpeg's segment muxer (`-strftime 1`).
pub fn segment_output_template(dir: &Path, ext: &str) -> PathBuf {
    dir.join(format!("{}{}.{}", CHUNK_PREFIX, TIMESTAMP_FORMAT, ext))
}

/// Whether `name` looks like a chunk file with extension `ext`.
pub fn is_chunk_file(name: &str, ext: &str) -> bool {
    name.starts_with(CHUNK_PREFIX)
        && Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Capture timestamp embedded in a chunk file name.
pub fn parse_chunk_timestamp(name: &str) -> Option<NaiveDateTime> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let rest = stem.strip_prefix(CHUNK_PREFIX)?;
    // "YYYYMMDD_HHMMSS" is 15 chars; anything after is a collision suffix.
    let ts = rest.get(..15)?;
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()
}

/// Delete every video file in the recordings directory.
///
/// Returns the number of files removed. A missing directory is not an error.
pub async fn purge_recordings(dir: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(dir = %dir.display(), "Recordings directory does not exist, nothing to purge");
            return Ok(0);
        }
        Err(e) => return Err(io_error("reading recordings directory", dir, e)),
    };

    let mut deleted = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading recordings directory", dir, e))?
    {
        let path = entry.path();
        let is_video = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_video || !path.is_file() {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete recording"),
        }
    }

    info!(count = deleted, dir = %dir.display(), "Purged recordings");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_chunk_file_name_round_trips_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let name = chunk_file_name(&at, "mp4");
        assert_eq!(name, "chunk_20240309_070501.mp4");

        let expected = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(parse_chunk_timestamp(&name), Some(expected));
        assert_eq!(parse_chunk_timestamp("chunk_20240309_070501_2.mp4"), Some(expected));
    }

    #[test]
    fn test_is_chunk_file() {
        assert!(is_chunk_file("chunk_20240309_070501.mp4", "mp4"));
        assert!(is_chunk_file("chunk_20240309_070501.MP4", "mp4"));
        assert!(!is_chunk_file("chunk_20240309_070501_faststart.tmp", "mp4"));
        assert!(!is_chunk_file("other.mp4", "mp4"));
        assert!(parse_chunk_timestamp("other.mp4").is_none());
    }

    #[test]
    fn test_segment_template() {
        let template = segment_output_template(Path::new("/rec"), "mp4");
        assert_eq!(template, PathBuf::from("/rec/chunk_%Y%m%d_%H%M%S.mp4"));
    }

    #[test]
    fn test_next_chunk_path_avoids_collisions() {
        let temp = TempDir::new().unwrap();
        let first = next_chunk_path(temp.path(), "y4m");
        std::fs::write(&first, b"x").unwrap();
        let second = next_chunk_path(temp.path(), "y4m");
        assert_ne!(first, second);
        assert!(second.file_name().unwrap().to_str().unwrap().starts_with(CHUNK_PREFIX));
    }

    #[tokio::test]
    async fn test_purge_only_removes_videos() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("chunk_a.mp4"), b"x").unwrap();
        std::fs::write(temp.path().join("chunk_b.y4m"), b"x").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"x").unwrap();

        let deleted = purge_recordings(temp.path()).await.unwrap();

        assert_eq!(deleted, 2);
        assert!(temp.path().join("notes.txt").exists());
        assert_eq!(purge_recordings(&temp.path().join("missing")).await.unwrap(), 0);
    }
}
