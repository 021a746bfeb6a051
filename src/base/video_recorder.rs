//! Video recorder: writes the recovered MJPEG stream to disk with
//! time-based rotation and retention cleanup.
//!
//! The recorder thread polls the shared [`LatestFrame`] slot and appends
//! each new frame to the current file in multipart form:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! Files are named `video_YYYYmmdd_HHMMSS.mjpeg` under `<base>/video/`
//! and rotated every ten minutes; files older than the retention window
//! are deleted on rotation (the file being written is never touched).
//! Recording is best-effort like the rest of the video path: a write
//! failure drops the current file and the next frame opens a fresh one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Local;

use crate::base::reframer::LatestFrame;

/// Minutes of video per file.
const ROTATION_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Poll cadence while waiting for a new frame.
const FRAME_POLL: Duration = Duration::from_millis(100);

/// Records MJPEG frames from the latest-frame slot to rotating files.
pub struct VideoRecorder {
    dir: PathBuf,
    retention_days: u32,
    rotation: Duration,
    latest: Arc<LatestFrame>,

    current_file: Option<fs::File>,
    current_path: Option<PathBuf>,
    current_started: Option<Instant>,
    frames_written: u64,
}

impl std::fmt::Debug for VideoRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoRecorder")
            .field("dir", &self.dir)
            .field("frames_written", &self.frames_written)
            .finish_non_exhaustive()
    }
}

impl VideoRecorder {
    /// Spawn the recorder thread writing under `<base_path>/video/`.
    pub fn spawn(
        base_path: &Path,
        retention_days: u32,
        latest: Arc<LatestFrame>,
        running: &Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        Self::spawn_with_rotation(base_path, retention_days, ROTATION_INTERVAL, latest, running)
    }

    /// Spawn with an explicit rotation interval (tests).
    pub fn spawn_with_rotation(
        base_path: &Path,
        retention_days: u32,
        rotation: Duration,
        latest: Arc<LatestFrame>,
        running: &Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>> {
        let dir = base_path.join("video");
        fs::create_dir_all(&dir)
            .with_context(|| format!("create video recording dir {}", dir.display()))?;

        let mut recorder = Self {
            dir,
            retention_days,
            rotation,
            latest,
            current_file: None,
            current_path: None,
            current_started: None,
            frames_written: 0,
        };

        log::info!(
            "Video recorder started (dir {}, retention {retention_days} days)",
            recorder.dir.display()
        );
        let running = Arc::clone(running);
        std::thread::Builder::new()
            .name("video-recorder".into())
            .spawn(move || recorder.run(&running))
            .context("spawn video recorder")
    }

    fn run(&mut self, running: &AtomicBool) {
        let mut last_taken: Option<Instant> = None;

        while running.load(Ordering::SeqCst) {
            match self.latest.newer_than(last_taken) {
                Some((frame, at)) => {
                    last_taken = Some(at);
                    if let Err(e) = self.write_frame(&frame) {
                        log::error!("Video recorder write failed: {e:#}");
                        // Drop the handle; the next frame reopens.
                        self.current_file = None;
                    }
                }
                None => std::thread::sleep(FRAME_POLL),
            }
        }

        self.current_file = None;
        log::info!(
            "Video recorder stopped ({} frames written)",
            self.frames_written
        );
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.rotate_if_needed()?;

        let file = self.current_file.as_mut().context("video file missing")?;
        file.write_all(b"--frame\r\n")?;
        file.write_all(b"Content-Type: image/jpeg\r\n")?;
        file.write_all(format!("Content-Length: {}\r\n", frame.len()).as_bytes())?;
        file.write_all(b"\r\n")?;
        file.write_all(frame)?;
        file.write_all(b"\r\n")?;
        file.flush()?;

        self.frames_written += 1;
        Ok(())
    }

    fn rotate_if_needed(&mut self) -> Result<()> {
        let due = match (&self.current_file, self.current_started) {
            (Some(_), Some(started)) => started.elapsed() >= self.rotation,
            _ => true,
        };
        if !due {
            return Ok(());
        }

        if let Some(path) = self.current_path.take() {
            self.current_file = None;
            log::info!("Closed video file {}", path.display());
        }

        let path = self
            .dir
            .join(format!("video_{}.mjpeg", Local::now().format("%Y%m%d_%H%M%S")));
        let file = fs::File::create(&path)
            .with_context(|| format!("create {}", path.display()))?;
        log::info!("Started new video file {}", path.display());

        self.current_file = Some(file);
        self.current_path = Some(path);
        self.current_started = Some(Instant::now());
        self.cleanup_old_files();
        Ok(())
    }

    /// Delete recordings older than the retention window (by mtime). The
    /// file currently being written is always kept.
    fn cleanup_old_files(&self) {
        let cutoff = SystemTime::now()
            - Duration::from_secs(u64::from(self.retention_days) * 86_400);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Video retention scan failed: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            if !name_str.starts_with("video_") || !name_str.ends_with(".mjpeg") {
                continue;
            }
            if Some(entry.path()) == self.current_path {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if expired {
                match fs::remove_file(entry.path()) {
                    Ok(()) => log::info!("Deleted old video {name_str}"),
                    Err(e) => log::warn!("Failed to delete {name_str}: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff, 0xd8];
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xff, 0xd9]);
        frame
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..150 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached in time");
    }

    fn video_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir.join("video"))
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_frames_are_written_in_multipart_form() {
        let dir = tempfile::tempdir().unwrap();
        let latest = Arc::new(LatestFrame::new());
        let running = Arc::new(AtomicBool::new(true));
        let handle =
            VideoRecorder::spawn(dir.path(), 7, Arc::clone(&latest), &running).unwrap();

        latest.store(jpeg(b"first"));
        wait_for(|| !video_files(dir.path()).is_empty());

        // Same frame is not written twice; a new one is.
        latest.store(jpeg(b"second"));
        let boundary_count = |path: &PathBuf| {
            fs::read(path)
                .map(|content| {
                    content
                        .windows(b"--frame\r\n".len())
                        .filter(|w| *w == b"--frame\r\n")
                        .count()
                })
                .unwrap_or(0)
        };
        wait_for(|| boundary_count(&video_files(dir.path())[0]) == 2);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();

        let files = video_files(dir.path());
        assert_eq!(files.len(), 1);
        let content = fs::read(&files[0]).unwrap();
        assert_eq!(boundary_count(&files[0]), 2);

        // Frame bytes and their declared lengths are present verbatim.
        let first = jpeg(b"first");
        assert!(content
            .windows(first.len())
            .any(|w| w == first.as_slice()));
        let header = format!("Content-Length: {}\r\n", first.len());
        assert!(content
            .windows(header.len())
            .any(|w| w == header.as_bytes()));
    }

    #[test]
    fn test_rotation_opens_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let latest = Arc::new(LatestFrame::new());
        let running = Arc::new(AtomicBool::new(true));
        let handle = VideoRecorder::spawn_with_rotation(
            dir.path(),
            7,
            Duration::from_millis(0), // rotate on every frame
            Arc::clone(&latest),
            &running,
        )
        .unwrap();

        latest.store(jpeg(b"a"));
        wait_for(|| video_files(dir.path()).len() >= 1);
        // File names carry a 1s timestamp; wait past it so the second
        // rotation picks a new name.
        std::thread::sleep(Duration::from_millis(1100));
        latest.store(jpeg(b"b"));
        wait_for(|| video_files(dir.path()).len() >= 2);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_retention_deletes_expired_but_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path().join("video");
        fs::create_dir_all(&video_dir).unwrap();

        // Pre-existing recordings and an unrelated file.
        fs::write(video_dir.join("video_20200101_000000.mjpeg"), "old").unwrap();
        fs::write(video_dir.join("notes.txt"), "keep me").unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // Zero retention: anything with an mtime in the past expires.
        let latest = Arc::new(LatestFrame::new());
        let running = Arc::new(AtomicBool::new(true));
        let handle =
            VideoRecorder::spawn(dir.path(), 0, Arc::clone(&latest), &running).unwrap();

        // First frame opens the current file and triggers cleanup.
        latest.store(jpeg(b"live"));
        wait_for(|| !video_dir.join("video_20200101_000000.mjpeg").exists());

        assert!(video_dir.join("notes.txt").exists());
        // The current file survived its own cleanup pass.
        assert_eq!(video_files(dir.path()).len(), 2); // current + notes.txt

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
