//! On-disk telemetry storage: JSONL files, one per day, with retention.
//!
//! Producers hand snapshots to a bounded queue with a non-blocking send;
//! a dedicated writer thread appends them as JSON lines to
//! `<base>/telemetry/telemetry_YYYY-MM-DD.jsonl`. When the queue is full
//! the sample is dropped and counted - telemetry freshness in memory
//! always outranks persistence. Files older than the retention window
//! are deleted at startup and at each day rollover.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};

use crate::hardware::TelemetrySink;
use crate::protocol::TelemetrySnapshot;

/// Bounded queue between producers and the writer thread.
const QUEUE_CAPACITY: usize = 1000;

/// Writer wake interval when idle (also the shutdown latency bound).
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Handle to the storage writer; cloneable into every producer.
#[derive(Clone)]
pub struct TelemetryStorage {
    tx: SyncSender<TelemetrySnapshot>,
    dropped: Arc<AtomicU64>,
    written: Arc<AtomicU64>,
}

impl std::fmt::Debug for TelemetryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStorage")
            .field("written", &self.written.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TelemetryStorage {
    /// Spawn the writer thread. Returns the producer handle and the
    /// thread handle for joining at shutdown.
    pub fn spawn(
        base_path: &Path,
        retention_days: u32,
        running: &Arc<AtomicBool>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let dir = base_path.join("telemetry");
        fs::create_dir_all(&dir)
            .with_context(|| format!("create telemetry storage dir {}", dir.display()))?;

        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicU64::new(0));

        let mut writer = Writer {
            dir: dir.clone(),
            retention_days,
            current_date: None,
            file: None,
            written: Arc::clone(&written),
        };
        writer.cleanup_old_files();

        let running = Arc::clone(running);
        let handle = std::thread::Builder::new()
            .name("telemetry-storage".into())
            .spawn(move || writer.run(&rx, &running))
            .context("spawn telemetry storage writer")?;

        log::info!(
            "Telemetry storage started (dir {}, retention {retention_days} days)",
            dir.display()
        );
        Ok((
            Self {
                tx,
                dropped,
                written,
            },
            handle,
        ))
    }

    /// Samples dropped due to a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Samples written to disk.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for TelemetryStorage {
    fn name(&self) -> &str {
        "storage"
    }

    /// Non-blocking enqueue; drops (and counts) on overflow.
    fn push(&self, snapshot: &TelemetrySnapshot) {
        match self.tx.try_send(snapshot.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    log::warn!("Telemetry storage queue full ({dropped} dropped so far)");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Telemetry storage writer gone; sample discarded");
            }
        }
    }
}

struct Writer {
    dir: PathBuf,
    retention_days: u32,
    current_date: Option<NaiveDate>,
    file: Option<fs::File>,
    written: Arc<AtomicU64>,
}

impl Writer {
    fn run(&mut self, rx: &Receiver<TelemetrySnapshot>, running: &AtomicBool) {
        loop {
            match rx.recv_timeout(IDLE_POLL) {
                Ok(snapshot) => {
                    if let Err(e) = self.write_one(&snapshot) {
                        log::error!("Telemetry storage write failed: {e:#}");
                        // Drop the handle; the next write reopens.
                        self.file = None;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        // Drain whatever is still queued before exiting.
        while let Ok(snapshot) = rx.try_recv() {
            if self.write_one(&snapshot).is_err() {
                break;
            }
        }
        log::info!(
            "Telemetry storage stopped ({} samples written)",
            self.written.load(Ordering::Relaxed)
        );
    }

    fn write_one(&mut self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let today = Local::now().date_naive();
        if self.current_date != Some(today) || self.file.is_none() {
            self.rotate_to(today)?;
        }

        let file = self.file.as_mut().context("storage file missing")?;
        serde_json::to_writer(&mut *file, snapshot).context("serialize snapshot")?;
        file.write_all(b"\n").context("write newline")?;
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rotate_to(&mut self, date: NaiveDate) -> Result<()> {
        let path = self.path_for(date);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;

        log::info!("Telemetry storage rotated to {}", path.display());
        self.file = Some(file);
        self.current_date = Some(date);
        self.cleanup_old_files();
        Ok(())
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("telemetry_{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Delete files older than the retention window.
    fn cleanup_old_files(&self) {
        let cutoff = Local::now().date_naive()
            - chrono::Days::new(u64::from(self.retention_days));

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Telemetry retention scan failed: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = parse_file_date(&name.to_string_lossy()) else {
                continue;
            };
            if date < cutoff {
                match fs::remove_file(entry.path()) {
                    Ok(()) => log::info!("Deleted expired telemetry file {name:?}"),
                    Err(e) => log::warn!("Failed to delete {name:?}: {e}"),
                }
            }
        }
    }
}

fn parse_file_date(name: &str) -> Option<NaiveDate> {
    let date_part = name
        .strip_prefix("telemetry_")?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}
