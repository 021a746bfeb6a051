//! Fixed-capacity telemetry history buffer.
//!
//! Holds the last N snapshots (default 600, about 60 seconds at 10 Hz).
//! Pushing beyond capacity silently evicts the oldest entry, so memory
//! stays bounded regardless of uptime. All access goes through one
//! mutex; at a 10 Hz write rate contention is a non-issue, and readers
//! always get consistent copies.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::protocol::TelemetrySnapshot;

/// Default capacity: 60 seconds at 10 Hz.
pub const DEFAULT_BUFFER_SAMPLES: usize = 600;

/// Min/max/avg over one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    /// Minimum observed value.
    pub min: f64,
    /// Maximum observed value.
    pub max: f64,
    /// Arithmetic mean.
    pub avg: f64,
}

impl MetricStats {
    fn over(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        (count > 0).then(|| Self {
            min,
            max,
            avg: sum / count as f64,
        })
    }
}

/// Aggregate statistics over the buffered history.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    /// Number of samples in the buffer.
    pub sample_count: usize,
    /// Seconds between the oldest and newest sample timestamps.
    pub time_span_s: f64,
    /// Battery voltage stats.
    pub voltage: Option<MetricStats>,
    /// Round-trip time stats (ms).
    pub rtt_ms: Option<MetricStats>,
    /// Total motor current stats (A).
    pub total_motor_current: Option<MetricStats>,
    /// Per-motor current stats (A), indexed by motor.
    pub motor_currents: Vec<MetricStats>,
    /// Barometric altitude stats (m).
    pub altitude: Option<MetricStats>,
    /// Control age stats (ms).
    pub control_age_ms: Option<MetricStats>,
}

struct BufferInner {
    history: VecDeque<TelemetrySnapshot>,
    latest: Option<TelemetrySnapshot>,
    sample_count: u64,
}

/// Thread-safe ring of recent telemetry snapshots.
pub struct TelemetryBuffer {
    capacity: usize,
    inner: Mutex<BufferInner>,
}

impl std::fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl TelemetryBuffer {
    /// Buffer holding at most `capacity` samples.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "TelemetryBuffer capacity must be > 0");
        Self {
            capacity,
            inner: Mutex::new(BufferInner {
                history: VecDeque::with_capacity(capacity.min(1024)),
                latest: None,
                sample_count: 0,
            }),
        }
    }

    /// Buffer with [`DEFAULT_BUFFER_SAMPLES`] capacity.
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_BUFFER_SAMPLES)
    }

    /// Append a snapshot, evicting the oldest when full.
    pub fn push(&self, snapshot: TelemetrySnapshot) {
        let mut inner = self.lock();
        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.latest = Some(snapshot.clone());
        inner.history.push_back(snapshot);
        inner.sample_count += 1;
    }

    /// Most recent snapshot, if any.
    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.lock().latest.clone()
    }

    /// Copy of the last `seconds` of history (assuming 10 Hz), oldest
    /// first.
    pub fn history(&self, seconds: usize) -> Vec<TelemetrySnapshot> {
        let inner = self.lock();
        let take = (seconds * 10).min(inner.history.len());
        inner
            .history
            .iter()
            .skip(inner.history.len() - take)
            .cloned()
            .collect()
    }

    /// Current number of buffered samples.
    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.lock().history.is_empty()
    }

    /// Total samples ever pushed.
    pub fn total_samples(&self) -> u64 {
        self.lock().sample_count
    }

    /// Drop all buffered data.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.history.clear();
        inner.latest = None;
        inner.sample_count = 0;
    }

    /// Min/max/avg statistics over the buffered history.
    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        let history = &inner.history;
        if history.is_empty() {
            return BufferStats::default();
        }

        let time_span_s = match (history.front(), history.back()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).max(0.0),
            _ => 0.0,
        };

        let motor_count = history
            .iter()
            .map(|s| s.motor_currents.len())
            .max()
            .unwrap_or(0);
        let motor_currents = (0..motor_count)
            .filter_map(|idx| {
                MetricStats::over(
                    history
                        .iter()
                        .filter_map(|s| s.motor_currents.get(idx).map(|c| f64::from(*c))),
                )
            })
            .collect();

        BufferStats {
            sample_count: history.len(),
            time_span_s,
            voltage: MetricStats::over(history.iter().map(|s| f64::from(s.voltage))),
            rtt_ms: MetricStats::over(history.iter().map(|s| s.rtt_ms as f64)),
            total_motor_current: MetricStats::over(
                history
                    .iter()
                    .filter(|s| !s.motor_currents.is_empty())
                    .map(|s| f64::from(s.total_motor_current())),
            ),
            motor_currents,
            altitude: MetricStats::over(
                history
                    .iter()
                    .filter_map(|s| s.barometer.map(|b| b.altitude)),
            ),
            control_age_ms: MetricStats::over(history.iter().map(|s| s.control_age_ms as f64)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BufferInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EstopReason, EstopStatus};

    fn snapshot(timestamp: f64, voltage: f32) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp,
            voltage,
            height: 0.0,
            force: 0.0,
            chainsaw_force: 0.0,
            rope_force: 0.0,
            imu: None,
            barometer: None,
            motor_currents: vec![0.5, 1.5],
            estop: EstopStatus {
                engaged: false,
                reason: EstopReason::OperatorCommand,
                timestamp,
                age_s: 0.0,
            },
            control_age_ms: 100,
            control_established: true,
            control_seq: 1,
            rtt_ms: 20,
            pong: None,
            received_at: Some(timestamp),
        }
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = TelemetryBuffer::with_default_capacity();
        assert!(buffer.is_empty());
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.stats().sample_count, 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = TelemetryBuffer::new(0);
    }

    #[test]
    fn test_visible_history_is_min_of_pushes_and_capacity() {
        let buffer = TelemetryBuffer::new(5);

        for i in 0..3 {
            buffer.push(snapshot(f64::from(i), 12.0));
        }
        assert_eq!(buffer.len(), 3);

        for i in 3..20 {
            buffer.push(snapshot(f64::from(i), 12.0));
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.total_samples(), 20);

        // Last element equals the last push, oldest evicted first.
        let history = buffer.history(60);
        assert_eq!(history.first().map(|s| s.timestamp), Some(15.0));
        assert_eq!(history.last().map(|s| s.timestamp), Some(19.0));
        assert_eq!(buffer.latest().map(|s| s.timestamp), Some(19.0));
    }

    #[test]
    fn test_history_window() {
        let buffer = TelemetryBuffer::new(600);
        for i in 0..100 {
            buffer.push(snapshot(f64::from(i) * 0.1, 12.0));
        }
        // 2 seconds at 10 Hz = 20 samples.
        let window = buffer.history(2);
        assert_eq!(window.len(), 20);
        assert!((window[0].timestamp - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_over_mixed_history() {
        let buffer = TelemetryBuffer::new(10);
        buffer.push(snapshot(100.0, 11.0));
        buffer.push(snapshot(101.0, 13.0));

        let stats = buffer.stats();
        assert_eq!(stats.sample_count, 2);
        assert!((stats.time_span_s - 1.0).abs() < 1e-9);

        let voltage = stats.voltage.expect("voltage stats");
        assert!((voltage.min - 11.0).abs() < 1e-6);
        assert!((voltage.max - 13.0).abs() < 1e-6);
        assert!((voltage.avg - 12.0).abs() < 1e-6);

        let total = stats.total_motor_current.expect("total current stats");
        assert!((total.avg - 2.0).abs() < 1e-6);
        assert_eq!(stats.motor_currents.len(), 2);
        assert!((stats.motor_currents[1].avg - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_clear() {
        let buffer = TelemetryBuffer::new(10);
        buffer.push(snapshot(1.0, 12.0));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.total_samples(), 0);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_copies() {
        use std::sync::Arc;

        let buffer = Arc::new(TelemetryBuffer::new(100));
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    buffer.push(snapshot(f64::from(i), 12.0));
                }
            })
        };

        for _ in 0..100 {
            let history = buffer.history(60);
            // Timestamps in a copy must be monotonic - a torn read would
            // break this.
            for pair in history.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
        writer.join().expect("writer");
    }
}
