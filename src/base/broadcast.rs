//! Dashboard broadcast sink: non-blocking fan-out of snapshots to
//! in-process subscribers.
//!
//! The dashboard's WebSocket surface lives out of tree; what it needs
//! from the bridge is a subscription that never blocks the telemetry
//! path. Each subscriber gets a bounded queue; a slow subscriber loses
//! its own samples (drop-newest) without affecting the pipeline or its
//! siblings. Dead subscribers are pruned on the next push.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use crate::hardware::TelemetrySink;
use crate::protocol::TelemetrySnapshot;

/// Per-subscriber queue depth (~3s at 10 Hz).
const SUBSCRIBER_QUEUE: usize = 32;

/// Fan-out sink for dashboard-style consumers.
pub struct BroadcastSink {
    subscribers: Mutex<Vec<SyncSender<TelemetrySnapshot>>>,
}

impl std::fmt::Debug for BroadcastSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastSink")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSink {
    /// Sink with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<TelemetrySnapshot> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE);
        self.lock().push(tx);
        rx
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SyncSender<TelemetrySnapshot>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl TelemetrySink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn push(&self, snapshot: &TelemetrySnapshot) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            // Slow subscriber: this sample is lost for them only.
            Err(TrySendError::Full(_)) => true,
            // Receiver dropped: unsubscribe.
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EstopReason, EstopStatus};

    fn snapshot(timestamp: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp,
            voltage: 12.0,
            height: 0.0,
            force: 0.0,
            chainsaw_force: 0.0,
            rope_force: 0.0,
            imu: None,
            barometer: None,
            motor_currents: vec![],
            estop: EstopStatus {
                engaged: false,
                reason: EstopReason::OperatorCommand,
                timestamp,
                age_s: 0.0,
            },
            control_age_ms: 0,
            control_established: true,
            control_seq: 0,
            rtt_ms: 0,
            pong: None,
            received_at: None,
        }
    }

    #[test]
    fn test_all_subscribers_receive() {
        let sink = BroadcastSink::new();
        let a = sink.subscribe();
        let b = sink.subscribe();

        sink.push(&snapshot(1.0));

        assert!((a.try_recv().unwrap().timestamp - 1.0).abs() < 1e-9);
        assert!((b.try_recv().unwrap().timestamp - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_slow_subscriber_loses_only_its_own_samples() {
        let sink = BroadcastSink::new();
        let slow = sink.subscribe();
        let fast = sink.subscribe();

        // Overrun the slow subscriber's queue without draining it.
        for i in 0..(SUBSCRIBER_QUEUE + 10) {
            sink.push(&snapshot(i as f64));
            // The fast one drains as it goes.
            let _ = fast.try_recv();
        }

        // Slow queue holds exactly its capacity; the rest were dropped.
        let mut received = 0;
        while slow.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE);
        // Still subscribed.
        assert_eq!(sink.subscriber_count(), 2);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let sink = BroadcastSink::new();
        let keep = sink.subscribe();
        {
            let _gone = sink.subscribe();
        }
        assert_eq!(sink.subscriber_count(), 2);

        sink.push(&snapshot(1.0));
        assert_eq!(sink.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
