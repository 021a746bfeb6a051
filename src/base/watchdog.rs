//! Base-side watchdog: telemetry freshness supervision and status events.
//!
//! If telemetry from the robot goes stale (> 5s) the base sends one
//! `emergency_stop {engage: true}` to the robot, then holds fire until
//! telemetry resumes and goes stale again. In the common failure mode
//! (link down) the robot's own watchdog has already latched; this is the
//! belt to that suspender for the asymmetric case where the robot can
//! hear us but we cannot hear it.
//!
//! SAFETY: like the robot watchdog, this can only ever ENGAGE.

use std::time::{Duration, Instant};

use crate::constants::{STATUS_INTERVAL, WATCHDOG_TIMEOUT};
use crate::protocol::Command;

/// View of base connectivity used for the periodic status event.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseStatus {
    /// Operator front-end connected.
    pub frontend_connected: bool,
    /// Control channel to the robot up.
    pub control_connected: bool,
    /// Telemetry channel from the robot up.
    pub telemetry_connected: bool,
    /// Video channel from the robot up.
    pub video_connected: bool,
    /// Robot E-STOP state as mirrored from telemetry.
    pub robot_estop: Option<bool>,
    /// Mirrored E-STOP reason tag.
    pub robot_estop_reason: Option<&'static str>,
    /// PSK validity on this node.
    pub psk_valid: bool,
}

/// Telemetry-freshness watchdog.
pub struct BaseWatchdog {
    estop_sent_for_timeout: bool,
    last_status: Instant,
}

impl std::fmt::Debug for BaseWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseWatchdog")
            .field("estop_sent_for_timeout", &self.estop_sent_for_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for BaseWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseWatchdog {
    /// Fresh watchdog (armed).
    pub fn new() -> Self {
        log::info!(
            "Base watchdog initialized (timeout={}s, status_interval={}s)",
            WATCHDOG_TIMEOUT.as_secs(),
            STATUS_INTERVAL.as_secs()
        );
        Self {
            estop_sent_for_timeout: false,
            last_status: Instant::now(),
        }
    }

    /// One freshness check. `telemetry_age` is `None` until the first
    /// snapshot ever arrives (no E-STOP before the robot has spoken).
    /// Returns the command to send, at most once per stale episode.
    pub fn check_telemetry(&mut self, telemetry_age: Option<Duration>) -> Option<Command> {
        let age = telemetry_age?;

        if age > WATCHDOG_TIMEOUT {
            if !self.estop_sent_for_timeout {
                log::error!(
                    "Telemetry timeout ({:.1}s), sending E-STOP ENGAGE",
                    age.as_secs_f64()
                );
                self.estop_sent_for_timeout = true;
                return Some(Command::EmergencyStop {
                    engage: true,
                    reason: Some(format!(
                        "base_watchdog_telemetry_timeout_{:.0}s",
                        age.as_secs_f64()
                    )),
                    confirm_clear: None,
                });
            }
        } else {
            // Telemetry is fresh again: re-arm for the next episode.
            self.estop_sent_for_timeout = false;
        }
        None
    }

    /// Emit the structured status event if the interval has elapsed.
    pub fn log_status(&mut self, status: &BaseStatus) {
        if self.last_status.elapsed() < STATUS_INTERVAL {
            return;
        }
        self.last_status = Instant::now();

        let event = serde_json::json!({
            "event": "status",
            "frontend": if status.frontend_connected { "connected" } else { "disconnected" },
            "control": if status.control_connected { "connected" } else { "disconnected" },
            "telemetry": if status.telemetry_connected { "connected" } else { "disconnected" },
            "video": if status.video_connected { "connected" } else { "N/A" },
            "robot_estop": status.robot_estop,
            "robot_estop_reason": status.robot_estop_reason,
            "psk_valid": status.psk_valid,
        });
        log::info!("{event}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_estop_before_first_telemetry() {
        let mut dog = BaseWatchdog::new();
        assert!(dog.check_telemetry(None).is_none());
    }

    #[test]
    fn test_fresh_telemetry_is_quiet() {
        let mut dog = BaseWatchdog::new();
        assert!(dog
            .check_telemetry(Some(Duration::from_millis(200)))
            .is_none());
    }

    #[test]
    fn test_stale_telemetry_sends_exactly_one_engage() {
        let mut dog = BaseWatchdog::new();
        let stale = Some(Duration::from_secs(7));

        let cmd = dog.check_telemetry(stale).expect("engage on first stale");
        let Command::EmergencyStop { engage, reason, .. } = cmd else {
            panic!("expected emergency_stop");
        };
        assert!(engage);
        assert_eq!(
            reason.as_deref(),
            Some("base_watchdog_telemetry_timeout_7s")
        );

        // Still stale: no repeat.
        assert!(dog.check_telemetry(stale).is_none());
        assert!(dog.check_telemetry(Some(Duration::from_secs(9))).is_none());
    }

    #[test]
    fn test_rearm_after_recovery() {
        let mut dog = BaseWatchdog::new();
        assert!(dog.check_telemetry(Some(Duration::from_secs(7))).is_some());

        // Telemetry resumes, then goes stale again: one more engage.
        assert!(dog
            .check_telemetry(Some(Duration::from_millis(100)))
            .is_none());
        assert!(dog.check_telemetry(Some(Duration::from_secs(6))).is_some());
    }
}
