//! Base-side shared state: RTT matching, the robot's mirrored E-STOP
//! state, emergency-command dedup, and rate gates.
//!
//! One mutex over one small struct; every operation is a handful of
//! field reads/writes.

use std::sync::Mutex;
use std::time::Instant;

use crate::protocol::{unix_now, EstopReason, PongData};

/// Sanity ceiling for RTT measurements; beyond this the clocks disagree.
const RTT_MAX_MS: i64 = 10_000;

#[derive(Debug)]
struct StateInner {
    last_ping_seq: u64,
    last_ping_ts: f64,
    last_rtt_ms: i64,
    robot_estop: Option<bool>,
    robot_estop_reason: Option<EstopReason>,
    active_camera: u32,
    last_controller_update: Option<Instant>,
    last_emergency_sent: Option<bool>,
    frontend_connected: bool,
}

/// Shared mutable state of the base station.
#[derive(Debug)]
pub struct StateManager {
    inner: Mutex<StateInner>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    /// Fresh state: no RTT, robot state unknown, camera 0.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                last_ping_seq: 0,
                last_ping_ts: 0.0,
                last_rtt_ms: 0,
                robot_estop: None,
                robot_estop_reason: None,
                active_camera: 0,
                last_controller_update: None,
                last_emergency_sent: None,
                frontend_connected: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Ping / RTT
    // ------------------------------------------------------------------

    /// Allocate the next ping sequence and record its send time.
    pub fn next_ping(&self) -> (u64, f64) {
        let mut inner = self.lock();
        inner.last_ping_seq += 1;
        inner.last_ping_ts = unix_now();
        (inner.last_ping_seq, inner.last_ping_ts)
    }

    /// Match a pong against the outstanding ping and update the RTT.
    ///
    /// Returns the new RTT when the pong matches and the value passes the
    /// 0..10s sanity window.
    pub fn update_rtt(&self, pong: &PongData) -> Option<i64> {
        let mut inner = self.lock();
        if pong.ping_seq != inner.last_ping_seq || inner.last_ping_ts <= 0.0 {
            return None;
        }

        let rtt_ms = ((unix_now() - pong.ping_ts) * 1000.0) as i64;
        if (0..RTT_MAX_MS).contains(&rtt_ms) {
            inner.last_rtt_ms = rtt_ms;
            log::debug!("RTT measured: {rtt_ms}ms (ping_seq={})", pong.ping_seq);
            Some(rtt_ms)
        } else {
            log::warn!("RTT out of range: {rtt_ms}ms, ignoring");
            None
        }
    }

    /// Last accepted RTT in milliseconds.
    pub fn rtt_ms(&self) -> i64 {
        self.lock().last_rtt_ms
    }

    // ------------------------------------------------------------------
    // Robot E-STOP mirror
    // ------------------------------------------------------------------

    /// Record the robot's E-STOP state as seen in telemetry.
    pub fn update_robot_estop(&self, engaged: bool, reason: EstopReason) {
        let mut inner = self.lock();
        if inner.robot_estop != Some(engaged) {
            log::info!(
                "Robot E-STOP state: {} ({reason})",
                if engaged { "ENGAGED" } else { "CLEARED" }
            );
        }
        inner.robot_estop = Some(engaged);
        inner.robot_estop_reason = Some(reason);
    }

    /// Mirrored E-STOP state (`None` until first telemetry).
    pub fn robot_estop(&self) -> Option<bool> {
        self.lock().robot_estop
    }

    /// Mirrored E-STOP reason.
    pub fn robot_estop_reason(&self) -> Option<EstopReason> {
        self.lock().robot_estop_reason
    }

    // ------------------------------------------------------------------
    // Emergency command dedup
    // ------------------------------------------------------------------

    /// Whether an emergency command with this `engage` value should be
    /// forwarded. Exact duplicates of the last sent state are suppressed;
    /// the tracking resets on reconnect via [`StateManager::reset_emergency`].
    pub fn should_send_emergency(&self, engage: bool, source: &str) -> bool {
        let mut inner = self.lock();
        if inner.last_emergency_sent == Some(engage) {
            log::debug!(
                "E-STOP: ignoring duplicate {} from {source}",
                if engage { "ENGAGE" } else { "CLEAR" }
            );
            return false;
        }
        inner.last_emergency_sent = Some(engage);
        log::info!(
            "E-STOP: forwarding {} from {source}",
            if engage { "ENGAGE" } else { "CLEAR" }
        );
        true
    }

    /// Reset emergency dedup tracking (e.g. when the control link drops).
    pub fn reset_emergency(&self) {
        let mut inner = self.lock();
        inner.last_emergency_sent = None;
        log::info!("E-STOP state tracking reset");
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    /// Record the camera selected by the operator.
    pub fn set_active_camera(&self, id: u32) {
        self.lock().active_camera = id;
    }

    /// Operator-selected camera.
    pub fn active_camera(&self) -> u32 {
        self.lock().active_camera
    }

    /// Mark the operator front-end connected or not.
    pub fn set_frontend_connected(&self, connected: bool) {
        self.lock().frontend_connected = connected;
    }

    /// Whether the operator front-end is connected.
    pub fn frontend_connected(&self) -> bool {
        self.lock().frontend_connected
    }

    /// Rate gate for the condensed controller view: true at most once
    /// per `1/rate_hz` seconds.
    pub fn should_send_controller_update(&self, rate_hz: f64) -> bool {
        let interval = if rate_hz > 0.0 {
            std::time::Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            std::time::Duration::from_secs(1)
        };

        let mut inner = self.lock();
        let due = inner
            .last_controller_update
            .is_none_or(|at| at.elapsed() >= interval);
        if due {
            inner.last_controller_update = Some(Instant::now());
        }
        due
    }
}
