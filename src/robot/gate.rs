//! The actuator gate: E-STOP latch plus atomic check-and-actuate.
//!
//! SAFETY-CRITICAL MODULE.
//!
//! One mutex guards both the E-STOP flag and every hardware write. That
//! single lock is what makes check-and-actuate atomic: for any actuation
//! that reaches hardware, the E-STOP was observed disengaged under the
//! same lock acquisition that issued the write, so no interleaving can
//! slip a motor command past an engaging E-STOP (no TOCTOU).
//!
//! Invariants enforced here:
//!
//! 1. E-STOP is LATCHED on construction (`boot_default`) - fail-safe.
//! 2. Engaging from any thread always succeeds and commands every motor
//!    to 0 and the servo to neutral while still holding the lock.
//! 3. Clearing requires the exact confirmation string, a live and fresh
//!    control link, a valid PSK, and a currently engaged latch.
//! 4. A hardware write failure engages E-STOP (`internal_error`) inside
//!    the same critical section and the call reports failure.
//!
//! The lock is held only for the duration of a hardware call, never
//! across socket I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::constants::{
    ESTOP_CLEAR_CONFIRM, ESTOP_CLEAR_MAX_AGE, MOTOR_COUNT, MOTOR_SPEED_LIMIT, SERVO_NEUTRAL,
};
use crate::hardware::Actuator;
use crate::protocol::{unix_now, EstopReason, EstopStatus};

/// Capacity of the E-STOP audit ring.
const HISTORY_CAPACITY: usize = 100;

/// One recorded E-STOP transition, kept in the audit ring.
#[derive(Debug, Clone)]
pub struct EstopEvent {
    /// `"ENGAGED"` or `"CLEARED"`.
    pub action: &'static str,
    /// Reason tag.
    pub reason: EstopReason,
    /// Free-form detail for the log.
    pub detail: String,
    /// Unix timestamp of the transition.
    pub timestamp: f64,
}

struct GateInner {
    actuator: Box<dyn Actuator>,
    engaged: bool,
    reason: EstopReason,
    since: Instant,
    since_unix: f64,
    history: VecDeque<EstopEvent>,
    engage_write_failures: u64,
}

/// E-STOP latch and exclusive owner of all actuator handles.
pub struct ActuatorGate {
    inner: Mutex<GateInner>,
    psk_valid: bool,
    allow_local_clear: bool,
}

impl std::fmt::Debug for ActuatorGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorGate")
            .field("engaged", &self.is_engaged())
            .field("psk_valid", &self.psk_valid)
            .finish_non_exhaustive()
    }
}

impl ActuatorGate {
    /// Take ownership of the actuator with E-STOP engaged (`boot_default`).
    ///
    /// The boot latch is recorded in the audit ring and the safe state is
    /// driven immediately, before any other caller can reach the hardware.
    pub fn new(actuator: Box<dyn Actuator>, psk_valid: bool, allow_local_clear: bool) -> Self {
        let gate = Self {
            inner: Mutex::new(GateInner {
                actuator,
                engaged: false,
                reason: EstopReason::BootDefault,
                since: Instant::now(),
                since_unix: unix_now(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                engage_write_failures: 0,
            }),
            psk_valid,
            allow_local_clear,
        };
        gate.engage(EstopReason::BootDefault, "latched at boot");
        gate
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        // A panic in another thread must not wedge the safety path.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ENGAGE E-STOP. Callable from any thread at any time; always
    /// succeeds. Idempotent: the transition is recorded only on the
    /// false -> true edge, but the safe state is driven on every call.
    pub fn engage(&self, reason: EstopReason, detail: &str) {
        let mut inner = self.lock();
        engage_locked(&mut inner, reason, detail);
    }

    /// Attempt to CLEAR E-STOP. Strict validation; never panics.
    ///
    /// Succeeds iff all of:
    /// 1. `confirm` is exactly `"CLEAR_ESTOP"`,
    /// 2. the control channel is connected,
    /// 3. the last valid control command is at most 1.5s old,
    /// 4. a valid PSK is configured,
    /// 5. E-STOP is currently engaged.
    pub fn clear(&self, confirm: &str, control_age: Duration, control_connected: bool) -> bool {
        let mut inner = self.lock();

        if confirm != ESTOP_CLEAR_CONFIRM {
            log::warn!("E-STOP clear REJECTED: invalid confirm string");
            return false;
        }
        if !control_connected {
            log::warn!("E-STOP clear REJECTED: control not connected");
            return false;
        }
        if control_age > ESTOP_CLEAR_MAX_AGE {
            log::warn!(
                "E-STOP clear REJECTED: control too stale ({:.2}s > {:.2}s)",
                control_age.as_secs_f64(),
                ESTOP_CLEAR_MAX_AGE.as_secs_f64()
            );
            return false;
        }
        if !self.psk_valid {
            log::warn!("E-STOP clear REJECTED: no valid PSK configured");
            return false;
        }
        if !inner.engaged {
            log::warn!("E-STOP clear REJECTED: not engaged");
            return false;
        }

        inner.engaged = false;
        inner.since = Instant::now();
        inner.since_unix = unix_now();
        record_event(
            &mut inner,
            "CLEARED",
            EstopReason::OperatorCommand,
            &format!("control age {:.2}s", control_age.as_secs_f64()),
        );
        true
    }

    /// Clear E-STOP from a dashboard on the same host, bypassing the
    /// control-age and connectivity checks.
    ///
    /// Gated by deployment configuration; rejected (and logged) unless
    /// explicitly enabled.
    pub fn clear_local(&self) -> bool {
        if !self.allow_local_clear {
            log::warn!("E-STOP clear_local REJECTED: not enabled for this deployment");
            return false;
        }

        let mut inner = self.lock();
        if !inner.engaged {
            log::info!("E-STOP clear_local: already cleared");
            return true;
        }

        inner.engaged = false;
        inner.since = Instant::now();
        inner.since_unix = unix_now();
        record_event(
            &mut inner,
            "CLEARED",
            EstopReason::DashboardManual,
            "cleared manually from local dashboard",
        );
        true
    }

    /// Drive motor `id`. Returns `false` (without touching hardware) when
    /// E-STOP is engaged; engages E-STOP on a hardware write failure.
    ///
    /// Speed is clamped to -800..=800.
    pub fn set_motor(&self, id: u8, speed: i16) -> bool {
        let mut inner = self.lock();
        if inner.engaged {
            // Silent: commands during E-STOP are expected, not log-worthy.
            return false;
        }
        if id as usize >= MOTOR_COUNT {
            log::warn!("Motor {id} out of range (max {})", MOTOR_COUNT - 1);
            return false;
        }

        let speed = speed.clamp(-MOTOR_SPEED_LIMIT, MOTOR_SPEED_LIMIT);
        match inner.actuator.set_motor(id, speed) {
            Ok(()) => {
                log::debug!("Motor {id}: speed={speed}");
                true
            }
            Err(e) => {
                log::error!("Error setting motor {id} speed: {e}");
                engage_locked(
                    &mut inner,
                    EstopReason::InternalError,
                    &format!("motor {id} write failed: {e}"),
                );
                false
            }
        }
    }

    /// Move the clamp servo (0.0..=1.0, clamped). Same gating and failure
    /// behavior as [`ActuatorGate::set_motor`].
    pub fn set_servo(&self, position: f32) -> bool {
        let mut inner = self.lock();
        if inner.engaged {
            log::debug!("Servo command blocked: E-STOP engaged");
            return false;
        }

        let position = position.clamp(0.0, 1.0);
        match inner.actuator.set_servo_position(position) {
            Ok(()) => {
                log::debug!("Servo position set: {position:.4}");
                true
            }
            Err(e) => {
                log::error!("Error setting servo position: {e}");
                engage_locked(
                    &mut inner,
                    EstopReason::InternalError,
                    &format!("servo write failed: {e}"),
                );
                false
            }
        }
    }

    /// Drive the servo duty cycle directly (0.0..=100.0, clamped).
    pub fn set_servo_duty_raw(&self, duty: f32) -> bool {
        let mut inner = self.lock();
        if inner.engaged {
            log::debug!("Servo duty command blocked: E-STOP engaged");
            return false;
        }

        let duty = duty.clamp(0.0, 100.0);
        match inner.actuator.set_servo_duty_raw(duty) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Error setting servo duty: {e}");
                engage_locked(
                    &mut inner,
                    EstopReason::InternalError,
                    &format!("servo duty write failed: {e}"),
                );
                false
            }
        }
    }

    /// Whether E-STOP is engaged (brief lock for a consistent read).
    pub fn is_engaged(&self) -> bool {
        self.lock().engaged
    }

    /// Consistent snapshot of the E-STOP state for telemetry.
    pub fn info(&self) -> EstopStatus {
        let inner = self.lock();
        EstopStatus {
            engaged: inner.engaged,
            reason: inner.reason,
            timestamp: inner.since_unix,
            age_s: inner.since.elapsed().as_secs_f64(),
        }
    }

    /// Copy of the audit ring, oldest first.
    pub fn history(&self) -> Vec<EstopEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Per-motor current draw read through the gate's actuator handle.
    pub fn motor_currents(&self) -> [f32; MOTOR_COUNT] {
        self.lock().actuator.read_motor_currents()
    }

    /// Count of hardware write failures observed while driving the safe
    /// state during engage calls.
    pub fn engage_write_failures(&self) -> u64 {
        self.lock().engage_write_failures
    }
}

/// Engage while already holding the gate lock. Used both by the public
/// `engage` and by the actuation paths reacting to hardware failures,
/// so the state transition and the safe-state writes stay inside one
/// critical section.
fn engage_locked(inner: &mut GateInner, reason: EstopReason, detail: &str) {
    let was_engaged = inner.engaged;
    inner.engaged = true;
    inner.reason = reason;
    inner.since = Instant::now();
    inner.since_unix = unix_now();

    // Safe state: every motor to 0, servo to neutral, while holding the
    // lock. Failures are counted and logged but cannot abort the engage.
    let mut motors_stopped = 0u32;
    let mut motors_failed = 0u32;
    for id in 0..MOTOR_COUNT as u8 {
        match inner.actuator.set_motor(id, 0) {
            Ok(()) => motors_stopped += 1,
            Err(e) => {
                motors_failed += 1;
                inner.engage_write_failures += 1;
                log::error!("CRITICAL: failed to stop motor {id} during E-STOP: {e}");
            }
        }
    }

    let servo_ok = match inner.actuator.set_servo_position(SERVO_NEUTRAL) {
        Ok(()) => true,
        Err(e) => {
            inner.engage_write_failures += 1;
            log::error!("CRITICAL: failed to neutralize servo during E-STOP: {e}");
            false
        }
    };

    if motors_failed > 0 {
        log::error!(
            "E-STOP: MOTOR STOP INCOMPLETE - {motors_stopped} stopped, {motors_failed} FAILED"
        );
    }

    if !was_engaged {
        record_event(
            inner,
            "ENGAGED",
            reason,
            &format!(
                "{detail} (motors_stopped={motors_stopped}, motors_failed={motors_failed}, servo={})",
                if servo_ok { "OK" } else { "FAILED" }
            ),
        );
    }
}

/// Append to the audit ring and emit the structured log event.
fn record_event(inner: &mut GateInner, action: &'static str, reason: EstopReason, detail: &str) {
    let event = EstopEvent {
        action,
        reason,
        detail: detail.to_owned(),
        timestamp: unix_now(),
    };

    if inner.history.len() == HISTORY_CAPACITY {
        inner.history.pop_front();
    }
    inner.history.push_back(event);

    let line = serde_json::json!({
        "event": "ESTOP",
        "action": action,
        "reason": reason.as_str(),
        "detail": detail,
        "timestamp": inner.since_unix,
    });
    if action == "ENGAGED" {
        log::warn!("{line}");
    } else {
        log::info!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SimActuator, SimActuatorHandle};

    fn gate() -> (ActuatorGate, SimActuatorHandle) {
        let actuator = SimActuator::new();
        let handle = actuator.handle();
        (ActuatorGate::new(Box::new(actuator), true, false), handle)
    }

    fn fresh() -> Duration {
        Duration::from_millis(500)
    }

    // ── Boot state ────────────────────────────────────────────────────────

    #[test]
    fn test_boot_state_is_latched_and_safe() {
        let (gate, handle) = gate();
        let info = gate.info();

        assert!(gate.is_engaged());
        assert_eq!(info.reason, EstopReason::BootDefault);

        let state = handle.state();
        assert_eq!(state.motor_speeds, [0i16; MOTOR_COUNT]);
        assert!((state.servo_position - SERVO_NEUTRAL).abs() < f32::EPSILON);

        // Boot latch is in the audit ring.
        let history = gate.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, "ENGAGED");
        assert_eq!(history[0].reason, EstopReason::BootDefault);
    }

    #[test]
    fn test_actuation_blocked_while_engaged() {
        let (gate, handle) = gate();
        assert!(!gate.set_motor(0, 500));
        assert!(!gate.set_servo(0.8));
        assert!(!gate.set_servo_duty_raw(40.0));
        assert_eq!(handle.state().motor_speeds[0], 0);
    }

    // ── Clear validation ──────────────────────────────────────────────────

    #[test]
    fn test_clear_happy_path() {
        let (gate, _) = gate();
        assert!(gate.clear("CLEAR_ESTOP", fresh(), true));
        assert!(!gate.is_engaged());
        assert!(gate.set_motor(0, 100));
    }

    #[test]
    fn test_clear_is_case_sensitive() {
        let (gate, _) = gate();
        assert!(!gate.clear("clear_estop", fresh(), true));
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_clear_rejects_stale_control() {
        let (gate, _) = gate();
        assert!(!gate.clear("CLEAR_ESTOP", Duration::from_millis(1600), true));
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_clear_rejects_disconnected_control() {
        let (gate, _) = gate();
        assert!(!gate.clear("CLEAR_ESTOP", fresh(), false));
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_clear_rejects_without_psk() {
        let gate = ActuatorGate::new(Box::new(SimActuator::new()), false, false);
        assert!(!gate.clear("CLEAR_ESTOP", fresh(), true));
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_clear_requires_engaged_latch() {
        let (gate, _) = gate();
        assert!(gate.clear("CLEAR_ESTOP", fresh(), true));
        // Second clear: latch is already open.
        assert!(!gate.clear("CLEAR_ESTOP", fresh(), true));
    }

    #[test]
    fn test_clear_exactly_at_age_limit_is_accepted() {
        let (gate, _) = gate();
        assert!(gate.clear("CLEAR_ESTOP", ESTOP_CLEAR_MAX_AGE, true));
    }

    // ── Engage semantics ──────────────────────────────────────────────────

    #[test]
    fn test_engage_forces_safe_state_from_running() {
        let (gate, handle) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);
        gate.set_motor(2, 720);
        gate.set_servo(0.1);
        assert_eq!(handle.state().motor_speeds[2], 720);

        gate.engage(EstopReason::WatchdogTimeout, "no control for 5.2s");

        let state = handle.state();
        assert_eq!(state.motor_speeds, [0i16; MOTOR_COUNT]);
        assert!((state.servo_position - SERVO_NEUTRAL).abs() < f32::EPSILON);
        assert_eq!(gate.info().reason, EstopReason::WatchdogTimeout);
    }

    #[test]
    fn test_engage_is_idempotent_in_the_audit_ring() {
        let (gate, _) = gate();
        gate.engage(EstopReason::WatchdogTimeout, "first");
        gate.engage(EstopReason::WatchdogTimeout, "second");
        // Boot latch only: engaging an engaged latch records nothing new,
        // though the reason is refreshed.
        assert_eq!(gate.history().len(), 1);
    }

    #[test]
    fn test_reengage_after_clear_records_both_edges() {
        let (gate, _) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);
        gate.engage(EstopReason::OperatorCommand, "operator hit the button");

        let actions: Vec<&str> = gate.history().iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["ENGAGED", "CLEARED", "ENGAGED"]);
    }

    // ── Hardware failure handling ─────────────────────────────────────────

    #[test]
    fn test_motor_write_failure_engages_estop() {
        let (gate, handle) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);

        handle.fail_device("motor 3");
        assert!(!gate.set_motor(3, 400));

        assert!(gate.is_engaged());
        assert_eq!(gate.info().reason, EstopReason::InternalError);
        // Other motors were still driven to the safe state.
        assert_eq!(handle.state().motor_speeds[0], 0);
    }

    #[test]
    fn test_engage_completes_despite_driver_failures() {
        let (gate, handle) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);

        handle.fail_device("motor 5");
        handle.fail_device("servo");
        gate.engage(EstopReason::OperatorCommand, "with broken drivers");

        assert!(gate.is_engaged());
        assert!(gate.engage_write_failures() >= 2);
    }

    // ── Clamping ──────────────────────────────────────────────────────────

    #[test]
    fn test_actuation_values_are_clamped() {
        let (gate, handle) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);

        gate.set_motor(1, 5000);
        gate.set_servo(-3.0);
        gate.set_servo_duty_raw(250.0);

        let state = handle.state();
        assert_eq!(state.motor_speeds[1], 800);
        assert_eq!(state.servo_position, 0.0);
        assert_eq!(state.servo_duty, Some(100.0));
    }

    #[test]
    fn test_out_of_range_motor_is_rejected_without_estop() {
        let (gate, _) = gate();
        gate.clear("CLEAR_ESTOP", fresh(), true);
        assert!(!gate.set_motor(12, 100));
        assert!(!gate.is_engaged());
    }

    // ── Local clear gating ────────────────────────────────────────────────

    #[test]
    fn test_clear_local_rejected_by_default() {
        let (gate, _) = gate();
        assert!(!gate.clear_local());
        assert!(gate.is_engaged());
    }

    #[test]
    fn test_clear_local_allowed_when_deployment_gated_on() {
        let gate = ActuatorGate::new(Box::new(SimActuator::new()), true, true);
        assert!(gate.clear_local());
        assert!(!gate.is_engaged());
        let last = gate.history().pop();
        assert_eq!(last.map(|e| e.reason), Some(EstopReason::DashboardManual));
    }

    // ── Concurrency ───────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_engage_wins_over_actuation() {
        use std::sync::Arc;

        let actuator = SimActuator::new();
        let handle = actuator.handle();
        let gate = Arc::new(ActuatorGate::new(Box::new(actuator), true, false));
        gate.clear("CLEAR_ESTOP", fresh(), true);

        let engager = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || {
                gate.engage(EstopReason::OperatorCommand, "race test");
            })
        };

        // Hammer actuations while the engage lands.
        for _ in 0..1000 {
            gate.set_motor(0, 300);
        }
        engager.join().expect("engager thread");

        // After the engage, no write can have left a motor running.
        for _ in 0..100 {
            gate.set_motor(0, 300);
        }
        assert!(gate.is_engaged());
        assert_eq!(handle.state().motor_speeds[0], 0);
    }
}
