//! Robot watchdog: translates timing guarantees into E-STOP engages.
//!
//! SAFETY-CRITICAL:
//!
//! 1. No valid control for 5s -> E-STOP `watchdog_timeout`
//! 2. Control never established within 30s of boot -> E-STOP
//!    `startup_no_control` (and it stays latched)
//! 3. The watchdog only ever ENGAGES E-STOP, never clears it
//! 4. An error inside the loop itself engages `internal_error`, logs,
//!    and the loop continues
//!
//! `DISABLE_WATCHDOG_FOR_LOCAL_TESTING` skips checks 1-2 for bench work
//! and is announced loudly at startup.
//!
//! The loop doubles as the status reporter: every 10 seconds it emits a
//! structured JSON event with uptime, connection states, control age and
//! sequence, E-STOP state, and PSK validity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{STARTUP_GRACE, STATUS_INTERVAL, WATCHDOG_TIMEOUT};
use crate::protocol::EstopReason;
use crate::robot::gate::ActuatorGate;
use crate::robot::ControlLink;

/// Robot-side watchdog and status reporter.
pub struct Watchdog {
    gate: Arc<ActuatorGate>,
    link: Arc<ControlLink>,
    telemetry_connected: Arc<AtomicBool>,
    psk_valid: bool,
    disabled: bool,
    last_status: Instant,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    /// Create the watchdog. `disabled` skips the safety checks and warns.
    pub fn new(
        gate: Arc<ActuatorGate>,
        link: Arc<ControlLink>,
        telemetry_connected: Arc<AtomicBool>,
        psk_valid: bool,
        disabled: bool,
    ) -> Self {
        if disabled {
            log::warn!("============================================================");
            log::warn!("WATCHDOG DISABLED FOR LOCAL TESTING");
            log::warn!("Safety timeouts are NOT enforced");
            log::warn!("============================================================");
        }
        Self {
            gate,
            link,
            telemetry_connected,
            psk_valid,
            disabled,
            last_status: Instant::now(),
        }
    }

    /// Run until `running` clears. Owns its thread; ticks at 1 Hz.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));

            if let Err(e) = self.tick() {
                log::error!("Watchdog error: {e:#}");
                self.gate
                    .engage(EstopReason::InternalError, &format!("watchdog error: {e}"));
            }
        }
        log::info!("Watchdog stopped");
    }

    /// One supervision pass. Separated from `run` so tests can tick
    /// without threads.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if !self.disabled {
            self.check_safety();
        }
        self.log_status()?;
        Ok(())
    }

    fn check_safety(&self) {
        let uptime = self.link.uptime();

        // Startup grace: control must be established within 30s of boot.
        // The engage is edge-guarded so a latched E-STOP keeps its
        // original reason and timestamp.
        if uptime > STARTUP_GRACE && !self.link.is_established() {
            if !self.gate.is_engaged() {
                log::error!(
                    "Control not established after {:.0}s, engaging E-STOP",
                    uptime.as_secs_f64()
                );
                self.gate.engage(
                    EstopReason::StartupNoControl,
                    &format!("no control after {:.0}s", STARTUP_GRACE.as_secs_f64()),
                );
            }
            return;
        }

        // Control freshness, once control has been seen at least once.
        let control_age = self.link.control_age();
        if self.link.is_established()
            && control_age > WATCHDOG_TIMEOUT
            && !self.gate.is_engaged()
        {
            log::error!(
                "Control timeout ({:.1}s), engaging E-STOP",
                control_age.as_secs_f64()
            );
            self.gate.engage(
                EstopReason::WatchdogTimeout,
                &format!("no control for {:.1}s", control_age.as_secs_f64()),
            );
        }
    }

    fn log_status(&mut self) -> anyhow::Result<()> {
        if self.last_status.elapsed() < STATUS_INTERVAL {
            return Ok(());
        }
        self.last_status = Instant::now();

        let estop = self.gate.info();
        let status = serde_json::json!({
            "event": "status",
            "uptime_s": self.link.uptime().as_secs(),
            "control_connected": self.link.is_connected(),
            "control_established": self.link.is_established(),
            "control_age_ms": self.link.control_age().as_millis() as u64,
            "control_seq": self.link.last_seq(),
            "telemetry_connected": self.telemetry_connected.load(Ordering::SeqCst),
            "estop_engaged": estop.engaged,
            "estop_reason": estop.reason.as_str(),
            "psk_valid": self.psk_valid,
            "watchdog_disabled": self.disabled,
        });
        log::info!("{}", serde_json::to_string(&status)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimActuator;

    fn parts() -> (Arc<ActuatorGate>, Arc<ControlLink>) {
        let gate = Arc::new(ActuatorGate::new(Box::new(SimActuator::new()), true, false));
        let link = Arc::new(ControlLink::new());
        (gate, link)
    }

    fn watchdog(gate: &Arc<ActuatorGate>, link: &Arc<ControlLink>, disabled: bool) -> Watchdog {
        Watchdog::new(
            Arc::clone(gate),
            Arc::clone(link),
            Arc::new(AtomicBool::new(false)),
            true,
            disabled,
        )
    }

    #[test]
    fn test_watchdog_never_clears() {
        let (gate, link) = parts();
        link.set_connected(true);
        link.touch(1);
        let mut dog = watchdog(&gate, &link, false);

        assert!(gate.is_engaged()); // boot latch
        dog.tick().unwrap();
        assert!(gate.is_engaged()); // fresh control does not clear anything
    }

    #[test]
    fn test_stale_control_engages_watchdog_timeout() {
        let (gate, link) = parts();
        link.set_connected(true);
        link.touch(1);
        gate.clear("CLEAR_ESTOP", Duration::from_millis(10), true);
        assert!(!gate.is_engaged());

        // Simulate 6s of silence.
        link.rewind_control_clock(Duration::from_secs(6));
        let mut dog = watchdog(&gate, &link, false);
        dog.tick().unwrap();

        assert!(gate.is_engaged());
        assert_eq!(gate.info().reason, EstopReason::WatchdogTimeout);
    }

    #[test]
    fn test_startup_grace_engages_when_control_never_arrives() {
        // A bench deployment cleared the latch locally, but control never
        // arrived: the grace check must re-engage.
        let gate = Arc::new(ActuatorGate::new(Box::new(SimActuator::new()), true, true));
        let link = Arc::new(ControlLink::new());
        assert!(gate.clear_local());
        link.rewind_boot_clock(Duration::from_secs(31));

        let mut dog = watchdog(&gate, &link, false);
        dog.tick().unwrap();

        assert!(gate.is_engaged());
        assert_eq!(gate.info().reason, EstopReason::StartupNoControl);
    }

    #[test]
    fn test_latched_boot_reason_is_preserved_through_grace() {
        // Still latched from boot when the grace period expires: the
        // original reason is kept, not overwritten.
        let (gate, link) = parts();
        link.rewind_boot_clock(Duration::from_secs(31));

        let mut dog = watchdog(&gate, &link, false);
        dog.tick().unwrap();

        assert!(gate.is_engaged());
        assert_eq!(gate.info().reason, EstopReason::BootDefault);
    }

    #[test]
    fn test_disabled_watchdog_skips_checks() {
        let (gate, link) = parts();
        link.set_connected(true);
        link.touch(1);
        gate.clear("CLEAR_ESTOP", Duration::from_millis(10), true);

        link.rewind_control_clock(Duration::from_secs(60));
        link.rewind_boot_clock(Duration::from_secs(60));

        let mut dog = watchdog(&gate, &link, true);
        dog.tick().unwrap();
        assert!(!gate.is_engaged());
    }
}
