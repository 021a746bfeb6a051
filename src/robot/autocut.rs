//! Autonomous chainsaw cutter.
//!
//! State machine that feeds a chainsaw blade into a branch, backs off
//! when the blade binds (current spike), and detects breakthrough by the
//! current signature: after the draw has peaked at least once, a sustained
//! drop below the idle threshold means the branch is cut.
//!
//! ```text
//!              current > high
//!   ADVANCING ----------------> BACKING_OFF
//!       ^                            |
//!       |     current < safe         |
//!       +----------------------------+
//!       |
//!       | has_peaked && current < idle for >= confirm window
//!       v
//!    COMPLETE   (motors stopped, ownership returned to manual control)
//! ```
//!
//! Motor assignment per chainsaw:
//!
//! - CS1: on/off = motor 4 (negated, direction swapped), feed = motor 2
//!   (+speed = up, -speed = down)
//! - CS2: on/off = motor 5, feed = motor 3 (-speed = up, +speed = down,
//!   direction swapped)
//!
//! The decision logic lives in [`CutterFsm`], a pure state machine driven
//! by (current, now) samples, so it can be unit-tested against recorded
//! current traces without threads or sleeps. [`AutonomousCutter`] wraps it
//! in the control-loop thread that reads the current sensor and drives the
//! actuator gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::AutocutConfig;
use crate::hardware::SensorSource;
use crate::robot::gate::ActuatorGate;

/// Callback invoked (with the chainsaw id) when a cut completes naturally,
/// relinquishing motor ownership back to manual control.
pub type CompletionSink = Box<dyn Fn(u8) + Send + Sync>;

/// Cutting phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuttingState {
    /// Feeding the blade down into the branch.
    Advancing,
    /// Reversing the feed until the blade unbinds.
    BackingOff,
    /// Breakthrough confirmed; motors stopped.
    Complete,
}

/// What the control loop should do with the feed motor after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
    /// Drive the feed motor down at the advance speed.
    AdvanceDown,
    /// Drive the feed motor up at the backoff speed.
    BackOffUp,
    /// Stop both motors; the cut is complete.
    Stop,
}

/// Pure breakthrough-detection state machine.
///
/// Feed one `(current, now)` sample per control-loop tick; the returned
/// [`FeedAction`] is what the caller must command. Breakthrough is only
/// reported after the current has exceeded the high threshold at least
/// once, so an idle blade that never touched wood cannot "complete".
#[derive(Debug)]
pub struct CutterFsm {
    cfg: AutocutConfig,
    state: CuttingState,
    has_peaked: bool,
    low_since: Option<Instant>,
}

impl CutterFsm {
    /// New machine in `Advancing`.
    pub fn new(cfg: AutocutConfig) -> Self {
        Self {
            cfg,
            state: CuttingState::Advancing,
            has_peaked: false,
            low_since: None,
        }
    }

    /// Current phase.
    pub fn state(&self) -> CuttingState {
        self.state
    }

    /// Advance the machine by one sample.
    ///
    /// Act-then-transition: the returned action belongs to the state the
    /// machine was in when the sample arrived; any transition it causes
    /// takes effect on the next sample. The control loop drives the motor
    /// before it looks at the reading, so a bind is commanded down for
    /// one last tick before the backoff starts, and breakthrough stops
    /// the motors one tick after confirmation.
    pub fn step(&mut self, current: f64, now: Instant) -> FeedAction {
        let action = match self.state {
            CuttingState::Advancing => FeedAction::AdvanceDown,
            CuttingState::BackingOff => FeedAction::BackOffUp,
            CuttingState::Complete => FeedAction::Stop,
        };

        match self.state {
            CuttingState::Advancing => {
                if current > self.cfg.high_current {
                    self.has_peaked = true;
                    self.low_since = None;
                    self.state = CuttingState::BackingOff;
                } else if self.has_peaked && current < self.cfg.idle_current {
                    match self.low_since {
                        None => self.low_since = Some(now),
                        Some(since) => {
                            if now.duration_since(since) >= self.cfg.breakthrough_confirm {
                                self.state = CuttingState::Complete;
                            }
                        }
                    }
                } else {
                    // Current recovered above idle: the blade is still in
                    // wood, restart the confirmation window.
                    self.low_since = None;
                }
            }
            CuttingState::BackingOff => {
                if current < self.cfg.safe_current {
                    self.state = CuttingState::Advancing;
                }
            }
            CuttingState::Complete => {}
        }

        action
    }
}

/// One running autonomous cut (one chainsaw at a time).
///
/// `start()`/`stop()`/`is_running()` may be called from any thread; the
/// control loop runs in its own thread and exits on completion, on
/// `stop()`, or when the bridge shuts down.
pub struct AutonomousCutter {
    chainsaw_id: u8,
    gate: Arc<ActuatorGate>,
    sensors: Arc<dyn SensorSource>,
    cfg: AutocutConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    on_complete: Mutex<Option<CompletionSink>>,
}

impl std::fmt::Debug for AutonomousCutter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutonomousCutter")
            .field("chainsaw_id", &self.chainsaw_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl AutonomousCutter {
    /// Create a cutter for `chainsaw_id` (1 or 2).
    pub fn new(
        chainsaw_id: u8,
        gate: Arc<ActuatorGate>,
        sensors: Arc<dyn SensorSource>,
        cfg: AutocutConfig,
        on_complete: CompletionSink,
    ) -> Self {
        Self {
            chainsaw_id,
            gate,
            sensors,
            cfg,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            on_complete: Mutex::new(Some(on_complete)),
        }
    }

    fn onoff_motor(&self) -> u8 {
        if self.chainsaw_id == 1 {
            4
        } else {
            5
        }
    }

    fn feed_motor(&self) -> u8 {
        if self.chainsaw_id == 1 {
            2
        } else {
            3
        }
    }

    fn sensor_key(&self) -> &'static str {
        if self.chainsaw_id == 1 {
            "cs1"
        } else {
            "cs2"
        }
    }

    /// Turn on the blade and launch the control loop.
    pub fn start(self: &Arc<Self>) {
        log::info!(
            "Autocut CS{}: starting (high={}A safe={}A idle={}A advance={} backoff={})",
            self.chainsaw_id,
            self.cfg.high_current,
            self.cfg.safe_current,
            self.cfg.idle_current,
            self.cfg.advance_speed,
            self.cfg.backoff_speed
        );

        // Blade on. CS1's on/off motor runs with direction swapped.
        let onoff_speed = if self.chainsaw_id == 1 {
            -self.cfg.onoff_speed
        } else {
            self.cfg.onoff_speed
        };
        self.gate.set_motor(self.onoff_motor(), onoff_speed);

        self.running.store(true, Ordering::SeqCst);
        let cutter = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("autocut-cs{}", self.chainsaw_id))
            .spawn(move || cutter.control_loop())
            .expect("spawn autocut thread");
        *lock(&self.thread) = Some(handle);
    }

    /// Signal the loop to exit, wait for it, and stop both motors.
    pub fn stop(&self) {
        log::info!("Autocut CS{}: stop requested", self.chainsaw_id);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
        self.stop_motors();
    }

    /// True while the control loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current(&self) -> f64 {
        self.sensors
            .read_currents()
            .get(self.sensor_key())
            .map_or(0.0, |r| r.current)
    }

    fn set_feed(&self, down: bool, speed: i16) {
        // CS1 motor 2: +up/-down. CS2 motor 3: -up/+down (swapped).
        let motor_speed = if self.chainsaw_id == 1 {
            if down {
                -speed
            } else {
                speed
            }
        } else if down {
            speed
        } else {
            -speed
        };
        self.gate.set_motor(self.feed_motor(), motor_speed);
    }

    fn stop_motors(&self) {
        self.gate.set_motor(self.feed_motor(), 0);
        self.gate.set_motor(self.onoff_motor(), 0);
    }

    fn control_loop(self: Arc<Self>) {
        log::info!("Autocut CS{}: control loop started", self.chainsaw_id);
        let mut fsm = CutterFsm::new(self.cfg);
        let mut completed_naturally = false;
        let mut last_state = fsm.state();

        while self.running.load(Ordering::SeqCst) {
            let current = self.current();

            match fsm.step(current, Instant::now()) {
                FeedAction::AdvanceDown => self.set_feed(true, self.cfg.advance_speed),
                FeedAction::BackOffUp => self.set_feed(false, self.cfg.backoff_speed),
                FeedAction::Stop => {
                    completed_naturally = true;
                    self.running.store(false, Ordering::SeqCst);
                }
            }

            let state = fsm.state();
            if state != last_state {
                log::info!(
                    "Autocut CS{}: {current:.2}A -> {state:?}",
                    self.chainsaw_id
                );
                last_state = state;
            }

            if self.running.load(Ordering::SeqCst) {
                std::thread::sleep(self.cfg.loop_interval);
            }
        }

        self.stop_motors();

        if completed_naturally {
            log::info!(
                "Autocut CS{}: breakthrough confirmed, branch cut",
                self.chainsaw_id
            );
            if let Some(on_complete) = lock(&self.on_complete).take() {
                on_complete(self.chainsaw_id);
            }
        }

        log::info!(
            "Autocut CS{}: control loop ended (state={:?}, natural={completed_naturally})",
            self.chainsaw_id,
            fsm.state()
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
