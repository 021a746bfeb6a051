//! Command executor: routes authenticated control payloads to actuation.
//!
//! Commands arrive here only after frame authentication and replay
//! checking; this module decodes the JSON, applies the input mapping, and
//! drives the actuator gate. Unknown commands are logged and ignored -
//! they never actuate.
//!
//! # Input mapping (authoritative)
//!
//! - Axis 1 (left stick Y), |v| > 0.15: motor 2 = v * 720, 1.5s run limit
//! - Axis 3 (right stick Y), |v| > 0.15: motor 3 = -v * 720 (swapped)
//! - Button 0 press: motor 0 = +760; release: 0
//! - Button 1 press: motor 0 = -760; release: 0
//! - Button 6 press: motor 4 = -720 (chainsaw 1 on, swapped); release: 0;
//!   double-press within 400ms starts autocut CS1
//! - Button 7 press: motor 5 = +720; double-press: autocut CS2
//! - Button 11 press: servo 0.0056 + motor 7 = +400; release: motor 7 = 0
//!   then servo 0.3333
//!
//! Two background monitors guard against a stuck operator link:
//!
//! - claw monitor (100ms): stops motors 0-1 after 500ms without input
//! - feed monitor (50ms): stops motor 2/3 after 1.5s of continuous run,
//!   skipping any chainsaw currently owned by an autocutter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::AutocutConfig;
use crate::constants::{
    AUTOCUT_DOUBLE_PRESS_WINDOW, CHAINSAW_RUN_LIMIT, CHAINSAW_TIMEOUT_POLL, ESTOP_DEDUP_WINDOW,
    INPUT_TIMEOUT, MOTOR_TIMEOUT_POLL, PONG_MAX_AGE,
};
use crate::hardware::{SensorSource, VideoCapture};
use crate::protocol::{
    unix_now, BrakeAction, Command, CommandDecodeError, EstopReason, InputEvent, InputKind,
    MoveDirection, PongData, SwitchAction,
};
use crate::robot::autocut::AutonomousCutter;
use crate::robot::gate::ActuatorGate;
use crate::robot::ControlLink;

/// Analog stick deadzone.
const AXIS_DEADZONE: f64 = 0.15;

/// Feed / blade speed at 90% power.
const CHAINSAW_SPEED: i16 = 720;

/// Claw motor speed at 95% power.
const CLAW_SPEED: i16 = 760;

/// Hoist / traverse / descent speed at 50% power.
const HALF_SPEED: i16 = 400;

/// Brake servo engaged position (1 degree of 180).
const BRAKE_ENGAGE_POSITION: f32 = 0.0056;

/// Brake servo released position (60 degrees of 180).
const BRAKE_RELEASE_POSITION: f32 = 0.3333;

#[derive(Debug, Default)]
struct PingRecord {
    ping_ts: f64,
    ping_seq: u64,
    received: Option<Instant>,
}

#[derive(Debug, Default)]
struct EstopDedup {
    last_time: Option<Instant>,
    last_engage: Option<bool>,
}

#[derive(Debug)]
struct ChainsawTimers {
    /// Feed motor start instants, index 0 = CS1 (motor 2), 1 = CS2 (motor 3).
    start: [Option<Instant>; 2],
}

/// Values cached from operator updates for the next telemetry snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct CachedReadings {
    /// Last `height_update` value.
    pub height: f32,
    /// Last `force_update` value.
    pub force: f32,
}

/// Decodes control payloads and drives the actuator gate.
pub struct CommandExecutor {
    gate: Arc<ActuatorGate>,
    sensors: Arc<dyn SensorSource>,
    video: Option<Arc<dyn VideoCapture>>,
    link: Arc<ControlLink>,
    autocut_cfg: AutocutConfig,

    cached: Mutex<CachedReadings>,
    ping: Mutex<PingRecord>,
    dedup: Mutex<EstopDedup>,

    last_input: Mutex<Instant>,
    chainsaw: Mutex<ChainsawTimers>,
    double_press: Mutex<[Option<Instant>; 2]>,

    cutters: Mutex<[Option<Arc<AutonomousCutter>>; 2]>,
    /// Autocut ownership flags; while set, the feed monitor and the
    /// manual chainsaw triggers leave that chainsaw's motors alone.
    autocut_active: [Arc<AtomicBool>; 2],
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor").finish_non_exhaustive()
    }
}

impl CommandExecutor {
    /// Wire the executor to its collaborators.
    pub fn new(
        gate: Arc<ActuatorGate>,
        sensors: Arc<dyn SensorSource>,
        video: Option<Arc<dyn VideoCapture>>,
        link: Arc<ControlLink>,
        autocut_cfg: AutocutConfig,
    ) -> Self {
        Self {
            gate,
            sensors,
            video,
            link,
            autocut_cfg,
            cached: Mutex::new(CachedReadings::default()),
            ping: Mutex::new(PingRecord::default()),
            dedup: Mutex::new(EstopDedup::default()),
            last_input: Mutex::new(Instant::now()),
            chainsaw: Mutex::new(ChainsawTimers { start: [None, None] }),
            double_press: Mutex::new([None, None]),
            cutters: Mutex::new([None, None]),
            autocut_active: [
                Arc::new(AtomicBool::new(false)),
                Arc::new(AtomicBool::new(false)),
            ],
        }
    }

    /// Process one authenticated control payload.
    ///
    /// Decode failures bubble up so the control server can close the
    /// connection and engage E-STOP with reason `decode_error`.
    pub fn process(&self, payload: &[u8], seq: u64) -> Result<(), CommandDecodeError> {
        let message = Command::parse_message(payload)?;
        self.link.touch(seq);

        log::debug!("Command: type={}, seq={seq}", message.command.kind());

        match message.command {
            Command::EmergencyStop {
                engage,
                reason,
                confirm_clear,
            } => self.handle_emergency_stop(engage, reason.as_deref(), confirm_clear.as_deref()),
            Command::Ping { ts, seq: ping_seq } => self.handle_ping(ts, ping_seq),
            Command::ClampClose {} => {
                self.gate.set_servo(0.0);
            }
            Command::ClampOpen {} => {
                self.gate.set_servo(1.0);
            }
            Command::HeightUpdate { height } => lock(&self.cached).height = height,
            Command::ForceUpdate { force } => lock(&self.cached).force = force,
            Command::StartCamera { camera_id } => {
                if let Some(video) = &self.video {
                    video.set_active_camera(camera_id);
                }
            }
            Command::InputEvent(event) => self.handle_input_event(event),
            Command::RawButtonPress {} => {
                log::debug!("raw_button_press received (log only)");
            }
            Command::ChainsawCommand {
                chainsaw_id,
                action,
            } => self.handle_chainsaw_command(chainsaw_id, action),
            Command::ChainsawMove {
                chainsaw_id,
                direction,
            } => self.handle_chainsaw_move(chainsaw_id, direction),
            Command::ClimbCommand { direction } => self.handle_climb(direction),
            Command::TraverseCommand { direction } => self.handle_traverse(direction),
            Command::BrakeCommand { action } => self.handle_brake(action),
            Command::Unknown { raw } => {
                log::warn!("Unknown command type: {raw} (ignored)");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emergency stop
    // ------------------------------------------------------------------

    fn handle_emergency_stop(
        &self,
        engage: bool,
        reason: Option<&str>,
        confirm_clear: Option<&str>,
    ) {
        // Deduplicate identical commands inside the window; opposite
        // commands are processed but flagged as a rapid toggle.
        {
            let mut dedup = lock(&self.dedup);
            if let (Some(at), Some(last_engage)) = (dedup.last_time, dedup.last_engage) {
                let age = at.elapsed();
                if age < ESTOP_DEDUP_WINDOW {
                    if last_engage == engage {
                        log::debug!(
                            "E-STOP dedup: ignoring duplicate {} command (age={}ms)",
                            if engage { "ENGAGE" } else { "CLEAR" },
                            age.as_millis()
                        );
                        return;
                    }
                    log::warn!(
                        "E-STOP rapid toggle: was {}, now {} (age={}ms)",
                        if last_engage { "ENGAGE" } else { "CLEAR" },
                        if engage { "ENGAGE" } else { "CLEAR" },
                        age.as_millis()
                    );
                }
            }
            dedup.last_time = Some(Instant::now());
            dedup.last_engage = Some(engage);
        }

        if engage {
            let detail = reason.unwrap_or("operator_command");
            log::warn!("E-STOP ENGAGE command received: {detail}");
            self.gate.engage(EstopReason::OperatorCommand, detail);
        } else {
            let confirm = confirm_clear.unwrap_or("");
            let cleared = self
                .gate
                .clear(confirm, self.link.control_age(), self.link.is_connected());
            if cleared {
                log::info!("E-STOP CLEARED by operator command");
            } else {
                log::warn!("E-STOP clear REJECTED (see previous log)");
            }
        }
    }

    // ------------------------------------------------------------------
    // Ping / pong
    // ------------------------------------------------------------------

    fn handle_ping(&self, ts: f64, seq: u64) {
        let mut ping = lock(&self.ping);
        ping.ping_ts = ts;
        ping.ping_seq = seq;
        ping.received = Some(Instant::now());
        log::debug!("Received ping: ts={ts}, seq={seq}");
    }

    /// Pong echo for the next telemetry snapshot, if a ping arrived
    /// within the last 5 seconds.
    pub fn pong_data(&self) -> Option<PongData> {
        let ping = lock(&self.ping);
        let received = ping.received?;
        if received.elapsed() < PONG_MAX_AGE && ping.ping_ts > 0.0 {
            Some(PongData {
                ping_ts: ping.ping_ts,
                ping_seq: ping.ping_seq,
                robot_ts: unix_now(),
            })
        } else {
            None
        }
    }

    /// Operator-supplied height/force caches for telemetry.
    pub fn cached_readings(&self) -> CachedReadings {
        *lock(&self.cached)
    }

    // ------------------------------------------------------------------
    // Input events
    // ------------------------------------------------------------------

    fn touch_input(&self) {
        *lock(&self.last_input) = Instant::now();
    }

    fn handle_input_event(&self, event: InputEvent) {
        self.touch_input();

        match event.kind {
            InputKind::Axis => self.handle_axis(event.index, event.value),
            InputKind::Button => self.handle_button(event.index, event.value > 0.0),
        }
    }

    fn handle_axis(&self, index: u32, value: f64) {
        match index {
            // Left stick Y: chainsaw 1 feed (motor 2).
            1 => self.drive_feed_axis(1, value, false),
            // Right stick Y: chainsaw 2 feed (motor 3), direction swapped.
            3 => self.drive_feed_axis(2, value, true),
            _ => {}
        }
    }

    /// Axis-driven feed control with the shared run-limit timer. All motor
    /// writes happen under the chainsaw timer lock so the feed monitor
    /// cannot race a concurrent stop.
    fn drive_feed_axis(&self, chainsaw_id: u8, value: f64, swapped: bool) {
        let motor = 1 + chainsaw_id; // 1 -> motor 2, 2 -> motor 3
        let slot = (chainsaw_id - 1) as usize;

        if value.abs() < AXIS_DEADZONE {
            let mut timers = lock(&self.chainsaw);
            timers.start[slot] = None;
            self.gate.set_motor(motor, 0);
            return;
        }

        let mut timers = lock(&self.chainsaw);
        if timers.start[slot].is_none() {
            timers.start[slot] = Some(Instant::now());
            log::debug!("Chainsaw {chainsaw_id}: run timer started via axis");
        }
        let sign = if swapped { -1.0 } else { 1.0 };
        let speed = (sign * value * f64::from(CHAINSAW_SPEED)) as i16;
        self.gate.set_motor(motor, speed);
    }

    fn handle_button(&self, index: u32, pressed: bool) {
        match index {
            // Claw open / close on motor 0.
            0 => {
                self.gate.set_motor(0, if pressed { CLAW_SPEED } else { 0 });
            }
            1 => {
                self.gate.set_motor(0, if pressed { -CLAW_SPEED } else { 0 });
            }
            // L2 / R2: chainsaw blade on/off with double-press autocut.
            6 => self.handle_blade_trigger(1, pressed),
            7 => self.handle_blade_trigger(2, pressed),
            // Dpad down: brake + descent.
            11 => {
                if pressed {
                    self.gate.set_servo(BRAKE_ENGAGE_POSITION);
                    self.gate.set_motor(7, HALF_SPEED);
                } else {
                    self.gate.set_motor(7, 0);
                    self.gate.set_servo(BRAKE_RELEASE_POSITION);
                }
            }
            _ => {}
        }
    }

    /// Blade trigger with double-press detection. While an autocutter owns
    /// this chainsaw the trigger is suppressed entirely.
    fn handle_blade_trigger(&self, chainsaw_id: u8, pressed: bool) {
        let slot = (chainsaw_id - 1) as usize;
        self.reap_finished_cutter(slot);

        if self.autocut_active[slot].load(Ordering::SeqCst) {
            return;
        }

        let motor = 3 + chainsaw_id; // 1 -> motor 4, 2 -> motor 5
        if pressed {
            let now = Instant::now();
            let mut presses = lock(&self.double_press);
            let double = presses[slot]
                .is_some_and(|last| now.duration_since(last) < AUTOCUT_DOUBLE_PRESS_WINDOW);
            if double {
                presses[slot] = None;
                drop(presses);
                log::info!("Chainsaw {chainsaw_id} double-press: starting autonomous cut");
                self.start_autocut(chainsaw_id);
            } else {
                presses[slot] = Some(now);
                drop(presses);
                // CS1's blade motor runs with direction swapped.
                let speed = if chainsaw_id == 1 {
                    -CHAINSAW_SPEED
                } else {
                    CHAINSAW_SPEED
                };
                log::info!("Chainsaw {chainsaw_id} ON (motor {motor})");
                self.gate.set_motor(motor, speed);
            }
        } else {
            log::info!("Chainsaw {chainsaw_id} OFF (motor {motor})");
            self.gate.set_motor(motor, 0);
        }
    }

    // ------------------------------------------------------------------
    // Discrete commands
    // ------------------------------------------------------------------

    fn handle_chainsaw_command(&self, chainsaw_id: u8, action: SwitchAction) {
        self.touch_input();
        let chainsaw_id = chainsaw_id.clamp(1, 2);
        let motor = 3 + chainsaw_id;

        if action.is_on() {
            let speed = if chainsaw_id == 1 {
                -CHAINSAW_SPEED // direction swapped
            } else {
                CHAINSAW_SPEED
            };
            log::info!("Chainsaw {chainsaw_id}: motor {motor} ON");
            self.gate.set_motor(motor, speed);
        } else {
            log::info!("Chainsaw {chainsaw_id}: motor {motor} OFF");
            self.gate.set_motor(motor, 0);
        }
    }

    fn handle_chainsaw_move(&self, chainsaw_id: u8, direction: MoveDirection) {
        self.touch_input();
        let chainsaw_id = chainsaw_id.clamp(1, 2);
        let slot = (chainsaw_id - 1) as usize;
        let motor = 1 + chainsaw_id;
        let speed = CHAINSAW_SPEED;

        match direction {
            MoveDirection::Up | MoveDirection::Down => {
                let up = direction == MoveDirection::Up;
                let mut timers = lock(&self.chainsaw);
                if timers.start[slot].is_none() {
                    timers.start[slot] = Some(Instant::now());
                    log::info!("Chainsaw {chainsaw_id} run timer started (1.5s limit)");
                }
                // CS2's feed motor is direction swapped.
                let motor_speed = match (chainsaw_id, up) {
                    (2, true) | (1, false) => -speed,
                    _ => speed,
                };
                self.gate.set_motor(motor, motor_speed);
            }
            _ => {
                let mut timers = lock(&self.chainsaw);
                timers.start[slot] = None;
                self.gate.set_motor(motor, 0);
            }
        }
    }

    fn handle_climb(&self, direction: MoveDirection) {
        self.touch_input();
        if direction == MoveDirection::Up {
            log::info!("Hoist UP: motor 7");
            self.gate.set_motor(7, -HALF_SPEED); // direction swapped
        } else {
            log::info!("Hoist STOP: motor 7");
            self.gate.set_motor(7, 0);
        }
    }

    fn handle_traverse(&self, direction: MoveDirection) {
        self.touch_input();
        match direction {
            MoveDirection::Left => {
                self.gate.set_motor(6, HALF_SPEED);
            }
            MoveDirection::Right => {
                self.gate.set_motor(6, -HALF_SPEED);
            }
            _ => {
                self.gate.set_motor(6, 0);
            }
        }
    }

    fn handle_brake(&self, action: BrakeAction) {
        self.touch_input();
        match action {
            BrakeAction::Engage => {
                log::info!("Brake ENGAGE: servo to 1 degree + descent");
                if !self.gate.set_servo(BRAKE_ENGAGE_POSITION) {
                    log::warn!("Brake ENGAGE: servo command rejected");
                }
                self.gate.set_motor(7, HALF_SPEED);
            }
            BrakeAction::Release => {
                log::info!("Brake RELEASE: motor 7 stop + servo to 60 degrees");
                self.gate.set_motor(7, 0);
                if !self.gate.set_servo(BRAKE_RELEASE_POSITION) {
                    log::warn!("Brake RELEASE: servo command rejected");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Autocut ownership
    // ------------------------------------------------------------------

    fn reap_finished_cutter(&self, slot: usize) {
        let mut cutters = lock(&self.cutters);
        if let Some(cutter) = &cutters[slot] {
            if !cutter.is_running() {
                cutters[slot] = None;
                self.autocut_active[slot].store(false, Ordering::SeqCst);
            }
        }
    }

    /// Start (or restart) an autonomous cut for `chainsaw_id`.
    pub fn start_autocut(&self, chainsaw_id: u8) {
        let slot = (chainsaw_id.clamp(1, 2) - 1) as usize;
        let mut cutters = lock(&self.cutters);

        if let Some(existing) = cutters[slot].take() {
            existing.stop();
        }

        let active = Arc::clone(&self.autocut_active[slot]);
        let on_complete: crate::robot::autocut::CompletionSink = Box::new(move |id| {
            active.store(false, Ordering::SeqCst);
            log::info!("Autocut CS{id} complete - returning to manual control");
        });

        let cutter = Arc::new(AutonomousCutter::new(
            chainsaw_id,
            Arc::clone(&self.gate),
            Arc::clone(&self.sensors),
            self.autocut_cfg,
            on_complete,
        ));

        self.autocut_active[slot].store(true, Ordering::SeqCst);
        // Hand the feed motor over: clear the manual run timer so the
        // feed monitor does not fight the cutter.
        lock(&self.chainsaw).start[slot] = None;

        cutter.start();
        cutters[slot] = Some(cutter);
    }

    /// Stop any running autocut for `chainsaw_id` and return to manual.
    pub fn stop_autocut(&self, chainsaw_id: u8) {
        let slot = (chainsaw_id.clamp(1, 2) - 1) as usize;
        let mut cutters = lock(&self.cutters);
        if let Some(cutter) = cutters[slot].take() {
            cutter.stop();
        }
        self.autocut_active[slot].store(false, Ordering::SeqCst);
        lock(&self.chainsaw).start[slot] = None;
    }

    /// Stop all cutters (shutdown path).
    pub fn stop_all_autocut(&self) {
        self.stop_autocut(1);
        self.stop_autocut(2);
    }

    /// Whether an autocutter currently owns `chainsaw_id`'s motors.
    pub fn autocut_active(&self, chainsaw_id: u8) -> bool {
        let slot = (chainsaw_id.clamp(1, 2) - 1) as usize;
        self.autocut_active[slot].load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Timeout monitors
    // ------------------------------------------------------------------

    /// Spawn the claw and feed timeout monitors. They observe `running`
    /// and exit within one poll interval of shutdown.
    pub fn start_monitors(self: &Arc<Self>, running: &Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let executor = Arc::clone(self);
            let running = Arc::clone(running);
            handles.push(
                std::thread::Builder::new()
                    .name("motor-timeout".into())
                    .spawn(move || executor.motor_timeout_loop(&running))
                    .expect("spawn motor timeout monitor"),
            );
        }
        {
            let executor = Arc::clone(self);
            let running = Arc::clone(running);
            handles.push(
                std::thread::Builder::new()
                    .name("chainsaw-timeout".into())
                    .spawn(move || executor.chainsaw_timeout_loop(&running))
                    .expect("spawn chainsaw timeout monitor"),
            );
        }
        handles
    }

    /// Stop the claw motors (0-1) when input goes stale. Chainsaw, traverse
    /// and hoist motors have explicit stop commands and are excluded.
    fn motor_timeout_loop(&self, running: &AtomicBool) {
        log::info!(
            "Motor timeout monitor started (timeout={}ms)",
            INPUT_TIMEOUT.as_millis()
        );
        let mut motors_active = false;

        while running.load(Ordering::SeqCst) {
            std::thread::sleep(MOTOR_TIMEOUT_POLL);

            let input_age = lock(&self.last_input).elapsed();
            if input_age > INPUT_TIMEOUT {
                if motors_active {
                    log::info!(
                        "Motor timeout: no input for {:.2}s, stopping claw motors",
                        input_age.as_secs_f64()
                    );
                    for motor in 0..2 {
                        self.gate.set_motor(motor, 0);
                    }
                    motors_active = false;
                }
            } else {
                motors_active = true;
            }
        }
        log::info!("Motor timeout monitor stopped");
    }

    /// Stop a feed motor after 1.5s of continuous run, then reset the
    /// timer so the operator can immediately re-engage. Chainsaws owned by
    /// an autocutter are skipped.
    fn chainsaw_timeout_loop(&self, running: &AtomicBool) {
        log::info!(
            "Chainsaw timeout monitor started (limit={}ms)",
            CHAINSAW_RUN_LIMIT.as_millis()
        );

        while running.load(Ordering::SeqCst) {
            std::thread::sleep(CHAINSAW_TIMEOUT_POLL);

            let mut timers = lock(&self.chainsaw);
            for slot in 0..2 {
                if self.autocut_active[slot].load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(started) = timers.start[slot] {
                    let elapsed = started.elapsed();
                    if elapsed > CHAINSAW_RUN_LIMIT {
                        let motor = (2 + slot) as u8;
                        log::info!(
                            "Chainsaw {} run limit: {:.1}s, stopping motor {motor} (ready for reuse)",
                            slot + 1,
                            elapsed.as_secs_f64()
                        );
                        self.gate.set_motor(motor, 0);
                        timers.start[slot] = None;
                    }
                }
            }
        }
        log::info!("Chainsaw timeout monitor stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SimActuator, SimActuatorHandle, SimSensors};

    struct Fixture {
        executor: Arc<CommandExecutor>,
        gate: Arc<ActuatorGate>,
        actuator: SimActuatorHandle,
        link: Arc<ControlLink>,
    }

    fn fixture() -> Fixture {
        let actuator = SimActuator::new();
        let handle = actuator.handle();
        let gate = Arc::new(ActuatorGate::new(Box::new(actuator), true, false));
        let link = Arc::new(ControlLink::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&gate),
            Arc::new(SimSensors::new()),
            None,
            Arc::clone(&link),
            AutocutConfig::default(),
        ));
        Fixture {
            executor,
            gate,
            actuator: handle,
            link,
        }
    }

    /// Fixture with E-STOP cleared and control fresh.
    fn armed_fixture() -> Fixture {
        let f = fixture();
        f.link.set_connected(true);
        f.link.touch(1);
        assert!(f
            .gate
            .clear("CLEAR_ESTOP", std::time::Duration::from_millis(10), true));
        f
    }

    fn send(f: &Fixture, json: &str) {
        f.executor.process(json.as_bytes(), f.link.last_seq() + 1).unwrap();
    }

    // ── Routing ───────────────────────────────────────────────────────────

    #[test]
    fn test_clamp_commands_drive_servo() {
        let f = armed_fixture();
        send(&f, r#"{"type":"clamp_close","data":{},"timestamp":0}"#);
        assert_eq!(f.actuator.state().servo_position, 0.0);
        send(&f, r#"{"type":"clamp_open","data":{},"timestamp":0}"#);
        assert_eq!(f.actuator.state().servo_position, 1.0);
    }

    #[test]
    fn test_height_force_cached_for_telemetry() {
        let f = armed_fixture();
        send(&f, r#"{"type":"height_update","data":{"height":12.5},"timestamp":0}"#);
        send(&f, r#"{"type":"force_update","data":{"force":3.25},"timestamp":0}"#);
        let cached = f.executor.cached_readings();
        assert!((cached.height - 12.5).abs() < f32::EPSILON);
        assert!((cached.force - 3.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unknown_command_never_actuates() {
        let f = armed_fixture();
        send(&f, r#"{"type":"self_destruct","data":{"armed":true},"timestamp":0}"#);
        let state = f.actuator.state();
        assert_eq!(state.motor_speeds, [0i16; 8]);
    }

    #[test]
    fn test_malformed_payload_is_a_decode_error() {
        let f = armed_fixture();
        assert!(f.executor.process(b"not json", 99).is_err());
    }

    #[test]
    fn test_process_touches_control_link() {
        let f = armed_fixture();
        send(&f, r#"{"type":"ping","data":{"ts":1.0,"seq":1},"timestamp":1.0}"#);
        assert_eq!(f.link.last_seq(), 2);
        assert!(f.link.is_established());
    }

    // ── Emergency stop ────────────────────────────────────────────────────

    #[test]
    fn test_emergency_stop_engages() {
        let f = armed_fixture();
        send(&f, r#"{"type":"emergency_stop","data":{"engage":true,"reason":"operator"},"timestamp":0}"#);
        assert!(f.gate.is_engaged());
        assert_eq!(f.gate.info().reason, EstopReason::OperatorCommand);
    }

    #[test]
    fn test_emergency_clear_via_command() {
        let f = fixture();
        f.link.set_connected(true);
        f.link.touch(1);
        send(
            &f,
            r#"{"type":"emergency_stop","data":{"engage":false,"confirm_clear":"CLEAR_ESTOP"},"timestamp":0}"#,
        );
        assert!(!f.gate.is_engaged());
    }

    #[test]
    fn test_emergency_clear_requires_confirm() {
        let f = fixture();
        f.link.set_connected(true);
        f.link.touch(1);
        send(&f, r#"{"type":"emergency_stop","data":{"engage":false},"timestamp":0}"#);
        assert!(f.gate.is_engaged());
    }

    #[test]
    fn test_duplicate_engage_within_window_is_dropped() {
        let f = armed_fixture();
        send(&f, r#"{"type":"emergency_stop","data":{"engage":true},"timestamp":0}"#);
        assert!(f.gate.is_engaged());
        let events_before = f.gate.history().len();

        // Identical command right away: deduplicated, no new processing.
        send(&f, r#"{"type":"emergency_stop","data":{"engage":true},"timestamp":0}"#);
        assert_eq!(f.gate.history().len(), events_before);
    }

    #[test]
    fn test_opposite_toggle_within_window_is_processed() {
        let f = armed_fixture();
        send(&f, r#"{"type":"emergency_stop","data":{"engage":true},"timestamp":0}"#);
        // Opposite direction inside the window: processed (and the clear
        // succeeds because control is fresh).
        send(
            &f,
            r#"{"type":"emergency_stop","data":{"engage":false,"confirm_clear":"CLEAR_ESTOP"},"timestamp":0}"#,
        );
        assert!(!f.gate.is_engaged());
    }

    // ── Ping / pong ───────────────────────────────────────────────────────

    #[test]
    fn test_pong_echoes_recent_ping() {
        let f = armed_fixture();
        send(&f, r#"{"type":"ping","data":{"ts":1234.5,"seq":9},"timestamp":1234.5}"#);
        let pong = f.executor.pong_data().expect("pong for fresh ping");
        assert!((pong.ping_ts - 1234.5).abs() < 1e-9);
        assert_eq!(pong.ping_seq, 9);
        assert!(pong.robot_ts > 0.0);
    }

    #[test]
    fn test_no_pong_without_ping() {
        let f = armed_fixture();
        assert!(f.executor.pong_data().is_none());
    }

    // ── Input mapping ─────────────────────────────────────────────────────

    #[test]
    fn test_axis_1_drives_motor_2_with_deadzone() {
        let f = armed_fixture();

        send(&f, r#"{"type":"input_event","data":{"type":"axis","index":1,"value":0.5},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[2], 360);

        // Inside the deadzone: stop.
        send(&f, r#"{"type":"input_event","data":{"type":"axis","index":1,"value":0.1},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[2], 0);
    }

    #[test]
    fn test_axis_3_drives_motor_3_swapped() {
        let f = armed_fixture();
        send(&f, r#"{"type":"input_event","data":{"type":"axis","index":3,"value":1.0},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[3], -720);
    }

    #[test]
    fn test_claw_buttons() {
        let f = armed_fixture();

        send(&f, r#"{"type":"input_event","data":{"type":"button","index":0,"value":1},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[0], 760);
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":0,"value":0},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[0], 0);

        send(&f, r#"{"type":"input_event","data":{"type":"button","index":1,"value":1},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[0], -760);
    }

    #[test]
    fn test_blade_trigger_single_press() {
        let f = armed_fixture();
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":6,"value":1},"timestamp":0}"#);
        // CS1 blade motor 4, direction swapped.
        assert_eq!(f.actuator.state().motor_speeds[4], -720);
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":6,"value":0},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[4], 0);

        send(&f, r#"{"type":"input_event","data":{"type":"button","index":7,"value":1},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[5], 720);
    }

    #[test]
    fn test_blade_double_press_starts_autocut() {
        let f = armed_fixture();
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":6,"value":1},"timestamp":0}"#);
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":6,"value":0},"timestamp":0}"#);
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":6,"value":1},"timestamp":0}"#);

        assert!(f.executor.autocut_active(1));
        f.executor.stop_all_autocut();
        assert!(!f.executor.autocut_active(1));
    }

    #[test]
    fn test_brake_button() {
        let f = armed_fixture();
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":11,"value":1},"timestamp":0}"#);
        let state = f.actuator.state();
        assert!((state.servo_position - 0.0056).abs() < 1e-6);
        assert_eq!(state.motor_speeds[7], 400);

        send(&f, r#"{"type":"input_event","data":{"type":"button","index":11,"value":0},"timestamp":0}"#);
        let state = f.actuator.state();
        assert_eq!(state.motor_speeds[7], 0);
        assert!((state.servo_position - 0.3333).abs() < 1e-6);
    }

    // ── Discrete motion commands ──────────────────────────────────────────

    #[test]
    fn test_chainsaw_move_directions() {
        let f = armed_fixture();

        send(&f, r#"{"type":"chainsaw_move","data":{"chainsaw_id":1,"direction":"up"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[2], 720);
        send(&f, r#"{"type":"chainsaw_move","data":{"chainsaw_id":1,"direction":"stop"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[2], 0);

        // CS2 feed is direction swapped: up = negative.
        send(&f, r#"{"type":"chainsaw_move","data":{"chainsaw_id":2,"direction":"up"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[3], -720);
        send(&f, r#"{"type":"chainsaw_move","data":{"chainsaw_id":2,"direction":"down"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[3], 720);
    }

    #[test]
    fn test_climb_and_traverse() {
        let f = armed_fixture();

        send(&f, r#"{"type":"climb_command","data":{"direction":"up"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[7], -400);
        send(&f, r#"{"type":"climb_command","data":{"direction":"stop"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[7], 0);

        send(&f, r#"{"type":"traverse_command","data":{"direction":"left"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[6], 400);
        send(&f, r#"{"type":"traverse_command","data":{"direction":"right"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[6], -400);
        send(&f, r#"{"type":"traverse_command","data":{"direction":"stop"},"timestamp":0}"#);
        assert_eq!(f.actuator.state().motor_speeds[6], 0);
    }

    #[test]
    fn test_brake_command() {
        let f = armed_fixture();
        send(&f, r#"{"type":"brake_command","data":{"action":"engage"},"timestamp":0}"#);
        let state = f.actuator.state();
        assert!((state.servo_position - 0.0056).abs() < 1e-6);
        assert_eq!(state.motor_speeds[7], 400);

        send(&f, r#"{"type":"brake_command","data":{"action":"release"},"timestamp":0}"#);
        let state = f.actuator.state();
        assert_eq!(state.motor_speeds[7], 0);
        assert!((state.servo_position - 0.3333).abs() < 1e-6);
    }

    // ── E-STOP blocks everything ──────────────────────────────────────────

    #[test]
    fn test_motion_commands_blocked_while_engaged() {
        let f = fixture(); // still engaged from boot
        send(&f, r#"{"type":"input_event","data":{"type":"button","index":0,"value":1},"timestamp":0}"#);
        send(&f, r#"{"type":"chainsaw_move","data":{"chainsaw_id":1,"direction":"down"},"timestamp":0}"#);
        send(&f, r#"{"type":"clamp_open","data":{},"timestamp":0}"#);

        let state = f.actuator.state();
        assert_eq!(state.motor_speeds, [0i16; 8]);
        assert!((state.servo_position - 0.5).abs() < f32::EPSILON);
    }
}
