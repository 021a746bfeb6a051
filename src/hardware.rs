//! Hardware abstraction traits and their SIM_MODE implementations.
//!
//! Every piece of hardware the bridge touches sits behind a trait so the
//! core can be exercised without a robot on the bench:
//!
//! - [`Actuator`] - motor driver boards and the clamp/brake servo
//! - [`SensorSource`] - IMU, barometer, and current sensors
//! - [`VideoCapture`] - camera frames as JPEG bytes
//! - [`TelemetrySink`] - base-side fan-out targets for snapshots
//!
//! Real driver bindings (Motoron over I2C, BNO085, BMP388, INA219,
//! V4L2 cameras) live out of tree and plug in through these traits. The
//! simulated implementations here record commanded values and synthesize
//! smooth sensor traces, and are what `SIM_MODE=true` wires up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::constants::{MOTOR_COUNT, MOTOR_SPEED_LIMIT, SERVO_NEUTRAL};
use crate::protocol::{BaroSnapshot, ImuSnapshot, TelemetrySnapshot};

/// A motor or servo write failed at the driver level.
///
/// All hardware failures surface as this one kind; the actuator gate
/// reacts to any of them by engaging E-STOP with reason `internal_error`.
#[derive(Debug, Clone)]
pub struct HardwareError {
    /// Which device failed, e.g. `"motor 3"` or `"servo"`.
    pub device: String,
    /// Driver-level failure description.
    pub message: String,
}

impl HardwareError {
    /// Construct an error for `device`.
    pub fn new(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HardwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.device, self.message)
    }
}

impl std::error::Error for HardwareError {}

/// Motor and servo output. Implementations do not enforce E-STOP; that is
/// the actuator gate's job, and nothing else may hold an `Actuator`.
pub trait Actuator: Send {
    /// Drive motor `id` (0..8) at `speed` (-800..=800, 0 = stop).
    fn set_motor(&mut self, id: u8, speed: i16) -> Result<(), HardwareError>;

    /// Move the clamp servo to `position` (0.0..=1.0, 0.5 = neutral).
    fn set_servo_position(&mut self, position: f32) -> Result<(), HardwareError>;

    /// Drive the servo PWM duty cycle directly (0.0..=100.0 percent).
    fn set_servo_duty_raw(&mut self, duty: f32) -> Result<(), HardwareError>;

    /// Per-motor current draw in amps. Channels that cannot be read
    /// report 0.0.
    fn read_motor_currents(&mut self) -> [f32; MOTOR_COUNT];
}

/// One named current sensor reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerReading {
    /// Bus voltage in volts.
    pub voltage: f64,
    /// Current in amps.
    pub current: f64,
    /// Power in watts.
    pub power: f64,
}

/// Cached sensor access. Reads never block on I2C: implementations poll in
/// the background and serve the most recent values.
pub trait SensorSource: Send + Sync {
    /// Latest IMU reading, `None` until the sensor has produced one.
    fn read_imu(&self) -> Option<ImuSnapshot>;

    /// Latest barometer reading.
    fn read_barometer(&self) -> Option<BaroSnapshot>;

    /// Latest named current sensor readings (`"battery"`, `"cs1"`, `"cs2"`, ...).
    fn read_currents(&self) -> HashMap<String, PowerReading>;
}

/// Camera statistics for status events.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoStats {
    /// Currently selected camera index.
    pub active_camera: u32,
    /// Frames produced since start.
    pub frames_captured: u64,
}

/// Camera frame source.
pub trait VideoCapture: Send + Sync {
    /// Switch the active camera.
    fn set_active_camera(&self, id: u32);

    /// Capture statistics.
    fn stats(&self) -> VideoStats;

    /// Most recent JPEG frame, if any. Returns a fresh frame at most once
    /// per call site poll; implementations decide staleness.
    fn latest_frame(&self) -> Option<Vec<u8>>;
}

/// A base-side consumer of telemetry snapshots.
///
/// `push` must never block: storage writers enqueue into a bounded queue
/// and drop on overflow, broadcasters use non-blocking sends. A failing
/// sink must not affect its siblings.
pub trait TelemetrySink: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Offer one snapshot to this sink.
    fn push(&self, snapshot: &TelemetrySnapshot);
}

// ============================================================================
// Simulated actuator
// ============================================================================

/// Inspectable state of the simulated actuator.
#[derive(Debug, Clone)]
pub struct SimActuatorState {
    /// Last commanded speed per motor.
    pub motor_speeds: [i16; MOTOR_COUNT],
    /// Last commanded servo position (0.0..=1.0).
    pub servo_position: f32,
    /// Last commanded raw duty, if any.
    pub servo_duty: Option<f32>,
    /// Total hardware writes performed.
    pub writes: u64,
    /// When non-empty, writes naming these devices fail (test hook).
    pub failing_devices: Vec<String>,
}

impl Default for SimActuatorState {
    fn default() -> Self {
        Self {
            motor_speeds: [0; MOTOR_COUNT],
            servo_position: SERVO_NEUTRAL,
            servo_duty: None,
            writes: 0,
            failing_devices: Vec::new(),
        }
    }
}

/// Shared handle for inspecting (and fault-injecting into) a [`SimActuator`].
#[derive(Debug, Clone)]
pub struct SimActuatorHandle {
    state: Arc<Mutex<SimActuatorState>>,
}

impl SimActuatorHandle {
    /// Snapshot of the recorded state.
    pub fn state(&self) -> SimActuatorState {
        lock(&self.state).clone()
    }

    /// Make writes to `device` (e.g. `"motor 2"`, `"servo"`) fail until
    /// cleared. Used by fault-injection tests.
    pub fn fail_device(&self, device: &str) {
        lock(&self.state).failing_devices.push(device.to_owned());
    }

    /// Clear all injected faults.
    pub fn clear_faults(&self) {
        lock(&self.state).failing_devices.clear();
    }
}

/// SIM_MODE actuator: records commanded values in memory and synthesizes
/// current draw proportional to commanded speed.
#[derive(Debug, Default)]
pub struct SimActuator {
    state: Arc<Mutex<SimActuatorState>>,
}

impl SimActuator {
    /// New simulated actuator, motors stopped, servo at neutral.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for inspecting this actuator's recorded state.
    pub fn handle(&self) -> SimActuatorHandle {
        SimActuatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn check_fault(
        state: &SimActuatorState,
        device: &str,
    ) -> Result<(), HardwareError> {
        if state.failing_devices.iter().any(|d| d == device) {
            return Err(HardwareError::new(device, "injected fault"));
        }
        Ok(())
    }
}

impl Actuator for SimActuator {
    fn set_motor(&mut self, id: u8, speed: i16) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        let device = format!("motor {id}");
        Self::check_fault(&state, &device)?;
        let slot = state
            .motor_speeds
            .get_mut(id as usize)
            .ok_or_else(|| HardwareError::new(&device, "no such channel"))?;
        *slot = speed.clamp(-MOTOR_SPEED_LIMIT, MOTOR_SPEED_LIMIT);
        state.writes += 1;
        Ok(())
    }

    fn set_servo_position(&mut self, position: f32) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        Self::check_fault(&state, "servo")?;
        state.servo_position = position.clamp(0.0, 1.0);
        state.writes += 1;
        Ok(())
    }

    fn set_servo_duty_raw(&mut self, duty: f32) -> Result<(), HardwareError> {
        let mut state = lock(&self.state);
        Self::check_fault(&state, "servo")?;
        state.servo_duty = Some(duty.clamp(0.0, 100.0));
        state.writes += 1;
        Ok(())
    }

    fn read_motor_currents(&mut self) -> [f32; MOTOR_COUNT] {
        let state = lock(&self.state);
        // Mock current draw proportional to speed, 0.5 A at full throttle.
        let mut currents = [0.0f32; MOTOR_COUNT];
        for (current, speed) in currents.iter_mut().zip(state.motor_speeds.iter()) {
            *current = f32::from(speed.unsigned_abs()) / 800.0 * 0.5;
        }
        currents
    }
}

// ============================================================================
// Simulated sensors
// ============================================================================

/// SIM_MODE sensor source: smooth sinusoidal IMU/barometer/current traces
/// keyed off elapsed time, plus an injection hook for tests and the
/// stress tooling.
#[derive(Debug)]
pub struct SimSensors {
    start: Instant,
    injected: Mutex<HashMap<String, f64>>,
}

impl SimSensors {
    /// New simulated sensor source.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            injected: Mutex::new(HashMap::new()),
        }
    }

    /// Override the current (amps) reported for sensor `name` until
    /// changed. The autocut tests drive the cut sequence through this.
    pub fn inject_current(&self, name: &str, amps: f64) {
        lock(&self.injected).insert(name.to_owned(), amps);
    }

    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for SimSensors {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimSensors {
    fn read_imu(&self) -> Option<ImuSnapshot> {
        let t = self.elapsed();
        Some(ImuSnapshot {
            quat_w: 1.0,
            quat_x: 0.0,
            quat_y: 0.0,
            quat_z: 0.0,
            accel_x: 0.01 * (t * 0.5).sin(),
            accel_y: 0.01 * (t * 0.5).cos(),
            accel_z: 9.81 + 0.01 * (t * 0.3).sin(),
            gyro_x: 0.001 * (t * 0.7).sin(),
            gyro_y: 0.001 * (t * 0.7).cos(),
            gyro_z: 0.001 * (t * 0.9).sin(),
        })
    }

    fn read_barometer(&self) -> Option<BaroSnapshot> {
        let t = self.elapsed();
        Some(BaroSnapshot {
            pressure: 1013.25 + 0.1 * (t * 0.1).sin(),
            temperature: 25.0 + 0.5 * (t * 0.05).sin(),
            altitude: 100.0 + 0.1 * (t * 0.2).sin(),
        })
    }

    fn read_currents(&self) -> HashMap<String, PowerReading> {
        let t = self.elapsed();
        let injected = lock(&self.injected).clone();

        let mut out = HashMap::new();
        let mut insert = |name: &str, voltage: f64, current_a: f64| {
            let current = injected.get(name).copied().unwrap_or(current_a);
            out.insert(
                name.to_owned(),
                PowerReading {
                    voltage,
                    current,
                    power: voltage * current,
                },
            );
        };

        insert("battery", 12.5, 0.8 + 0.2 * (t * 0.5).sin());
        insert("system", 5.1, 0.4 + 0.1 * (t * 0.7).sin());
        insert("servo", 5.0, 0.05 + 0.4 * (t * 0.2).sin().abs());
        insert("cs1", 12.5, 0.0);
        insert("cs2", 12.5, 0.0);
        out
    }
}

// ============================================================================
// Simulated video
// ============================================================================

/// SIM_MODE camera: synthesizes a small well-formed JPEG-delimited frame
/// per poll, tagged with the active camera and a frame counter.
#[derive(Debug)]
pub struct SimVideoCapture {
    camera_count: u32,
    active_camera: AtomicU32,
    frames: AtomicU64,
}

impl SimVideoCapture {
    /// Single simulated camera.
    pub fn new() -> Self {
        Self::with_cameras(1)
    }

    /// Simulated source with `camera_count` selectable cameras.
    pub fn with_cameras(camera_count: u32) -> Self {
        Self {
            camera_count: camera_count.max(1),
            active_camera: AtomicU32::new(0),
            frames: AtomicU64::new(0),
        }
    }
}

impl Default for SimVideoCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoCapture for SimVideoCapture {
    fn set_active_camera(&self, id: u32) {
        if id >= self.camera_count {
            log::warn!(
                "Camera {id} out of range (have {}), keeping current",
                self.camera_count
            );
            return;
        }
        self.active_camera.store(id, Ordering::SeqCst);
        log::info!("Sim camera switched to {id}");
    }

    fn stats(&self) -> VideoStats {
        VideoStats {
            active_camera: self.active_camera.load(Ordering::SeqCst),
            frames_captured: self.frames.load(Ordering::SeqCst),
        }
    }

    fn latest_frame(&self) -> Option<Vec<u8>> {
        let n = self.frames.fetch_add(1, Ordering::SeqCst);
        let camera = self.active_camera.load(Ordering::SeqCst);

        // SOI, a low-byte body that cannot alias a marker, EOI.
        let mut frame = vec![0xff, 0xd8];
        frame.extend_from_slice(format!("sim-cam{camera}-frame{n:08}").as_bytes());
        frame.extend_from_slice(&[0xff, 0xd9]);
        Some(frame)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_actuator_records_and_clamps() {
        let mut actuator = SimActuator::new();
        let handle = actuator.handle();

        actuator.set_motor(0, 760).unwrap();
        actuator.set_motor(1, -2000).unwrap();
        actuator.set_servo_position(1.7).unwrap();

        let state = handle.state();
        assert_eq!(state.motor_speeds[0], 760);
        assert_eq!(state.motor_speeds[1], -800);
        assert!((state.servo_position - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_sim_actuator_rejects_bad_channel() {
        let mut actuator = SimActuator::new();
        assert!(actuator.set_motor(8, 100).is_err());
    }

    #[test]
    fn test_sim_actuator_fault_injection() {
        let mut actuator = SimActuator::new();
        let handle = actuator.handle();

        handle.fail_device("motor 2");
        assert!(actuator.set_motor(2, 100).is_err());
        assert!(actuator.set_motor(3, 100).is_ok());

        handle.clear_faults();
        assert!(actuator.set_motor(2, 100).is_ok());
    }

    #[test]
    fn test_sim_currents_track_speed() {
        let mut actuator = SimActuator::new();
        actuator.set_motor(4, 800).unwrap();
        let currents = actuator.read_motor_currents();
        assert!((currents[4] - 0.5).abs() < 1e-6);
        assert_eq!(currents[5], 0.0);
    }

    #[test]
    fn test_sim_sensors_injection() {
        let sensors = SimSensors::new();
        sensors.inject_current("cs1", 7.5);
        let readings = sensors.read_currents();
        assert!((readings["cs1"].current - 7.5).abs() < 1e-9);
        // Untouched channels keep their synthetic values.
        assert!(readings["battery"].current > 0.0);
    }

    #[test]
    fn test_sim_video_frames_are_jpeg_delimited() {
        let video = SimVideoCapture::new();
        let frame = video.latest_frame().unwrap();
        assert_eq!(&frame[..2], &[0xff, 0xd8]);
        assert_eq!(&frame[frame.len() - 2..], &[0xff, 0xd9]);
        assert_eq!(video.stats().frames_captured, 1);
    }

    #[test]
    fn test_sim_video_camera_selection_is_bounded() {
        let video = SimVideoCapture::with_cameras(3);
        video.set_active_camera(2);
        assert_eq!(video.stats().active_camera, 2);

        // Out of range: selection is kept, not wrapped.
        video.set_active_camera(7);
        assert_eq!(video.stats().active_camera, 2);
    }
}
