//! Safety-critical constants for the Serpent bridge.
//!
//! This module centralizes the timing, sizing, and confirmation constants
//! that the rest of the system treats as immutable. Values are chosen for
//! fail-safe behavior and must not be overridden from the environment.
//!
//! # Categories
//!
//! - **Buffers**: hard limits that prevent OOM on hostile or broken input
//! - **Timing**: watchdog, grace, and dedup windows
//! - **Ports**: default TCP port assignments for the three channels

use std::time::Duration;

// ============================================================================
// Buffer limits
// ============================================================================

/// Maximum payload of an authenticated frame (16 KB).
///
/// Commands and telemetry snapshots are small JSON documents; anything
/// larger on the wire is a protocol violation, not a bigger message.
pub const MAX_FRAME_SIZE: usize = 16_384;

/// Maximum accumulation in the video re-framer before a forced resync (256 KB).
///
/// A single 640x480 JPEG at the configured quality is well under 64 KB, so a
/// buffer this size means we lost frame sync and should skip ahead rather
/// than grow without bound.
pub const MAX_VIDEO_BUFFER: usize = 262_144;

// ============================================================================
// Safety timing
// ============================================================================

/// E-STOP if no valid control command has arrived for this long.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period after boot before control must be established.
///
/// Long enough for the HaLow link and the base station stack to come up,
/// short enough that an unattended robot does not sit armed forever.
pub const STARTUP_GRACE: Duration = Duration::from_secs(30);

/// Control must be at least this fresh for an E-STOP clear to be accepted.
pub const ESTOP_CLEAR_MAX_AGE: Duration = Duration::from_millis(1500);

/// Confirmation string required to clear E-STOP. Exact byte compare.
pub const ESTOP_CLEAR_CONFIRM: &str = "CLEAR_ESTOP";

/// Window in which an identical emergency_stop command is treated as a
/// duplicate and dropped.
pub const ESTOP_DEDUP_WINDOW: Duration = Duration::from_millis(500);

/// Claw motors are stopped when no input event has arrived for this long.
pub const INPUT_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll cadence of the claw motor timeout monitor.
pub const MOTOR_TIMEOUT_POLL: Duration = Duration::from_millis(100);

/// Maximum continuous run time of a chainsaw feed motor. After the limit
/// the motor stops and the timer resets so the operator can immediately
/// re-engage in bursts.
pub const CHAINSAW_RUN_LIMIT: Duration = Duration::from_millis(1500);

/// Poll cadence of the chainsaw feed timeout monitor.
pub const CHAINSAW_TIMEOUT_POLL: Duration = Duration::from_millis(50);

/// Two presses of the same chainsaw trigger within this window start the
/// autonomous cutter.
pub const AUTOCUT_DOUBLE_PRESS_WINDOW: Duration = Duration::from_millis(400);

/// A received ping is echoed back in telemetry as a pong for at most this
/// long; older pings are considered stale and omitted.
pub const PONG_MAX_AGE: Duration = Duration::from_secs(5);

// ============================================================================
// Cadences
// ============================================================================

/// Ping frequency on the base station (RTT measurement).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Telemetry snapshot cadence (10 Hz).
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Delay between reconnect attempts outside exponential backoff paths.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Cadence of the structured JSON status event emitted by the watchdogs.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Rate limit of the condensed controller telemetry view (Hz).
pub const CONTROLLER_TELEMETRY_RATE_HZ: f64 = 1.0;

// ============================================================================
// Ports
// ============================================================================

/// Default control channel port (base -> robot, robot is server).
pub const DEFAULT_CONTROL_PORT: u16 = 5001;

/// Default video channel port (robot -> base, base is server).
pub const DEFAULT_VIDEO_PORT: u16 = 5002;

/// Default telemetry channel port (robot -> base, base is server).
pub const DEFAULT_TELEMETRY_PORT: u16 = 5003;

// ============================================================================
// Actuators
// ============================================================================

/// Number of motor channels (four dual-channel driver boards).
pub const MOTOR_COUNT: usize = 8;

/// Motor speed envelope; commands outside are clamped.
pub const MOTOR_SPEED_LIMIT: i16 = 800;

/// Servo neutral position on the 0.0..=1.0 scale.
pub const SERVO_NEUTRAL: f32 = 0.5;
