//! Wire message types: operator commands and telemetry snapshots.
//!
//! Commands travel on the control channel as JSON objects of the form
//! `{"type": "...", "data": {...}, "timestamp": <unix seconds>}`. The
//! command set is a closed tagged enum; anything with an unrecognized
//! `type` decodes to [`Command::Unknown`], which the executor logs and
//! ignores - unknown commands never actuate.
//!
//! Telemetry travels on the telemetry channel as one JSON snapshot per
//! authenticated frame (see [`TelemetrySnapshot`]).

use serde::{Deserialize, Serialize};

/// Unix timestamp in fractional seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Commands
// ============================================================================

/// A decoded control message: the command plus the sender's timestamp.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    /// The decoded command.
    pub command: Command,
    /// Sender wall-clock timestamp (unix seconds).
    pub timestamp: f64,
}

/// Why a control payload failed to decode.
#[derive(Debug)]
pub enum CommandDecodeError {
    /// Payload is not valid UTF-8 JSON.
    Json(serde_json::Error),
    /// Payload decoded but a recognized command's data was malformed.
    Data {
        /// The command tag whose data failed to decode.
        kind: String,
        /// The underlying serde error.
        source: serde_json::Error,
    },
}

impl std::fmt::Display for CommandDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "Invalid command JSON: {e}"),
            Self::Data { kind, source } => {
                write!(f, "Invalid data for command '{kind}': {source}")
            }
        }
    }
}

impl std::error::Error for CommandDecodeError {}

/// The closed set of operator commands.
///
/// Serialized with `type`/`data` adjacent tagging so the wire form matches
/// the protocol exactly. Deserialization goes through
/// [`Command::parse_message`] so unknown types land in `Unknown` instead
/// of failing the frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Command {
    /// Engage (default) or clear the E-STOP.
    EmergencyStop {
        /// `true` = engage, `false` = attempt a validated clear.
        #[serde(default = "default_true")]
        engage: bool,
        /// Operator-provided reason, logged on engage.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Must be exactly `"CLEAR_ESTOP"` for a clear to be considered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confirm_clear: Option<String>,
    },
    /// RTT probe; echoed back in telemetry as a pong.
    Ping {
        /// Sender timestamp (unix seconds).
        #[serde(default)]
        ts: f64,
        /// Sender-side ping counter.
        #[serde(default)]
        seq: u64,
    },
    /// Close the clamp servo (position 0.0).
    ClampClose {},
    /// Open the clamp servo (position 1.0).
    ClampOpen {},
    /// Cache the externally measured height for the next telemetry tick.
    HeightUpdate {
        /// Height in meters.
        #[serde(default)]
        height: f32,
    },
    /// Cache the externally measured force for the next telemetry tick.
    ForceUpdate {
        /// Force in newtons.
        #[serde(default)]
        force: f32,
    },
    /// Switch the active camera feed.
    StartCamera {
        /// Camera index into the configured device list.
        #[serde(default)]
        camera_id: u32,
    },
    /// Gamepad axis/button event routed through the input mapping.
    InputEvent(InputEvent),
    /// Logged only; never actuates.
    RawButtonPress {},
    /// Chainsaw blade on/off.
    ChainsawCommand {
        /// Chainsaw 1 or 2.
        #[serde(default = "default_chainsaw_id")]
        chainsaw_id: u8,
        /// `on`/`press` or `off`/`release`.
        #[serde(default)]
        action: SwitchAction,
    },
    /// Chainsaw feed up/down with the 1.5s run-time limit.
    ChainsawMove {
        /// Chainsaw 1 or 2.
        #[serde(default = "default_chainsaw_id")]
        chainsaw_id: u8,
        /// Feed direction.
        #[serde(default)]
        direction: MoveDirection,
    },
    /// Hoist up via motor 7.
    ClimbCommand {
        /// `up` or `stop`.
        #[serde(default)]
        direction: MoveDirection,
    },
    /// Traverse left/right via motor 6.
    TraverseCommand {
        /// `left`, `right` or `stop`.
        #[serde(default)]
        direction: MoveDirection,
    },
    /// Brake engage/release (servo + descent motor).
    BrakeCommand {
        /// `engage` or `release`.
        #[serde(default)]
        action: BrakeAction,
    },
    /// Anything with an unrecognized `type` tag. Logged, never actuated.
    Unknown {
        /// The raw unrecognized type tag.
        raw: String,
    },
}

fn default_true() -> bool {
    true
}

fn default_chainsaw_id() -> u8 {
    1
}

/// Gamepad input event payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InputEvent {
    /// Event source: analog axis or button.
    #[serde(rename = "type")]
    pub kind: InputKind,
    /// Axis or button index.
    #[serde(default)]
    pub index: u32,
    /// Axis deflection (-1.0..=1.0) or button value (>0 = pressed).
    #[serde(default)]
    pub value: f64,
}

/// Input event source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Analog stick axis.
    Axis,
    /// Button press/release.
    Button,
}

/// On/off style action, accepting both `on`/`off` and `press`/`release`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SwitchAction {
    /// Turn on.
    On,
    /// Alias for on.
    Press,
    /// Turn off (default: fail safe).
    #[default]
    Off,
    /// Alias for off.
    Release,
}

impl SwitchAction {
    /// Collapse the aliases.
    pub fn is_on(self) -> bool {
        matches!(self, Self::On | Self::Press)
    }
}

/// Direction for feed/hoist/traverse commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    /// Feed up / hoist up.
    Up,
    /// Feed down.
    Down,
    /// Traverse left.
    Left,
    /// Traverse right.
    Right,
    /// Stop (default: fail safe).
    #[default]
    Stop,
}

/// Brake action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrakeAction {
    /// Clamp the brake servo and start the descent motor.
    Engage,
    /// Stop the descent motor and release the brake servo (default).
    #[default]
    Release,
}

/// Raw wire envelope used during decoding.
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: f64,
}

impl Command {
    /// Decode one control payload.
    ///
    /// Unknown `type` tags decode to [`Command::Unknown`]; malformed JSON
    /// or malformed data for a *recognized* type is an error (the caller
    /// treats it as a decode failure, which on the robot engages E-STOP).
    pub fn parse_message(payload: &[u8]) -> Result<CommandMessage, CommandDecodeError> {
        let raw: RawMessage =
            serde_json::from_slice(payload).map_err(CommandDecodeError::Json)?;

        let data = raw.data;
        let command = match raw.kind.as_str() {
            // A malformed engage/reason field must never turn an
            // emergency_stop into a decode failure.
            "emergency_stop" => Command::EmergencyStop {
                engage: data
                    .get("engage")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true),
                reason: data
                    .get("reason")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
                confirm_clear: data
                    .get("confirm_clear")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_owned),
            },
            "ping" => Command::Ping {
                ts: data.get("ts").and_then(serde_json::Value::as_f64).unwrap_or(0.0),
                seq: data.get("seq").and_then(serde_json::Value::as_u64).unwrap_or(0),
            },
            "clamp_close" => Command::ClampClose {},
            "clamp_open" => Command::ClampOpen {},
            "height_update" => Command::HeightUpdate {
                height: data
                    .get("height")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0) as f32,
            },
            "force_update" => Command::ForceUpdate {
                force: data
                    .get("force")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.0) as f32,
            },
            "start_camera" => Command::StartCamera {
                camera_id: data
                    .get("camera_id")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0) as u32,
            },
            "input_event" => typed_data(&raw.kind, data).map(Command::InputEvent)?,
            "raw_button_press" => Command::RawButtonPress {},
            "chainsaw_command" => typed_data::<ChainsawCommandData>(&raw.kind, data).map(|d| {
                Command::ChainsawCommand {
                    chainsaw_id: d.chainsaw_id,
                    action: d.action,
                }
            })?,
            "chainsaw_move" => typed_data::<ChainsawMoveData>(&raw.kind, data).map(|d| {
                Command::ChainsawMove {
                    chainsaw_id: d.chainsaw_id,
                    direction: d.direction,
                }
            })?,
            "climb_command" => typed_data::<DirectionData>(&raw.kind, data)
                .map(|d| Command::ClimbCommand { direction: d.direction })?,
            "traverse_command" => typed_data::<DirectionData>(&raw.kind, data)
                .map(|d| Command::TraverseCommand { direction: d.direction })?,
            "brake_command" => typed_data::<BrakeData>(&raw.kind, data)
                .map(|d| Command::BrakeCommand { action: d.action })?,
            other => Command::Unknown {
                raw: other.to_owned(),
            },
        };

        Ok(CommandMessage {
            command,
            timestamp: raw.timestamp,
        })
    }

    /// Encode as a wire payload, stamping the current time.
    pub fn to_wire(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Envelope<'a> {
            #[serde(flatten)]
            command: &'a Command,
            timestamp: f64,
        }
        // Command serialization cannot fail: all fields are plain data.
        #[allow(clippy::unwrap_used)]
        serde_json::to_vec(&Envelope {
            command: self,
            timestamp: unix_now(),
        })
        .unwrap()
    }

    /// Snake_case tag of this command, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmergencyStop { .. } => "emergency_stop",
            Self::Ping { .. } => "ping",
            Self::ClampClose {} => "clamp_close",
            Self::ClampOpen {} => "clamp_open",
            Self::HeightUpdate { .. } => "height_update",
            Self::ForceUpdate { .. } => "force_update",
            Self::StartCamera { .. } => "start_camera",
            Self::InputEvent(_) => "input_event",
            Self::RawButtonPress {} => "raw_button_press",
            Self::ChainsawCommand { .. } => "chainsaw_command",
            Self::ChainsawMove { .. } => "chainsaw_move",
            Self::ClimbCommand { .. } => "climb_command",
            Self::TraverseCommand { .. } => "traverse_command",
            Self::BrakeCommand { .. } => "brake_command",
            Self::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Deserialize)]
struct ChainsawCommandData {
    #[serde(default = "default_chainsaw_id")]
    chainsaw_id: u8,
    #[serde(default)]
    action: SwitchAction,
}

#[derive(Deserialize)]
struct ChainsawMoveData {
    #[serde(default = "default_chainsaw_id")]
    chainsaw_id: u8,
    #[serde(default)]
    direction: MoveDirection,
}

#[derive(Deserialize)]
struct DirectionData {
    #[serde(default)]
    direction: MoveDirection,
}

#[derive(Deserialize)]
struct BrakeData {
    #[serde(default)]
    action: BrakeAction,
}

fn typed_data<T: serde::de::DeserializeOwned>(
    kind: &str,
    data: serde_json::Value,
) -> Result<T, CommandDecodeError> {
    serde_json::from_value(data).map_err(|source| CommandDecodeError::Data {
        kind: kind.to_owned(),
        source,
    })
}

// ============================================================================
// E-STOP reasons
// ============================================================================

/// Closed set of E-STOP reasons, used in telemetry, logs, and the audit ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstopReason {
    /// Latched at boot before any actuation is possible.
    BootDefault,
    /// No valid control command within the watchdog window.
    WatchdogTimeout,
    /// Control connection lost.
    ControlDisconnect,
    /// Receive buffer exceeded its bound.
    BufferOverflow,
    /// Control payload failed to decode.
    DecodeError,
    /// HMAC or replay check failed.
    AuthFailure,
    /// Control never established within the startup grace period.
    StartupNoControl,
    /// Explicit operator command.
    OperatorCommand,
    /// Hardware write failure or internal fault.
    InternalError,
    /// Cleared/engaged from a dashboard on the same host.
    DashboardManual,
}

impl EstopReason {
    /// Snake_case tag, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootDefault => "boot_default",
            Self::WatchdogTimeout => "watchdog_timeout",
            Self::ControlDisconnect => "control_disconnect",
            Self::BufferOverflow => "buffer_overflow",
            Self::DecodeError => "decode_error",
            Self::AuthFailure => "auth_failure",
            Self::StartupNoControl => "startup_no_control",
            Self::OperatorCommand => "operator_command",
            Self::InternalError => "internal_error",
            Self::DashboardManual => "dashboard_manual",
        }
    }
}

impl std::fmt::Display for EstopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// IMU reading: orientation quaternion, acceleration, angular rate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ImuSnapshot {
    /// Quaternion scalar part.
    pub quat_w: f64,
    /// Quaternion x.
    pub quat_x: f64,
    /// Quaternion y.
    pub quat_y: f64,
    /// Quaternion z.
    pub quat_z: f64,
    /// Acceleration x (m/s^2).
    pub accel_x: f64,
    /// Acceleration y (m/s^2).
    pub accel_y: f64,
    /// Acceleration z (m/s^2).
    pub accel_z: f64,
    /// Angular rate x (rad/s).
    pub gyro_x: f64,
    /// Angular rate y (rad/s).
    pub gyro_y: f64,
    /// Angular rate z (rad/s).
    pub gyro_z: f64,
}

/// Barometer reading.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BaroSnapshot {
    /// Pressure in hPa.
    pub pressure: f64,
    /// Temperature in degrees C.
    pub temperature: f64,
    /// Derived altitude in meters.
    pub altitude: f64,
}

/// E-STOP status as carried in every telemetry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EstopStatus {
    /// Whether the E-STOP latch is engaged.
    pub engaged: bool,
    /// Reason tag for the current state.
    pub reason: EstopReason,
    /// Unix timestamp of the last transition.
    pub timestamp: f64,
    /// Seconds since the last transition.
    pub age_s: f64,
}

/// Pong echo included in telemetry when the robot received a recent ping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PongData {
    /// Timestamp from the original ping.
    pub ping_ts: f64,
    /// Sequence from the original ping.
    pub ping_seq: u64,
    /// Robot wall clock when the pong was emitted.
    pub robot_ts: f64,
}

/// One telemetry snapshot, assembled on the robot at 10 Hz.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    /// Robot wall clock at assembly time (unix seconds). Required.
    pub timestamp: f64,
    /// Battery voltage.
    #[serde(default)]
    pub voltage: f32,
    /// Operator-supplied height cache.
    #[serde(default)]
    pub height: f32,
    /// Operator-supplied force cache.
    #[serde(default)]
    pub force: f32,
    /// Chainsaw load cell placeholder.
    #[serde(default)]
    pub chainsaw_force: f32,
    /// Rope load cell placeholder.
    #[serde(default)]
    pub rope_force: f32,
    /// IMU reading, when the sensor is up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imu: Option<ImuSnapshot>,
    /// Barometer reading, when the sensor is up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barometer: Option<BaroSnapshot>,
    /// Per-motor current draw in amps.
    #[serde(default)]
    pub motor_currents: Vec<f32>,
    /// E-STOP status. Required.
    pub estop: EstopStatus,
    /// Milliseconds since the last valid control command.
    #[serde(default)]
    pub control_age_ms: i64,
    /// Whether control has ever been established this boot.
    #[serde(default)]
    pub control_established: bool,
    /// Sequence of the last accepted control frame.
    #[serde(default)]
    pub control_seq: u64,
    /// Round-trip time; filled in by the base after pong matching, 0 on
    /// the robot.
    #[serde(default)]
    pub rtt_ms: i64,
    /// Echo of the most recent ping, if fresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<PongData>,
    /// Base wall clock at receive time; stamped by the base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<f64>,
}

impl TelemetrySnapshot {
    /// Sum of all motor currents in amps.
    pub fn total_motor_current(&self) -> f32 {
        self.motor_currents.iter().sum()
    }
}
