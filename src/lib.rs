//! Serpent bridge - authenticated teleoperation link between the base
//! station and the climbing robot.
//!
//! Two symmetric nodes connected by three TCP channels:
//!
//! | channel   | direction     | server | authenticated |
//! |-----------|---------------|--------|---------------|
//! | control   | base -> robot | robot  | yes           |
//! | telemetry | robot -> base | base   | yes           |
//! | video     | robot -> base | base   | no            |
//!
//! The robot executes actuation under E-STOP supervision (`robot`); the
//! base forwards operator commands and fans out telemetry (`base`);
//! `framing` carries the HMAC-SHA-256 wire protocol both share.

// Library modules
pub mod base;
pub mod config;
pub mod connection;
pub mod constants;
pub mod framing;
pub mod hardware;
pub mod protocol;
pub mod robot;

// Re-export commonly used types
pub use base::broadcast::BroadcastSink;
pub use base::buffer::TelemetryBuffer;
pub use base::control_client::ControlClient;
pub use base::frontend::{ChannelFrontEnd, FrontEndEvent, NullFrontEnd, OperatorFrontEnd};
pub use base::reframer::{JpegReframer, LatestFrame};
pub use base::video_recorder::VideoRecorder;
pub use base::BaseBridge;
pub use config::{AutocutConfig, BaseConfig, RobotConfig};
pub use connection::{CircuitBreaker, CircuitState, ConnectionState, ExponentialBackoff};
pub use framing::{FramingError, PreSharedKey, SecureFramer};
pub use hardware::{
    Actuator, HardwareError, SensorSource, SimActuator, SimSensors, SimVideoCapture,
    TelemetrySink, VideoCapture,
};
pub use protocol::{Command, EstopReason, TelemetrySnapshot};
pub use robot::gate::ActuatorGate;
pub use robot::RobotBridge;
