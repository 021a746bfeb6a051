//! Operator front-end boundary: legacy event translation and telemetry
//! push.
//!
//! The external operator backend (dashboard, controller app) speaks a
//! legacy event vocabulary over its own transport, which stays out of
//! tree behind the [`OperatorFrontEnd`] trait. This module translates
//! those events into the authenticated wire commands of the control
//! channel. Two rules are absolute:
//!
//! - `emergency_toggle` ALWAYS translates to an E-STOP engage. A toggle
//!   that "turns the emergency off" does not exist on the wire; clears
//!   require the explicit `emergency_status {active: false}` path with
//!   the full confirmation string.
//! - Clears always carry `confirm_clear = "CLEAR_ESTOP"`; the robot
//!   validates the rest.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use crate::base::metrics::ControllerTelemetry;
use crate::base::state::StateManager;
use crate::constants::ESTOP_CLEAR_CONFIRM;
use crate::protocol::{Command, InputEvent, MoveDirection, SwitchAction, TelemetrySnapshot};

/// Events delivered by the operator front-end (legacy vocabulary).
#[derive(Debug, Clone, PartialEq)]
pub enum FrontEndEvent {
    /// Panic button: always an engage.
    EmergencyToggle,
    /// Explicit E-STOP state: `true` = engage, `false` = validated clear.
    EmergencyStatus {
        /// Desired E-STOP state.
        active: bool,
    },
    /// Close the clamp.
    ClampClose,
    /// Open the clamp.
    ClampOpen,
    /// Externally measured height.
    HeightUpdate {
        /// Height in meters.
        height: f32,
    },
    /// Externally measured force.
    ForceUpdate {
        /// Force in newtons.
        force: f32,
    },
    /// Camera selection.
    StartCamera {
        /// Camera index.
        camera_id: u32,
    },
    /// Gamepad event.
    InputEvent(InputEvent),
    /// Raw button press (log only downstream).
    RawButtonPress,
    /// Chainsaw blade on/off.
    ChainsawCommand {
        /// Chainsaw 1 or 2.
        chainsaw_id: u8,
        /// Requested blade state.
        action: SwitchAction,
    },
    /// Chainsaw feed movement.
    ChainsawMove {
        /// Chainsaw 1 or 2.
        chainsaw_id: u8,
        /// Feed direction.
        direction: MoveDirection,
    },
    /// Hoist movement.
    ClimbCommand {
        /// `up` or `stop`.
        direction: MoveDirection,
    },
    /// Traverse movement.
    TraverseCommand {
        /// `left`, `right` or `stop`.
        direction: MoveDirection,
    },
    /// Brake engage/release.
    BrakeCommand {
        /// Requested brake state.
        action: crate::protocol::BrakeAction,
    },
}

/// The operator front-end boundary.
///
/// Implementations own their transport (Socket.IO, WebSocket, in-process
/// channels); the bridge polls for events and pushes telemetry through.
pub trait OperatorFrontEnd: Send + Sync {
    /// Next pending event, non-blocking.
    fn poll_event(&self) -> Option<FrontEndEvent>;

    /// Forward one full telemetry snapshot.
    fn push_telemetry(&self, snapshot: &TelemetrySnapshot);

    /// Forward one condensed controller view (already rate-limited).
    fn push_controller_telemetry(&self, view: &ControllerTelemetry);

    /// Whether the front-end currently has a live connection.
    fn is_connected(&self) -> bool;
}

/// Translate one front-end event into the wire command to send, if any.
///
/// Emergency events go through the [`StateManager`] dedup so a chatty
/// front-end cannot spam the robot with identical engage/clear commands;
/// `start_camera` additionally updates the camera mirror.
pub fn translate_event(event: FrontEndEvent, state: &StateManager) -> Option<Command> {
    match event {
        FrontEndEvent::EmergencyToggle => {
            // Legacy toggles are engage-only, no matter what the operator
            // UI thought the current state was.
            if !state.should_send_emergency(true, "emergency_toggle") {
                return None;
            }
            Some(Command::EmergencyStop {
                engage: true,
                reason: Some("operator_toggle".into()),
                confirm_clear: None,
            })
        }
        FrontEndEvent::EmergencyStatus { active } => {
            if !state.should_send_emergency(active, "emergency_status") {
                return None;
            }
            if active {
                Some(Command::EmergencyStop {
                    engage: true,
                    reason: Some("operator_toggle".into()),
                    confirm_clear: None,
                })
            } else {
                Some(Command::EmergencyStop {
                    engage: false,
                    reason: Some("operator_toggle".into()),
                    confirm_clear: Some(ESTOP_CLEAR_CONFIRM.into()),
                })
            }
        }
        FrontEndEvent::ClampClose => Some(Command::ClampClose {}),
        FrontEndEvent::ClampOpen => Some(Command::ClampOpen {}),
        FrontEndEvent::HeightUpdate { height } => Some(Command::HeightUpdate { height }),
        FrontEndEvent::ForceUpdate { force } => Some(Command::ForceUpdate { force }),
        FrontEndEvent::StartCamera { camera_id } => {
            state.set_active_camera(camera_id);
            Some(Command::StartCamera { camera_id })
        }
        FrontEndEvent::InputEvent(event) => Some(Command::InputEvent(event)),
        FrontEndEvent::RawButtonPress => Some(Command::RawButtonPress {}),
        FrontEndEvent::ChainsawCommand {
            chainsaw_id,
            action,
        } => Some(Command::ChainsawCommand {
            chainsaw_id,
            action,
        }),
        FrontEndEvent::ChainsawMove {
            chainsaw_id,
            direction,
        } => Some(Command::ChainsawMove {
            chainsaw_id,
            direction,
        }),
        FrontEndEvent::ClimbCommand { direction } => Some(Command::ClimbCommand { direction }),
        FrontEndEvent::TraverseCommand { direction } => {
            Some(Command::TraverseCommand { direction })
        }
        FrontEndEvent::BrakeCommand { action } => Some(Command::BrakeCommand { action }),
    }
}

/// In-process front-end backed by channels.
///
/// The embedding process (or a test) injects events through the sender
/// half and drains pushed telemetry from bounded queues. Queue overflow
/// drops the oldest-style: the push is discarded, matching the
/// best-effort contract of telemetry fan-out.
pub struct ChannelFrontEnd {
    events: Mutex<Receiver<FrontEndEvent>>,
    telemetry_tx: SyncSender<TelemetrySnapshot>,
    controller_tx: SyncSender<ControllerTelemetry>,
}

impl std::fmt::Debug for ChannelFrontEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFrontEnd").finish_non_exhaustive()
    }
}

/// The embedding side of a [`ChannelFrontEnd`].
#[derive(Debug)]
pub struct ChannelFrontEndHandle {
    /// Inject operator events here.
    pub events: SyncSender<FrontEndEvent>,
    /// Full snapshots pushed by the bridge.
    pub telemetry: Receiver<TelemetrySnapshot>,
    /// Condensed views pushed by the bridge.
    pub controller: Receiver<ControllerTelemetry>,
}

impl ChannelFrontEnd {
    /// Build the front-end and its embedding handle.
    pub fn pair() -> (Self, ChannelFrontEndHandle) {
        let (event_tx, event_rx) = std::sync::mpsc::sync_channel(256);
        let (telemetry_tx, telemetry_rx) = std::sync::mpsc::sync_channel(256);
        let (controller_tx, controller_rx) = std::sync::mpsc::sync_channel(64);
        (
            Self {
                events: Mutex::new(event_rx),
                telemetry_tx,
                controller_tx,
            },
            ChannelFrontEndHandle {
                events: event_tx,
                telemetry: telemetry_rx,
                controller: controller_rx,
            },
        )
    }
}

impl OperatorFrontEnd for ChannelFrontEnd {
    fn poll_event(&self) -> Option<FrontEndEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    fn push_telemetry(&self, snapshot: &TelemetrySnapshot) {
        if let Err(TrySendError::Full(_)) = self.telemetry_tx.try_send(snapshot.clone()) {
            log::debug!("Front-end telemetry queue full; snapshot dropped");
        }
    }

    fn push_controller_telemetry(&self, view: &ControllerTelemetry) {
        if let Err(TrySendError::Full(_)) = self.controller_tx.try_send(view.clone()) {
            log::debug!("Front-end controller queue full; view dropped");
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Front-end used when no operator backend is attached: no events, all
/// pushes discarded.
#[derive(Debug, Default)]
pub struct NullFrontEnd;

impl OperatorFrontEnd for NullFrontEnd {
    fn poll_event(&self) -> Option<FrontEndEvent> {
        None
    }

    fn push_telemetry(&self, _snapshot: &TelemetrySnapshot) {}

    fn push_controller_telemetry(&self, _view: &ControllerTelemetry) {}

    fn is_connected(&self) -> bool {
        false
    }
}
