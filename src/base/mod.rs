//! Base station node: operator command forwarding, telemetry fan-out,
//! and video re-framing.
//!
//! # Threads (steady state)
//!
//! ```text
//! main ───────────── run(): watchdog tick + status, 1 Hz
//!  ├─ control-reconnect  ControlClient      dial + redial the robot
//!  ├─ heartbeat ───── 1 Hz pings for RTT measurement
//!  ├─ telemetry-receiver  accept + authenticated receive + fan-out
//!  ├─ video-receiver  accept + JPEG re-framing
//!  ├─ video-recorder  MJPEG-to-disk with rotation + retention
//!  ├─ telemetry-storage   JSONL writer draining the bounded queue
//!  └─ frontend ────── operator event pump
//! ```
//!
//! Telemetry fan-out order per snapshot: state mirror (E-STOP, RTT),
//! ring buffer, then every [`TelemetrySink`] and the front-end pushes.
//! Sink failures are isolated; in-memory freshness always wins over
//! persistence.

pub mod broadcast;
pub mod buffer;
pub mod control_client;
pub mod frontend;
pub mod metrics;
pub mod reframer;
pub mod state;
pub mod storage;
pub mod telemetry_receiver;
pub mod video_receiver;
pub mod video_recorder;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::config::BaseConfig;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::framing::PreSharedKey;
use crate::hardware::TelemetrySink;
use crate::protocol::Command;

use broadcast::BroadcastSink;
use buffer::TelemetryBuffer;
use control_client::ControlClient;
use frontend::{translate_event, OperatorFrontEnd};
use metrics::format_for_controller;
use state::StateManager;
use storage::TelemetryStorage;
use telemetry_receiver::{SnapshotHandler, TelemetryReceiver};
use video_receiver::VideoReceiver;
use video_recorder::VideoRecorder;
use watchdog::{BaseStatus, BaseWatchdog};

/// The composed base station node.
pub struct BaseBridge {
    config: BaseConfig,
    psk: Option<PreSharedKey>,
    state: Arc<StateManager>,
    buffer: Arc<TelemetryBuffer>,
    client: Arc<ControlClient>,
    broadcast: Arc<BroadcastSink>,
    frontend: Arc<dyn OperatorFrontEnd>,
}

impl std::fmt::Debug for BaseBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseBridge").finish_non_exhaustive()
    }
}

impl BaseBridge {
    /// Build the base station. `frontend` is the operator boundary; use
    /// [`frontend::NullFrontEnd`] when no backend is attached.
    pub fn new(config: BaseConfig, frontend: Arc<dyn OperatorFrontEnd>) -> Self {
        let psk = PreSharedKey::from_env();
        let state = Arc::new(StateManager::new());
        let buffer = Arc::new(TelemetryBuffer::new(config.telemetry_buffer_samples));
        let client = ControlClient::new(&config.robot_ip, config.control_port, psk.clone());

        log::info!(
            "Base bridge initialized (robot {}, telemetry port {}, video port {})",
            config.robot_ip,
            config.telemetry_port,
            config.video_port
        );

        Self {
            config,
            psk,
            state,
            buffer,
            client,
            broadcast: Arc::new(BroadcastSink::new()),
            frontend,
        }
    }

    /// Subscribe to the dashboard broadcast stream.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<crate::protocol::TelemetrySnapshot> {
        self.broadcast.subscribe()
    }

    /// Telemetry ring buffer (dashboard surfaces, tests).
    pub fn buffer(&self) -> Arc<TelemetryBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Shared state (tests).
    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Build the fan-out handler installed on the telemetry receiver.
    fn snapshot_handler(&self, sinks: Vec<Arc<dyn TelemetrySink>>) -> SnapshotHandler {
        let state = Arc::clone(&self.state);
        let buffer = Arc::clone(&self.buffer);
        let frontend = Arc::clone(&self.frontend);
        let controller_rate = self.config.controller_rate_hz;

        Arc::new(move |mut snapshot| {
            // Mirror the robot's E-STOP state and fold in the RTT.
            state.update_robot_estop(snapshot.estop.engaged, snapshot.estop.reason);
            if let Some(pong) = &snapshot.pong {
                state.update_rtt(pong);
            }
            snapshot.rtt_ms = state.rtt_ms();

            // Ring buffer first: freshness beats persistence.
            buffer.push(snapshot.clone());

            for sink in &sinks {
                sink.push(&snapshot);
            }

            if frontend.is_connected() {
                frontend.push_telemetry(&snapshot);
                if state.should_send_controller_update(controller_rate) {
                    frontend.push_controller_telemetry(&format_for_controller(&snapshot));
                }
            }
        })
    }

    /// Run all base threads until `running` clears, then shut down.
    pub fn run(&self, running: &Arc<AtomicBool>) -> Result<()> {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Storage sink (optional).
        let storage = if self.config.storage_enabled {
            let (storage, handle) = TelemetryStorage::spawn(
                &self.config.storage_base,
                self.config.telemetry_retention_days,
                running,
            )?;
            handles.push(("storage", handle));
            Some(storage)
        } else {
            log::warn!("Telemetry storage disabled");
            None
        };

        let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::new();
        if let Some(storage) = &storage {
            sinks.push(Arc::new(storage.clone()));
        }
        sinks.push(Arc::clone(&self.broadcast) as Arc<dyn TelemetrySink>);

        // Telemetry receiver with the fan-out handler.
        let receiver = TelemetryReceiver::new(
            self.config.telemetry_port,
            self.psk.clone(),
            self.snapshot_handler(sinks),
        );
        handles.push(("telemetry", receiver.spawn(running)?));

        // Video receiver, with optional recording to disk.
        let video = VideoReceiver::new(self.config.video_port);
        handles.push(("video", video.spawn(running)?));
        if self.config.video_recording_enabled {
            handles.push((
                "video-recorder",
                VideoRecorder::spawn(
                    &self.config.storage_base,
                    self.config.video_retention_days,
                    video.latest_frame(),
                    running,
                )?,
            ));
        } else {
            log::warn!("Video recording disabled");
        }

        // Control client + reconnect.
        handles.push(("control", self.client.spawn_reconnect(running)));

        // Heartbeat pings.
        {
            let client = Arc::clone(&self.client);
            let state = Arc::clone(&self.state);
            let running_flag = Arc::clone(running);
            handles.push((
                "heartbeat",
                std::thread::Builder::new()
                    .name("heartbeat".into())
                    .spawn(move || {
                        while running_flag.load(Ordering::SeqCst) {
                            if client.is_connected() {
                                let (seq, ts) = state.next_ping();
                                client.send_command(&Command::Ping { ts, seq });
                            }
                            std::thread::sleep(HEARTBEAT_INTERVAL);
                        }
                    })?,
            ));
        }

        // Operator event pump.
        {
            let client = Arc::clone(&self.client);
            let state = Arc::clone(&self.state);
            let frontend = Arc::clone(&self.frontend);
            let running_flag = Arc::clone(running);
            handles.push((
                "frontend",
                std::thread::Builder::new()
                    .name("frontend".into())
                    .spawn(move || {
                        while running_flag.load(Ordering::SeqCst) {
                            state.set_frontend_connected(frontend.is_connected());
                            let mut worked = false;
                            while let Some(event) = frontend.poll_event() {
                                worked = true;
                                if let Some(command) = translate_event(event, &state) {
                                    client.send_command(&command);
                                }
                            }
                            if !worked {
                                std::thread::sleep(Duration::from_millis(20));
                            }
                        }
                    })?,
            ));
        }

        // Main loop: base watchdog + status events.
        log::info!("Base bridge running");
        let mut dog = BaseWatchdog::new();
        let mut control_was_connected = false;
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));

            if let Some(command) = dog.check_telemetry(receiver.telemetry_age()) {
                self.client.send_command(&command);
            }

            // Reset emergency dedup when the control link drops, so the
            // next session can re-send the current state.
            let connected = self.client.is_connected();
            if control_was_connected && !connected {
                self.state.reset_emergency();
            }
            control_was_connected = connected;

            dog.log_status(&BaseStatus {
                frontend_connected: self.frontend.is_connected(),
                control_connected: connected,
                telemetry_connected: receiver.is_connected(),
                video_connected: video.is_connected(),
                robot_estop: self.state.robot_estop(),
                robot_estop_reason: self.state.robot_estop_reason().map(|r| r.as_str()),
                psk_valid: self.psk.is_some(),
            });
        }

        log::info!("Base bridge shutting down...");
        self.client.disconnect();
        for (name, handle) in handles {
            if handle.join().is_err() {
                log::error!("{name} thread panicked during shutdown");
            }
        }
        log::info!("Base bridge stopped");
        Ok(())
    }
}
