//! Robot node: control server, command executor, E-STOP supervision,
//! telemetry and video senders.
//!
//! SAFETY: the robot boots with E-STOP engaged and will not clear it
//! until control is established, an authenticated `emergency_stop
//! {engage: false}` with the exact confirmation string arrives, and all
//! validation checks pass.
//!
//! # Threads (steady state)
//!
//! ```text
//! main ──────────── run(): park until the shutdown flag flips
//!  ├─ control ───── ControlServer::run     accept + authenticated receive
//!  ├─ telemetry ─── TelemetrySender::run   10 Hz snapshots
//!  ├─ video ─────── VideoStreamer::run     raw MJPEG frames
//!  ├─ watchdog ──── Watchdog::run          1 Hz safety + 10s status
//!  ├─ motor-timeout                        claw stop on stale input
//!  ├─ chainsaw-timeout                     feed run-limit
//!  └─ autocut-cs* ─ (transient)            one per active cut
//! ```
//!
//! Every thread observes the shared `running` flag at least once per
//! second; graceful shutdown engages E-STOP as its final step.

pub mod autocut;
pub mod control_server;
pub mod executor;
pub mod gate;
pub mod telemetry;
pub mod video;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::RobotConfig;
use crate::framing::PreSharedKey;
use crate::hardware::{Actuator, SensorSource, SimActuator, SimSensors, SimVideoCapture, VideoCapture};
use crate::protocol::EstopReason;

use control_server::ControlServer;
use executor::CommandExecutor;
use gate::ActuatorGate;
use telemetry::{SnapshotSource, TelemetrySender};
use video::VideoStreamer;
use watchdog::Watchdog;

/// Shared view of the control channel's health, written by the control
/// server and read by the executor, watchdog, and telemetry sender.
pub struct ControlLink {
    boot: Mutex<Instant>,
    connected: AtomicBool,
    established: AtomicBool,
    last_seq: AtomicU64,
    last_control: Mutex<Instant>,
}

impl std::fmt::Debug for ControlLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLink")
            .field("connected", &self.is_connected())
            .field("established", &self.is_established())
            .field("last_seq", &self.last_seq())
            .finish_non_exhaustive()
    }
}

impl Default for ControlLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlLink {
    /// New link; the age clock starts at boot.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            boot: Mutex::new(now),
            connected: AtomicBool::new(false),
            established: AtomicBool::new(false),
            last_seq: AtomicU64::new(0),
            last_control: Mutex::new(now),
        }
    }

    /// Record one accepted control frame.
    pub fn touch(&self, seq: u64) {
        *lock(&self.last_control) = Instant::now();
        self.last_seq.store(seq, Ordering::SeqCst);
        if !self.established.swap(true, Ordering::SeqCst) {
            log::info!("Control ESTABLISHED (seq={seq})");
        }
    }

    /// Mark the control socket connected/disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Whether a control client is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether any valid command has ever been accepted this boot.
    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Sequence number of the last accepted control frame.
    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    /// Time since the last accepted control frame (since boot if none).
    pub fn control_age(&self) -> Duration {
        lock(&self.last_control).elapsed()
    }

    /// Time since boot.
    pub fn uptime(&self) -> Duration {
        lock(&self.boot).elapsed()
    }

    /// Test support: age the control clock by `delta`.
    pub fn rewind_control_clock(&self, delta: Duration) {
        let mut last = lock(&self.last_control);
        if let Some(rewound) = last.checked_sub(delta) {
            *last = rewound;
        }
    }

    /// Test support: age the boot clock by `delta`.
    pub fn rewind_boot_clock(&self, delta: Duration) {
        let mut boot = lock(&self.boot);
        if let Some(rewound) = boot.checked_sub(delta) {
            *boot = rewound;
        }
    }
}

/// The composed robot node.
pub struct RobotBridge {
    config: RobotConfig,
    gate: Arc<ActuatorGate>,
    executor: Arc<CommandExecutor>,
    link: Arc<ControlLink>,
    sensors: Arc<dyn SensorSource>,
    video: Option<Arc<dyn VideoCapture>>,
    psk: Option<PreSharedKey>,
}

impl std::fmt::Debug for RobotBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotBridge").finish_non_exhaustive()
    }
}

impl RobotBridge {
    /// Build the robot with simulated hardware.
    ///
    /// This is the `SIM_MODE=true` path, and also the fallback when no
    /// real drivers are linked in: hardware bindings are out-of-tree and
    /// injected through [`RobotBridge::with_hardware`].
    pub fn new(config: RobotConfig) -> Result<Self> {
        if config.sim_mode {
            log::info!("SIM_MODE enabled: using simulated actuators and sensors");
        } else {
            log::warn!("No hardware drivers linked; using simulated actuators and sensors");
        }
        let video: Option<Arc<dyn VideoCapture>> = config.video_enabled.then(|| {
            Arc::new(SimVideoCapture::with_cameras(config.camera_devices.len() as u32))
                as Arc<dyn VideoCapture>
        });
        Self::with_hardware(
            config,
            Box::new(SimActuator::new()),
            Arc::new(SimSensors::new()),
            video,
        )
    }

    /// Build the robot around injected hardware implementations.
    pub fn with_hardware(
        config: RobotConfig,
        actuator: Box<dyn Actuator>,
        sensors: Arc<dyn SensorSource>,
        video: Option<Arc<dyn VideoCapture>>,
    ) -> Result<Self> {
        let psk = PreSharedKey::from_env();
        if psk.is_none() {
            log::error!("NO VALID PSK - robot will refuse to clear E-STOP");
        }

        // E-STOP latches here, before any channel is up (fail-safe boot).
        let gate = Arc::new(ActuatorGate::new(
            actuator,
            psk.is_some(),
            config.allow_local_estop_clear,
        ));
        let link = Arc::new(ControlLink::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&gate),
            Arc::clone(&sensors),
            video.clone(),
            Arc::clone(&link),
            config.autocut,
        ));

        log::info!(
            "Robot bridge initialized ({} motor boards, control port {}, E-STOP ENGAGED)",
            config.motoron_addresses.len(),
            config.control_port
        );

        Ok(Self {
            config,
            gate,
            executor,
            link,
            sensors,
            video,
            psk,
        })
    }

    /// Actuator gate handle (status surfaces, tests).
    pub fn gate(&self) -> Arc<ActuatorGate> {
        Arc::clone(&self.gate)
    }

    /// Run all robot threads until `running` clears, then shut down.
    pub fn run(&self, running: &Arc<AtomicBool>) -> Result<()> {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        // Control server.
        {
            let mut server = ControlServer::new(
                self.config.control_port,
                self.psk.clone(),
                Arc::clone(&self.gate),
                Arc::clone(&self.executor),
                Arc::clone(&self.link),
            );
            let running = Arc::clone(running);
            handles.push((
                "control",
                std::thread::Builder::new()
                    .name("control-server".into())
                    .spawn(move || server.run(&running))?,
            ));
        }

        // Telemetry sender.
        let telemetry_connected = {
            let source = SnapshotSource::new(
                Arc::clone(&self.gate),
                Arc::clone(&self.sensors),
                Arc::clone(&self.executor),
                Arc::clone(&self.link),
            );
            let mut sender = TelemetrySender::new(
                &self.config.base_ip,
                self.config.telemetry_port,
                self.config.telemetry_interval,
                self.psk.clone(),
                source,
            );
            let flag = sender.connected_flag();
            let running = Arc::clone(running);
            handles.push((
                "telemetry",
                std::thread::Builder::new()
                    .name("telemetry-sender".into())
                    .spawn(move || sender.run(&running))?,
            ));
            flag
        };

        // Video streamer.
        if let Some(capture) = &self.video {
            let mut streamer = VideoStreamer::new(
                &self.config.base_ip,
                self.config.video_port,
                Arc::clone(capture),
            );
            let running = Arc::clone(running);
            handles.push((
                "video",
                std::thread::Builder::new()
                    .name("video-streamer".into())
                    .spawn(move || streamer.run(&running))?,
            ));
        }

        // Watchdog.
        {
            let mut dog = Watchdog::new(
                Arc::clone(&self.gate),
                Arc::clone(&self.link),
                telemetry_connected,
                self.psk.is_some(),
                self.config.disable_watchdog,
            );
            let running = Arc::clone(running);
            handles.push((
                "watchdog",
                std::thread::Builder::new()
                    .name("watchdog".into())
                    .spawn(move || dog.run(&running))?,
            ));
        }

        // Input timeout monitors.
        for handle in self.executor.start_monitors(running) {
            handles.push(("monitor", handle));
        }

        log::info!("Robot bridge running");
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }

        log::info!("Robot bridge shutting down...");
        self.executor.stop_all_autocut();
        for (name, handle) in handles {
            if handle.join().is_err() {
                log::error!("{name} thread panicked during shutdown");
            }
        }

        // Final step of a graceful shutdown: leave the hardware latched.
        self.gate
            .engage(EstopReason::InternalError, "bridge shutdown");
        log::info!("Robot bridge stopped");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_link_lifecycle() {
        let link = ControlLink::new();
        assert!(!link.is_connected());
        assert!(!link.is_established());
        assert_eq!(link.last_seq(), 0);

        link.set_connected(true);
        link.touch(7);
        assert!(link.is_connected());
        assert!(link.is_established());
        assert_eq!(link.last_seq(), 7);
        assert!(link.control_age() < Duration::from_secs(1));

        link.set_connected(false);
        // Establishment is sticky for the life of the process.
        assert!(link.is_established());
    }

    #[test]
    fn test_control_link_clock_rewind() {
        let link = ControlLink::new();
        link.touch(1);
        link.rewind_control_clock(Duration::from_secs(10));
        assert!(link.control_age() >= Duration::from_secs(10));

        link.rewind_boot_clock(Duration::from_secs(100));
        assert!(link.uptime() >= Duration::from_secs(100));
    }
}
