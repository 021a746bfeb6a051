//! Telemetry sender: robot -> base snapshot stream at 10 Hz.
//!
//! The sender thread connects to the base station's telemetry server,
//! assembles one [`TelemetrySnapshot`] per tick, serializes it once
//! (reusing the cached bytes when the snapshot content is unchanged),
//! and ships it in an authenticated frame. Send failures close the
//! socket and the next tick reconnects under exponential backoff and
//! the circuit breaker.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{configure_stream, CircuitBreaker, ExponentialBackoff};
use crate::framing::{PreSharedKey, SecureFramer};
use crate::hardware::SensorSource;
use crate::protocol::{unix_now, TelemetrySnapshot};
use crate::robot::executor::CommandExecutor;
use crate::robot::gate::ActuatorGate;
use crate::robot::ControlLink;

/// Connect timeout toward the base station.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-send write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Assembles snapshots from the robot's live components.
pub struct SnapshotSource {
    gate: Arc<ActuatorGate>,
    sensors: Arc<dyn SensorSource>,
    executor: Arc<CommandExecutor>,
    link: Arc<ControlLink>,
}

impl std::fmt::Debug for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotSource").finish_non_exhaustive()
    }
}

impl SnapshotSource {
    /// Wire the snapshot source to the robot's components.
    pub fn new(
        gate: Arc<ActuatorGate>,
        sensors: Arc<dyn SensorSource>,
        executor: Arc<CommandExecutor>,
        link: Arc<ControlLink>,
    ) -> Self {
        Self {
            gate,
            sensors,
            executor,
            link,
        }
    }

    /// Build one snapshot from current state.
    pub fn build(&self) -> TelemetrySnapshot {
        let cached = self.executor.cached_readings();
        let currents = self.sensors.read_currents();
        let voltage = currents
            .get("battery")
            .map_or(12.0, |reading| reading.voltage) as f32;

        TelemetrySnapshot {
            timestamp: unix_now(),
            voltage,
            height: cached.height,
            force: cached.force,
            chainsaw_force: 0.0,
            rope_force: 0.0,
            imu: self.sensors.read_imu(),
            barometer: self.sensors.read_barometer(),
            motor_currents: self.gate.motor_currents().to_vec(),
            estop: self.gate.info(),
            control_age_ms: self.link.control_age().as_millis() as i64,
            control_established: self.link.is_established(),
            control_seq: self.link.last_seq(),
            rtt_ms: 0,
            pong: self.executor.pong_data(),
            received_at: None,
        }
    }
}

/// Robot-side telemetry sender.
pub struct TelemetrySender {
    target: String,
    interval: Duration,
    psk: Option<PreSharedKey>,
    source: SnapshotSource,

    socket: Option<TcpStream>,
    framer: SecureFramer,
    connected: Arc<AtomicBool>,
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,

    // Serialize-once cache: re-encoding is skipped while consecutive
    // snapshots compare equal.
    cache: Option<(TelemetrySnapshot, Vec<u8>)>,
    sends_total: u64,
    cache_hits: u64,
}

impl std::fmt::Debug for TelemetrySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySender")
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl TelemetrySender {
    /// Sender targeting `host:port` on the base station.
    pub fn new(
        host: &str,
        port: u16,
        interval: Duration,
        psk: Option<PreSharedKey>,
        source: SnapshotSource,
    ) -> Self {
        let target = format!("{host}:{port}");
        log::info!(
            "Telemetry sender initialized (target {target} @ {:.0} Hz)",
            1.0 / interval.as_secs_f64()
        );
        Self {
            target,
            interval,
            framer: SecureFramer::new(psk.clone(), "robot_telemetry"),
            psk,
            source,
            socket: None,
            connected: Arc::new(AtomicBool::new(false)),
            backoff: ExponentialBackoff::new(),
            breaker: CircuitBreaker::new(),
            cache: None,
            sends_total: 0,
            cache_hits: 0,
        }
    }

    /// Shared flag observed by the watchdog's status event.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run until `running` clears. Owns its thread.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            if self.socket.is_none() {
                if !self.connect() {
                    let delay = self.backoff.next_delay();
                    sleep_observing(delay, running);
                    continue;
                }
            }

            let snapshot = self.source.build();
            if self.send(&snapshot) {
                std::thread::sleep(self.interval);
            }
            // On failure the socket is already closed; loop back into
            // the reconnect path without sleeping the full interval.
        }
        self.close();
        log::info!(
            "Telemetry sender stopped (sends={}, cache_hits={})",
            self.sends_total,
            self.cache_hits
        );
    }

    fn connect(&mut self) -> bool {
        if !self.breaker.allow_request() {
            return false;
        }

        log::info!("Connecting to base telemetry at {}", self.target);
        let addrs = match resolve(&self.target) {
            Some(addrs) => addrs,
            None => {
                self.breaker.record_failure();
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    if let Err(e) = configure_stream(&stream, WRITE_TIMEOUT) {
                        log::warn!("Failed to configure telemetry socket: {e}");
                    }
                    // Fresh framer per connection.
                    self.framer = SecureFramer::new(self.psk.clone(), "robot_telemetry");
                    self.socket = Some(stream);
                    self.connected.store(true, Ordering::SeqCst);
                    self.backoff.reset();
                    self.breaker.record_success();
                    log::info!("Connected to base telemetry");
                    return true;
                }
                Err(e) => {
                    log::debug!("Telemetry connect to {addr} failed: {e}");
                }
            }
        }

        log::error!("Failed to connect to base telemetry at {}", self.target);
        self.breaker.record_failure();
        false
    }

    /// Serialize (with caching) and send one snapshot.
    fn send(&mut self, snapshot: &TelemetrySnapshot) -> bool {
        let payload = match &self.cache {
            Some((cached, bytes)) if cached == snapshot => {
                self.cache_hits += 1;
                bytes.clone()
            }
            _ => match serde_json::to_vec(snapshot) {
                Ok(bytes) => {
                    self.cache = Some((snapshot.clone(), bytes.clone()));
                    bytes
                }
                Err(e) => {
                    log::error!("Telemetry serialization failed: {e}");
                    return true; // nothing sendable this tick; not a socket fault
                }
            },
        };

        let frame = match self.framer.create_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                // Unauthenticated node: stay quiet rather than hammer logs
                // at 10 Hz.
                log::debug!("Telemetry frame not created: {e}");
                return true;
            }
        };

        let Some(socket) = &mut self.socket else {
            return false;
        };
        match socket.write_all(&frame) {
            Ok(()) => {
                self.sends_total += 1;
                self.breaker.record_success();
                true
            }
            Err(e) => {
                log::error!("Failed to send telemetry: {e}");
                self.close();
                self.breaker.record_failure();
                false
            }
        }
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn resolve(target: &str) -> Option<Vec<std::net::SocketAddr>> {
    use std::net::ToSocketAddrs;
    match target.to_socket_addrs() {
        Ok(addrs) => Some(addrs.collect()),
        Err(e) => {
            log::error!("Cannot resolve {target}: {e}");
            None
        }
    }
}

/// Sleep in short slices so shutdown is observed promptly.
fn sleep_observing(total: Duration, running: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let mut slept = Duration::ZERO;
    while slept < total && running.load(Ordering::SeqCst) {
        std::thread::sleep(slice);
        slept += slice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutocutConfig;
    use crate::constants::MOTOR_COUNT;
    use crate::hardware::{SimActuator, SimSensors};

    fn source() -> SnapshotSource {
        let gate = Arc::new(ActuatorGate::new(Box::new(SimActuator::new()), true, false));
        let sensors: Arc<SimSensors> = Arc::new(SimSensors::new());
        let link = Arc::new(ControlLink::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&gate),
            Arc::clone(&sensors) as Arc<dyn SensorSource>,
            None,
            Arc::clone(&link),
            AutocutConfig::default(),
        ));
        SnapshotSource::new(gate, sensors, executor, link)
    }

    #[test]
    fn test_snapshot_has_required_fields() {
        let snapshot = source().build();

        assert!(snapshot.timestamp > 0.0);
        assert!(snapshot.estop.engaged); // boot latch
        assert_eq!(snapshot.motor_currents.len(), MOTOR_COUNT);
        assert!(snapshot.imu.is_some());
        assert!(snapshot.barometer.is_some());
        assert!(snapshot.voltage > 0.0);
        assert_eq!(snapshot.rtt_ms, 0);
        assert!(snapshot.pong.is_none());
        assert!(snapshot.received_at.is_none());
    }

    #[test]
    fn test_serialize_cache_hits_on_identical_snapshots() {
        let mut sender = TelemetrySender::new(
            "127.0.0.1",
            1,
            Duration::from_millis(100),
            None,
            source(),
        );

        let snapshot = sender.source.build();
        // No socket: send() short-circuits after serialization, which is
        // the part under test.
        sender.send(&snapshot);
        assert_eq!(sender.cache_hits, 0);
        sender.send(&snapshot);
        assert_eq!(sender.cache_hits, 1);

        let mut different = snapshot.clone();
        different.timestamp += 0.1;
        sender.send(&different);
        assert_eq!(sender.cache_hits, 1);
    }
}
