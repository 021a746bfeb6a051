//! Telemetry receiver: the base side of the robot -> base snapshot stream.
//!
//! The base listens; the robot connects. Exactly one telemetry
//! connection is served at a time - while one is live, no further accept
//! is attempted, so a second robot (or a stale socket) queues in the
//! backlog until the current connection breaks. Each authenticated frame
//! decodes to a [`TelemetrySnapshot`], is stamped with the receive time,
//! and is handed to the fan-out callback. All failures drop the client
//! and keep the listener; the base never E-STOPs itself over telemetry
//! (the base watchdog handles staleness).

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::connection::{configure_stream, create_server_socket};
use crate::framing::{FramingError, PreSharedKey, SecureFramer};
use crate::protocol::{unix_now, TelemetrySnapshot};

/// Accept timeout (shutdown responsiveness).
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-frame read timeout; telemetry should tick at 10 Hz, so 5s of
/// silence means the stream is dead.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Fan-out callback invoked for every received snapshot.
pub type SnapshotHandler = Arc<dyn Fn(TelemetrySnapshot) + Send + Sync>;

/// Base-side telemetry receiver.
pub struct TelemetryReceiver {
    port: u16,
    psk: Option<PreSharedKey>,
    handler: SnapshotHandler,
    connected: Arc<AtomicBool>,
    /// Unix millis of the last received snapshot (0 = never).
    last_telemetry_ms: Arc<AtomicU64>,
    messages_received: Arc<AtomicU64>,
    auth_failures: Arc<AtomicU64>,
    decode_errors: Arc<AtomicU64>,
    bound: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for TelemetryReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryReceiver")
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl TelemetryReceiver {
    /// Receiver listening on `port`, delivering snapshots to `handler`.
    pub fn new(port: u16, psk: Option<PreSharedKey>, handler: SnapshotHandler) -> Arc<Self> {
        Arc::new(Self {
            port,
            psk,
            handler,
            connected: Arc::new(AtomicBool::new(false)),
            last_telemetry_ms: Arc::new(AtomicU64::new(0)),
            messages_received: Arc::new(AtomicU64::new(0)),
            auth_failures: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
            bound: Mutex::new(None),
        })
    }

    /// Whether a robot telemetry connection is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Seconds since the last snapshot, or `None` if never received.
    pub fn telemetry_age(&self) -> Option<Duration> {
        let ms = self.last_telemetry_ms.load(Ordering::SeqCst);
        if ms == 0 {
            return None;
        }
        let now_ms = (unix_now() * 1000.0) as u64;
        Some(Duration::from_millis(now_ms.saturating_sub(ms)))
    }

    /// Snapshots received since start.
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Authentication / replay failures observed.
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// JSON decode failures observed.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// The bound listener address once the thread is up (tests use port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound)
    }

    /// Spawn the receive thread.
    pub fn spawn(self: &Arc<Self>, running: &Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = create_server_socket(addr, 1, ACCEPT_TIMEOUT)
            .with_context(|| format!("bind telemetry server on port {}", self.port))?;
        let bound = listener.local_addr().context("listener local_addr")?;
        *lock(&self.bound) = Some(bound);
        log::info!("Listening for telemetry on {bound}");

        let receiver = Arc::clone(self);
        let running = Arc::clone(running);
        std::thread::Builder::new()
            .name("telemetry-receiver".into())
            .spawn(move || receiver.run(&listener, &running))
            .context("spawn telemetry receiver")
    }

    fn run(&self, listener: &TcpListener, running: &AtomicBool) {
        let mut client: Option<(TcpStream, SecureFramer)> = None;

        while running.load(Ordering::SeqCst) {
            let Some((stream, framer)) = &mut client else {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if let Err(e) = configure_stream(&stream, READ_TIMEOUT) {
                            log::warn!("Failed to configure telemetry socket: {e}");
                        }
                        // Fresh framer per connection resets the replay
                        // window.
                        let framer =
                            SecureFramer::new(self.psk.clone(), "base_telemetry");
                        client = Some((stream, framer));
                        self.connected.store(true, Ordering::SeqCst);
                        log::info!("Robot telemetry connected from {peer}");
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) => {}
                    Err(e) => {
                        log::error!("Error accepting telemetry connection: {e}");
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
                continue;
            };

            let drop_client = match framer.read_frame_from_stream(stream, READ_TIMEOUT) {
                Ok((payload, seq)) => {
                    self.process(&payload, seq);
                    false
                }
                Err(e) if e.is_timeout() => {
                    log::warn!("Telemetry read timeout; dropping connection");
                    true
                }
                Err(e @ (FramingError::AuthFail | FramingError::Replay { .. })) => {
                    log::error!("Telemetry auth failure: {e}");
                    self.auth_failures.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(e) => {
                    log::warn!("Telemetry connection lost: {e}");
                    true
                }
            };

            if drop_client {
                client = None;
                self.connected.store(false, Ordering::SeqCst);
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        log::info!(
            "Telemetry receiver stopped (received={}, auth_fail={}, decode_err={})",
            self.messages_received(),
            self.auth_failures(),
            self.decode_errors()
        );
    }

    fn process(&self, payload: &[u8], seq: u64) {
        let mut snapshot: TelemetrySnapshot = match serde_json::from_slice(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!("Telemetry decode error: {e}");
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let now = unix_now();
        snapshot.received_at = Some(now);
        self.last_telemetry_ms
            .store((now * 1000.0) as u64, Ordering::SeqCst);
        self.messages_received.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Telemetry received: seq={seq}, estop={}",
            snapshot.estop.engaged
        );
        (self.handler)(snapshot);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
