//! Control channel server: the robot side of the base -> robot link.
//!
//! The robot listens; the base's control client connects. One client at a
//! time. Every frame is authenticated and replay-checked before the
//! executor sees it, and every failure class maps to its E-STOP reason:
//!
//! | failure                     | action                                  |
//! |-----------------------------|-----------------------------------------|
//! | read timeout                | normal, keep waiting                    |
//! | MAC failure / replay        | E-STOP `auth_failure`, drop client      |
//! | JSON decode failure         | E-STOP `decode_error`, drop client      |
//! | framing violation           | drop client (watchdog covers the rest)  |
//! | peer close / reset          | E-STOP `control_disconnect`, drop client|
//!
//! The listener survives client drops; only the accepted socket is closed.
//! Accept runs with a 500ms timeout so the loop stays responsive to the
//! shutdown flag, giving sub-2s failover together with the 1s read
//! timeout.

use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::connection::{configure_stream, create_server_socket, CircuitBreaker, ConnectionState, ExponentialBackoff};
use crate::framing::{FramingError, PreSharedKey, SecureFramer};
use crate::protocol::EstopReason;
use crate::robot::executor::CommandExecutor;
use crate::robot::gate::ActuatorGate;
use crate::robot::ControlLink;

/// Accept timeout: keeps the run loop interleaving supervisor work.
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-frame read timeout on the accepted client.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Robot-side control server.
pub struct ControlServer {
    port: u16,
    psk: Option<PreSharedKey>,
    gate: Arc<ActuatorGate>,
    executor: Arc<CommandExecutor>,
    link: Arc<ControlLink>,

    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    framer: SecureFramer,
    state: ConnectionState,
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,
    last_accept_log: std::time::Instant,
}

impl std::fmt::Debug for ControlServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlServer")
            .field("port", &self.port)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ControlServer {
    /// Create the server; the listener is bound on the first run-loop pass.
    pub fn new(
        port: u16,
        psk: Option<PreSharedKey>,
        gate: Arc<ActuatorGate>,
        executor: Arc<CommandExecutor>,
        link: Arc<ControlLink>,
    ) -> Self {
        Self {
            port,
            framer: SecureFramer::new(psk.clone(), "robot_control"),
            psk,
            gate,
            executor,
            link,
            listener: None,
            client: None,
            state: ConnectionState::Disconnected,
            backoff: ExponentialBackoff::new(),
            breaker: CircuitBreaker::new(),
            last_accept_log: std::time::Instant::now() - Duration::from_secs(60),
        }
    }

    /// Bind the listener (idempotent). Returns the bound address, which
    /// matters when the configured port is 0 (tests).
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr().context("listener local_addr");
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = create_server_socket(addr, 1, ACCEPT_TIMEOUT)
            .with_context(|| format!("bind control server on port {}", self.port))?;
        let bound = listener.local_addr().context("listener local_addr")?;
        log::info!("Control server listening on {bound} (accept timeout 500ms)");
        self.listener = Some(listener);
        Ok(bound)
    }

    /// Run until `running` clears. Owns its thread.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            if self.listener.is_none() {
                if let Err(e) = self.bind() {
                    log::error!("Control server bind failed: {e:#}");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            }

            if self.client.is_none() {
                self.accept_one();
            } else {
                self.receive_one();
            }
        }
        self.close_client();
        self.listener = None;
        log::info!("Control server stopped");
    }

    fn accept_one(&mut self) {
        if self.last_accept_log.elapsed() > Duration::from_secs(10) {
            log::info!("Control server: waiting for base station connection...");
            self.last_accept_log = std::time::Instant::now();
        }

        let Some(listener) = &self.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = configure_stream(&stream, READ_TIMEOUT) {
                    log::warn!("Failed to configure control socket from {peer}: {e}");
                }
                // Fresh framer per connection: the replay window never
                // spans connections.
                self.framer = SecureFramer::new(self.psk.clone(), "robot_control");
                self.client = Some(stream);
                self.state = ConnectionState::connected_now();
                self.link.set_connected(true);
                self.backoff.reset();
                self.breaker.record_success();
                log::info!("Accepted control connection from {peer} (read timeout 1.0s)");
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // Normal: nothing dialing in yet.
            }
            Err(e) => {
                log::error!("Error accepting control connection: {e}");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }

    fn receive_one(&mut self) {
        if !self.breaker.allow_request() {
            log::warn!("Control circuit breaker OPEN - dropping client until cooldown");
            self.close_client();
            return;
        }

        let Some(client) = &mut self.client else {
            return;
        };
        match self.framer.read_frame_from_stream(client, READ_TIMEOUT) {
            Ok((payload, seq)) => {
                self.state.touch();
                if let Err(e) = self.executor.process(&payload, seq) {
                    log::error!("Control decode error: {e}");
                    self.gate
                        .engage(EstopReason::DecodeError, &format!("control decode: {e}"));
                    self.breaker.record_failure();
                    self.close_client();
                    return;
                }
                self.breaker.record_success();
            }
            Err(e) if e.is_timeout() => {
                // Normal idle tick; the watchdog tracks control age.
            }
            Err(FramingError::AuthFail) => {
                log::error!("Control authentication FAILED");
                self.gate
                    .engage(EstopReason::AuthFailure, "control HMAC verification failed");
                self.breaker.record_failure();
                self.close_client();
            }
            Err(e @ FramingError::Replay { .. }) => {
                log::error!("Control replay detected: {e}");
                self.gate
                    .engage(EstopReason::AuthFailure, &format!("replay: {e}"));
                self.breaker.record_failure();
                self.close_client();
            }
            Err(e @ (FramingError::Oversize { .. } | FramingError::TooShort { .. })) => {
                log::error!("Control framing violation: {e}");
                self.breaker.record_failure();
                self.close_client();
            }
            Err(FramingError::NoKey) => {
                log::error!("Control frame received without a configured PSK; dropping client");
                self.breaker.record_failure();
                self.close_client();
            }
            Err(FramingError::Io(e)) => {
                log::warn!("Control connection lost: {e}");
                self.gate.engage(
                    EstopReason::ControlDisconnect,
                    &format!("control stream error: {e}"),
                );
                self.breaker.record_failure();
                self.close_client();
            }
        }
    }

    fn close_client(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.shutdown(std::net::Shutdown::Both);
        }
        self.state = ConnectionState::Disconnected;
        self.link.set_connected(false);
    }
}
