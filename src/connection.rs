//! Connection management primitives shared by every channel.
//!
//! Each of the three TCP channels (control, telemetry, video) composes the
//! same small set of tools:
//!
//! - [`ExponentialBackoff`] - reconnect pacing (1s, 2s, 4s ... capped at 32s)
//! - [`CircuitBreaker`] - stops hammering a peer that keeps failing
//! - [`configure_stream`] - keepalive, Nagle off, short per-op timeouts
//! - [`create_server_socket`] - SO_REUSEADDR listener with accept timeout
//!
//! Under these settings a dropped control or telemetry channel is detected
//! within about one second (short read timeout) and normally re-established
//! within one to two seconds, absent circuit-breaker lockout.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, TcpKeepalive, Type};

/// Reconnection backoff configuration.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_BACKOFF: Duration = Duration::from_secs(32);

/// Circuit breaker configuration.
const FAILURE_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Keepalive configuration (~90s dead-peer detection: 60 + 10*3).
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Per-channel connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and exchanging frames.
    Connected {
        /// When the connection was established.
        since: Instant,
        /// Last send or accepted receive.
        last_activity: Instant,
    },
    /// Failed in a way that the supervisor has not yet recovered from.
    Broken {
        /// Human-readable failure description.
        reason: String,
    },
}

impl ConnectionState {
    /// Transition to `Connected` stamped with the current instant.
    pub fn connected_now() -> Self {
        let now = Instant::now();
        Self::Connected {
            since: now,
            last_activity: now,
        }
    }

    /// True in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Refresh `last_activity` if connected.
    pub fn touch(&mut self) {
        if let Self::Connected { last_activity, .. } = self {
            *last_activity = Instant::now();
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Exponential backoff delay calculator.
///
/// `next_delay()` returns the current delay and doubles it (capped);
/// `reset()` drops back to the initial delay on success.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Backoff with the channel defaults (1s start, x2, 32s cap).
    pub fn new() -> Self {
        Self::with_params(INITIAL_BACKOFF, BACKOFF_MULTIPLIER, MAX_BACKOFF)
    }

    /// Backoff with explicit parameters.
    pub fn with_params(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
            current: initial,
        }
    }

    /// Get the next delay and advance the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    /// Reset to the initial delay. Call on successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failure threshold exceeded, requests blocked until cooldown expires.
    Open,
    /// Cooldown expired; one probe request allowed.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase tag for status events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Failure-counting gate that temporarily forbids connection attempts
/// after repeated failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failure_count: u32,
    last_failure: Option<Instant>,
    state: CircuitState,
}

impl CircuitBreaker {
    /// Breaker with the channel defaults (5 failures, 30s cooldown).
    pub fn new() -> Self {
        Self::with_params(FAILURE_THRESHOLD, BREAKER_COOLDOWN)
    }

    /// Breaker with explicit parameters.
    pub fn with_params(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            failure_count: 0,
            last_failure: None,
            state: CircuitState::Closed,
        }
    }

    /// Whether a request should be attempted right now.
    ///
    /// An `Open` breaker transitions to `HalfOpen` (allowing one probe)
    /// once the cooldown has elapsed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = self
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if expired {
                    log::info!("Circuit breaker transitioning to HALF_OPEN (testing recovery)");
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request: resets the count and closes the circuit.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            log::info!("Circuit breaker transitioning to CLOSED (recovery successful)");
        }
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    /// Record a failed request: may open the circuit.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.state == CircuitState::HalfOpen {
            log::warn!("Circuit breaker reopening (recovery test failed)");
            self.state = CircuitState::Open;
            return;
        }

        if self.failure_count >= self.failure_threshold && self.state != CircuitState::Open {
            log::warn!(
                "Circuit breaker OPEN ({} failures, will retry after {:?})",
                self.failure_count,
                self.cooldown
            );
            self.state = CircuitState::Open;
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a TCP server socket with SO_REUSEADDR and a short accept timeout.
///
/// SO_REUSEADDR lets a restarted node rebind a port still in TIME_WAIT.
/// The accept timeout (applied as a receive timeout on the listening
/// socket) keeps the accept loop responsive to the shutdown flag.
pub fn create_server_socket(
    addr: SocketAddr,
    backlog: i32,
    accept_timeout: Duration,
) -> std::io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_read_timeout(Some(accept_timeout))?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    log::debug!("Server socket created: {addr} (SO_REUSEADDR enabled)");
    Ok(socket.into())
}

/// Configure an established stream for the bridge: OS keepalive
/// (60s/10s/3), Nagle disabled, and a per-operation read/write timeout.
pub fn configure_stream(stream: &TcpStream, io_timeout: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_RETRIES);

    let sock = socket2::SockRef::from(stream);
    sock.set_tcp_keepalive(&keepalive)?;
    sock.set_nodelay(true)?;

    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(())
}
