//! Control client: the base side of the base -> robot command channel.
//!
//! Owns the outbound TCP connection to the robot's control server. Any
//! thread may submit a command through [`ControlClient::send_command`];
//! sends are serialized by an internal lock. A background reconnect
//! thread re-establishes the connection under exponential backoff and
//! the circuit breaker, and re-initializes the framer on every new
//! connection so sequence numbers restart cleanly.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::connection::{configure_stream, CircuitBreaker, ExponentialBackoff};
use crate::framing::{PreSharedKey, SecureFramer};
use crate::protocol::Command;

/// Connect timeout toward the robot.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-command write timeout (control is latency-critical).
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

struct Conn {
    stream: TcpStream,
    framer: SecureFramer,
}

/// Thread-safe command sender with automatic reconnection.
pub struct ControlClient {
    target: String,
    psk: Option<PreSharedKey>,
    conn: Mutex<Option<Conn>>,
    connected: AtomicBool,
    commands_sent: AtomicU64,
    commands_failed: AtomicU64,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Client targeting the robot's control server.
    pub fn new(robot_ip: &str, port: u16, psk: Option<PreSharedKey>) -> Arc<Self> {
        let target = format!("{robot_ip}:{port}");
        log::info!("Control client initialized for {target}");
        Arc::new(Self {
            target,
            psk,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            commands_sent: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
        })
    }

    /// Whether the control connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Commands sent since start.
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    /// Commands that failed to send.
    pub fn commands_failed(&self) -> u64 {
        self.commands_failed.load(Ordering::Relaxed)
    }

    /// Send one command. Returns `false` (after counting) when offline,
    /// unauthenticated, or the write fails; failures drop the connection
    /// so the reconnect thread can rebuild it.
    pub fn send_command(&self, command: &Command) -> bool {
        let mut conn_guard = lock(&self.conn);
        let Some(conn) = conn_guard.as_mut() else {
            log::warn!("Not connected, cannot send command: {}", command.kind());
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if !conn.framer.is_authenticated() {
            log::error!(
                "Cannot send command {}: no PSK configured",
                command.kind()
            );
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let payload = command.to_wire();
        let frame = match conn.framer.create_frame(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Framing error for {}: {e}", command.kind());
                self.commands_failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match conn.stream.write_all(&frame) {
            Ok(()) => {
                self.commands_sent.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Sent command: {} (seq={})",
                    command.kind(),
                    conn.framer.send_seq()
                );
                true
            }
            Err(e) => {
                log::error!("Failed to send command {}: {e}", command.kind());
                self.commands_failed.fetch_add(1, Ordering::Relaxed);
                *conn_guard = None;
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Spawn the reconnect thread.
    pub fn spawn_reconnect(self: &Arc<Self>, running: &Arc<AtomicBool>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let running = Arc::clone(running);
        std::thread::Builder::new()
            .name("control-reconnect".into())
            .spawn(move || client.reconnect_loop(&running))
            .expect("spawn control reconnect thread")
    }

    fn reconnect_loop(&self, running: &AtomicBool) {
        let mut backoff = ExponentialBackoff::new();
        let mut breaker = CircuitBreaker::new();

        while running.load(Ordering::SeqCst) {
            if self.is_connected() {
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }

            if !breaker.allow_request() {
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }

            log::info!("Attempting to connect to robot at {}", self.target);
            if self.connect() {
                backoff.reset();
                breaker.record_success();
            } else {
                breaker.record_failure();
                let delay = backoff.next_delay();
                log::warn!(
                    "Connection failed, retrying in {:.0}s",
                    delay.as_secs_f64()
                );
                let mut slept = Duration::ZERO;
                while slept < delay && running.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(100));
                    slept += Duration::from_millis(100);
                }
            }
        }

        self.disconnect();
        log::info!(
            "Control client stopped (sent={}, failed={})",
            self.commands_sent(),
            self.commands_failed()
        );
    }

    fn connect(&self) -> bool {
        use std::net::ToSocketAddrs;
        let addrs: Vec<_> = match self.target.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                log::error!("Cannot resolve {}: {e}", self.target);
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    if let Err(e) = configure_stream(&stream, WRITE_TIMEOUT) {
                        log::warn!("Failed to configure control socket: {e}");
                    }
                    // Fresh framer per connection: sequences restart at 1
                    // and the robot's replay window starts clean.
                    let framer = SecureFramer::new(self.psk.clone(), "base_control");
                    *lock(&self.conn) = Some(Conn { stream, framer });
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("Connected to robot at {}", self.target);
                    return true;
                }
                Err(e) => {
                    log::debug!("Control connect to {addr} failed: {e}");
                }
            }
        }
        false
    }

    /// Drop the connection (reconnect thread will rebuild it).
    pub fn disconnect(&self) {
        let mut conn = lock(&self.conn);
        if let Some(c) = conn.take() {
            let _ = c.stream.shutdown(std::net::Shutdown::Both);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FramingError;
    use std::net::TcpListener;

    fn test_psk() -> PreSharedKey {
        PreSharedKey::from_hex(&"cc".repeat(32)).expect("valid test key")
    }

    #[test]
    fn test_send_while_disconnected_fails_and_counts() {
        let client = ControlClient::new("127.0.0.1", 1, Some(test_psk()));
        assert!(!client.send_command(&Command::ClampOpen {}));
        assert_eq!(client.commands_failed(), 1);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_commands_arrive_framed_and_sequenced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ControlClient::new("127.0.0.1", addr.port(), Some(test_psk()));
        assert!(client.connect());
        let (mut server_side, _) = listener.accept().unwrap();

        assert!(client.send_command(&Command::ClampClose {}));
        assert!(client.send_command(&Command::ClampOpen {}));
        assert_eq!(client.commands_sent(), 2);

        let rx = SecureFramer::new(Some(test_psk()), "test_rx");
        let (payload, seq) = rx
            .read_frame_from_stream(&mut server_side, Duration::from_secs(1))
            .unwrap();
        assert_eq!(seq, 1);
        let msg = Command::parse_message(&payload).unwrap();
        assert_eq!(msg.command, Command::ClampClose {});

        let (_, seq2) = rx
            .read_frame_from_stream(&mut server_side, Duration::from_secs(1))
            .unwrap();
        assert_eq!(seq2, 2);
    }

    #[test]
    fn test_receiver_with_wrong_key_rejects_client_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ControlClient::new("127.0.0.1", addr.port(), Some(test_psk()));
        assert!(client.connect());
        let (mut server_side, _) = listener.accept().unwrap();

        client.send_command(&Command::ClampClose {});

        let wrong = PreSharedKey::from_hex(&"dd".repeat(32)).unwrap();
        let rx = SecureFramer::new(Some(wrong), "test_rx");
        let err = rx
            .read_frame_from_stream(&mut server_side, Duration::from_secs(1))
            .expect_err("wrong key must fail");
        assert!(matches!(err, FramingError::AuthFail));
    }

    #[test]
    fn test_send_without_psk_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ControlClient::new("127.0.0.1", addr.port(), None);
        assert!(client.connect());
        assert!(!client.send_command(&Command::ClampClose {}));
        assert_eq!(client.commands_failed(), 1);
    }
}
