//! Authenticated wire framing with HMAC-SHA-256 and anti-replay.
//!
//! Every control and telemetry frame is framed as:
//!
//! ```text
//! [u16 BE length] [u64 BE sequence] [32-byte HMAC-SHA-256] [payload: length bytes]
//! ```
//!
//! The MAC covers `length || sequence || payload` keyed by the 32-byte
//! pre-shared key. Sequence numbers are strictly monotonic per direction
//! per connection: the first emitted frame carries sequence 1, and a
//! receiver rejects any frame whose sequence is not greater than the last
//! one it accepted.
//!
//! # Security properties
//!
//! - **Authentication / integrity**: HMAC-SHA-256 over the entire frame,
//!   verified in constant time.
//! - **Anti-replay**: strictly monotonic sequence acceptance. Replay
//!   windows cannot span connections because each (re)connect gets a
//!   fresh `SecureFramer`.
//!
//! The video channel does not use this module; it is a raw MJPEG byte
//! stream re-framed by scanning for JPEG markers (see `base::reframer`).

use std::io::Read;
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::constants::MAX_FRAME_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Frame header: length (2) + sequence (8) + MAC (32).
pub const HEADER_SIZE: usize = 2 + 8 + 32;

/// Byte length of the pre-shared key.
pub const PSK_LEN: usize = 32;

/// Environment variable holding the 64-hex-char pre-shared key.
pub const PSK_ENV: &str = "SERPENT_PSK_HEX";

/// The 32-byte pre-shared HMAC key.
///
/// Deployed out-of-band; never logged or printed. The `Debug` impl is
/// deliberately opaque.
#[derive(Clone)]
pub struct PreSharedKey([u8; PSK_LEN]);

impl PreSharedKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; PSK_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-hex-character key string.
    ///
    /// Returns `None` (and logs at error level) when the string is not
    /// valid hex or not exactly 32 bytes.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let decoded = match data_encoding::HEXLOWER_PERMISSIVE.decode(hex.trim().as_bytes()) {
            Ok(d) => d,
            Err(e) => {
                log::error!("Invalid PSK hex: {e}");
                return None;
            }
        };
        if decoded.len() != PSK_LEN {
            log::error!(
                "PSK must be {PSK_LEN} bytes (64 hex chars), got {}",
                decoded.len()
            );
            return None;
        }
        let mut bytes = [0u8; PSK_LEN];
        bytes.copy_from_slice(&decoded);
        Some(Self(bytes))
    }

    /// Load the key from `SERPENT_PSK_HEX`.
    ///
    /// Absence is not fatal: the node starts unauthenticated, and the
    /// robot will refuse to clear E-STOP until a valid key is deployed.
    pub fn from_env() -> Option<Self> {
        match std::env::var(PSK_ENV) {
            Ok(hex) => Self::from_hex(&hex),
            Err(_) => None,
        }
    }

    fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreSharedKey(..)")
    }
}

/// Errors produced while creating or parsing authenticated frames.
#[derive(Debug)]
pub enum FramingError {
    /// No PSK configured; authenticated operations are impossible.
    NoKey,
    /// Buffer shorter than a complete frame.
    TooShort { got: usize, need: usize },
    /// Declared or actual payload length exceeds [`MAX_FRAME_SIZE`].
    Oversize { length: usize },
    /// HMAC verification failed (constant-time compare).
    AuthFail,
    /// Sequence number not strictly greater than the last accepted one.
    Replay { seq: u64, last: u64 },
    /// Underlying stream error (includes read timeouts).
    Io(std::io::Error),
}

impl FramingError {
    /// True when this error is a read timeout: the normal idle outcome of
    /// a blocking read with a short timeout, not a connection failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoKey => write!(f, "PSK not configured"),
            Self::TooShort { got, need } => write!(f, "Frame too short: {got} < {need}"),
            Self::Oversize { length } => {
                write!(f, "Frame length {length} exceeds max {MAX_FRAME_SIZE}")
            }
            Self::AuthFail => write!(f, "HMAC verification failed"),
            Self::Replay { seq, last } => {
                write!(f, "Replay detected: seq {seq} not greater than {last}")
            }
            Self::Io(e) => write!(f, "Stream error: {e}"),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<std::io::Error> for FramingError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Authenticated framer for one direction pair of one connection.
///
/// Send and receive sequence counters are independent; both are guarded
/// by mutexes so a framer may be shared across threads. A framer must be
/// replaced with a fresh one whenever its connection is re-established,
/// which is what resets the replay window.
pub struct SecureFramer {
    role: String,
    psk: Option<PreSharedKey>,
    send_seq: Mutex<u64>,
    recv_seq: Mutex<u64>,
}

impl std::fmt::Debug for SecureFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureFramer")
            .field("role", &self.role)
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl SecureFramer {
    /// Create a framer with an explicit (possibly absent) key.
    ///
    /// `role` is a short identifier used in log lines, e.g. `"robot_control"`.
    pub fn new(psk: Option<PreSharedKey>, role: impl Into<String>) -> Self {
        let role = role.into();
        if psk.is_none() {
            log::error!("[{role}] NO PSK CONFIGURED - {PSK_ENV} not set or invalid");
            log::error!("[{role}] robot will refuse to clear E-STOP without a valid PSK");
        }
        Self {
            role,
            psk,
            send_seq: Mutex::new(0),
            recv_seq: Mutex::new(0),
        }
    }

    /// Create a framer keyed from `SERPENT_PSK_HEX`.
    pub fn from_env(role: impl Into<String>) -> Self {
        Self::new(PreSharedKey::from_env(), role)
    }

    /// True when a valid PSK is loaded.
    pub fn is_authenticated(&self) -> bool {
        self.psk.is_some()
    }

    /// Current send sequence (the value stamped into the last frame).
    pub fn send_seq(&self) -> u64 {
        *lock(&self.send_seq)
    }

    /// Last accepted receive sequence.
    pub fn recv_seq(&self) -> u64 {
        *lock(&self.recv_seq)
    }

    /// Build an authenticated frame around `payload`.
    ///
    /// Atomically increments the send sequence; the new value is the
    /// sequence stamped into the frame (so the first frame carries 1).
    ///
    /// # Errors
    ///
    /// `NoKey` when unauthenticated, `Oversize` when the payload exceeds
    /// [`MAX_FRAME_SIZE`].
    pub fn create_frame(&self, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
        let psk = self.psk.as_ref().ok_or(FramingError::NoKey)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FramingError::Oversize {
                length: payload.len(),
            });
        }

        let seq = {
            let mut guard = lock(&self.send_seq);
            *guard += 1;
            *guard
        };

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());

        let mut mac = new_mac(psk);
        mac.update(&frame[..10]);
        mac.update(payload);
        frame.extend_from_slice(&mac.finalize().into_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Parse and verify one complete frame from `data`.
    ///
    /// On success returns the payload and its sequence number and advances
    /// the replay window. Any failure leaves the window untouched.
    pub fn parse_frame(&self, data: &[u8]) -> Result<(Vec<u8>, u64), FramingError> {
        let psk = self.psk.as_ref().ok_or(FramingError::NoKey)?;

        if data.len() < HEADER_SIZE {
            return Err(FramingError::TooShort {
                got: data.len(),
                need: HEADER_SIZE,
            });
        }

        let length = u16::from_be_bytes([data[0], data[1]]) as usize;
        let seq = u64::from_be_bytes([
            data[2], data[3], data[4], data[5], data[6], data[7], data[8], data[9],
        ]);

        if length > MAX_FRAME_SIZE {
            return Err(FramingError::Oversize { length });
        }
        if data.len() < HEADER_SIZE + length {
            return Err(FramingError::TooShort {
                got: data.len(),
                need: HEADER_SIZE + length,
            });
        }

        let payload = &data[HEADER_SIZE..HEADER_SIZE + length];
        self.verify_and_accept(psk, &data[..10], &data[10..42], payload, seq)?;
        Ok((payload.to_vec(), seq))
    }

    /// Read exactly one frame from a stream: exact-read the 42-byte header,
    /// then exact-read the payload.
    ///
    /// Timeout errors propagate as `Io` without advancing the replay
    /// window. A clean peer close surfaces as `Io(UnexpectedEof)`.
    pub fn read_frame_from_stream(
        &self,
        stream: &mut TcpStream,
        timeout: Duration,
    ) -> Result<(Vec<u8>, u64), FramingError> {
        stream.set_read_timeout(Some(timeout))?;

        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header)?;

        let length = u16::from_be_bytes([header[0], header[1]]) as usize;
        let seq = u64::from_be_bytes([
            header[2], header[3], header[4], header[5], header[6], header[7], header[8], header[9],
        ]);

        if length > MAX_FRAME_SIZE {
            return Err(FramingError::Oversize { length });
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            stream.read_exact(&mut payload)?;
        }

        let psk = self.psk.as_ref().ok_or(FramingError::NoKey)?;
        self.verify_and_accept(psk, &header[..10], &header[10..42], &payload, seq)?;
        Ok((payload, seq))
    }

    /// MAC verification (constant time) followed by the replay check.
    fn verify_and_accept(
        &self,
        psk: &PreSharedKey,
        header: &[u8],
        received_mac: &[u8],
        payload: &[u8],
        seq: u64,
    ) -> Result<(), FramingError> {
        let mut mac = new_mac(psk);
        mac.update(header);
        mac.update(payload);
        if mac.verify_slice(received_mac).is_err() {
            log::warn!("[{}] HMAC verification FAILED for seq={seq}", self.role);
            return Err(FramingError::AuthFail);
        }

        let mut last = lock(&self.recv_seq);
        if seq <= *last {
            log::warn!("[{}] replay detected: seq={seq} <= last={}", self.role, *last);
            return Err(FramingError::Replay { seq, last: *last });
        }
        *last = seq;
        Ok(())
    }
}

fn new_mac(psk: &PreSharedKey) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail for a 32-byte key.
    #[allow(clippy::unwrap_used)]
    HmacSha256::new_from_slice(psk.as_bytes()).unwrap()
}

/// Lock helper that survives poisoning: a panic elsewhere must not be able
/// to wedge the wire path.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_psk() -> PreSharedKey {
        PreSharedKey::from_hex(&"aa".repeat(32)).expect("valid test key")
    }

    fn framer() -> SecureFramer {
        SecureFramer::new(Some(test_psk()), "test")
    }

    // ── Round trips ───────────────────────────────────────────────────────

    #[test]
    fn test_round_trip_basic() {
        let tx = framer();
        let rx = framer();

        let payload = br#"{"type":"ping","data":{"seq":1}}"#;
        let frame = tx.create_frame(payload).unwrap();
        // 42-byte header plus the payload, nothing else.
        assert_eq!(frame.len(), HEADER_SIZE + payload.len());

        let (parsed, seq) = rx.parse_frame(&frame).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_spec_example_frame_is_72_bytes() {
        // 30-byte payload -> 42 + 30 = 72 bytes on the wire.
        let tx = framer();
        let payload = br#"{"type":"ping","data":{"s":1}}"#;
        assert_eq!(payload.len(), 30);
        assert_eq!(tx.create_frame(payload).unwrap().len(), 72);
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        let tx = framer();
        let rx = framer();
        for (i, size) in [0usize, 1, 2, 255, 256, 4096, MAX_FRAME_SIZE]
            .iter()
            .enumerate()
        {
            let payload = vec![0x5au8; *size];
            let frame = tx.create_frame(&payload).unwrap();
            let (parsed, seq) = rx.parse_frame(&frame).unwrap();
            assert_eq!(parsed.len(), *size);
            assert_eq!(seq, (i + 1) as u64);
        }
    }

    #[test]
    fn test_send_sequence_strictly_increasing_from_one() {
        let tx = framer();
        for expected in 1..=5u64 {
            let frame = tx.create_frame(b"x").unwrap();
            let seq = u64::from_be_bytes(frame[2..10].try_into().unwrap());
            assert_eq!(seq, expected);
        }
        assert_eq!(tx.send_seq(), 5);
    }

    // ── Rejections ────────────────────────────────────────────────────────

    #[test]
    fn test_oversize_payload_rejected_on_send() {
        let tx = framer();
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            tx.create_frame(&payload),
            Err(FramingError::Oversize { .. })
        ));
    }

    #[test]
    fn test_no_key_rejected_on_send_and_parse() {
        let unkeyed = SecureFramer::new(None, "test");
        assert!(!unkeyed.is_authenticated());
        assert!(matches!(
            unkeyed.create_frame(b"x"),
            Err(FramingError::NoKey)
        ));
        let frame = framer().create_frame(b"x").unwrap();
        assert!(matches!(
            unkeyed.parse_frame(&frame),
            Err(FramingError::NoKey)
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let rx = framer();
        assert!(matches!(
            rx.parse_frame(&[0u8; 10]),
            Err(FramingError::TooShort { .. })
        ));

        let frame = framer().create_frame(b"hello").unwrap();
        assert!(matches!(
            rx.parse_frame(&frame[..frame.len() - 1]),
            Err(FramingError::TooShort { .. })
        ));
    }

    #[test]
    fn test_every_single_byte_tamper_is_rejected() {
        let tx = framer();
        let frame = tx.create_frame(b"tamper-me").unwrap();

        for i in 0..frame.len() {
            let rx = framer();
            let mut tampered = frame.clone();
            tampered[i] ^= 0x01;
            let err = rx.parse_frame(&tampered).expect_err("tamper must fail");
            // A tampered frame may fail the length checks or the MAC, but
            // must never decode to a payload.
            assert!(
                matches!(
                    err,
                    FramingError::AuthFail
                        | FramingError::Oversize { .. }
                        | FramingError::TooShort { .. }
                ),
                "byte {i}: unexpected error {err}"
            );
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let tx = framer();
        let other = PreSharedKey::from_hex(&"bb".repeat(32)).unwrap();
        let rx = SecureFramer::new(Some(other), "test");
        let frame = tx.create_frame(b"payload").unwrap();
        assert!(matches!(rx.parse_frame(&frame), Err(FramingError::AuthFail)));
    }

    #[test]
    fn test_replay_rejected() {
        let tx = framer();
        let rx = framer();
        let frame = tx.create_frame(b"once").unwrap();

        rx.parse_frame(&frame).unwrap();
        assert!(matches!(
            rx.parse_frame(&frame),
            Err(FramingError::Replay { seq: 1, last: 1 })
        ));
        // Replay does not advance the window.
        assert_eq!(rx.recv_seq(), 1);
    }

    #[test]
    fn test_stale_sequence_rejected_after_newer_frame() {
        let tx = framer();
        let rx = framer();
        let first = tx.create_frame(b"one").unwrap();
        let second = tx.create_frame(b"two").unwrap();

        rx.parse_frame(&second).unwrap();
        assert!(matches!(
            rx.parse_frame(&first),
            Err(FramingError::Replay { .. })
        ));
    }

    #[test]
    fn test_fresh_framer_resets_replay_window() {
        let tx = framer();
        let frame = tx.create_frame(b"reconnect").unwrap();

        let rx1 = framer();
        rx1.parse_frame(&frame).unwrap();

        // A new connection gets a new framer, so the same bytes parse again.
        let rx2 = framer();
        let (payload, seq) = rx2.parse_frame(&frame).unwrap();
        assert_eq!(payload, b"reconnect");
        assert_eq!(seq, 1);
    }

    // ── Key handling ──────────────────────────────────────────────────────

    #[test]
    fn test_psk_hex_parsing() {
        assert!(PreSharedKey::from_hex(&"ab".repeat(32)).is_some());
        assert!(PreSharedKey::from_hex(&"AB".repeat(32)).is_some());
        assert!(PreSharedKey::from_hex("deadbeef").is_none());
        assert!(PreSharedKey::from_hex("zz").is_none());
        assert!(PreSharedKey::from_hex(&"ab".repeat(33)).is_none());
    }

    #[test]
    fn test_psk_debug_is_opaque() {
        let shown = format!("{:?}", test_psk());
        assert!(!shown.contains("aa"));
    }
}
