//! Video streamer: robot -> base raw MJPEG byte stream.
//!
//! The video channel is not authenticated: video cannot cause actuation,
//! and HMAC at frame rate costs more than it buys. Frames from the
//! [`VideoCapture`] source are written back-to-back; the base re-frames
//! by scanning for JPEG SOI/EOI markers. Send failures close the socket
//! and reconnect under backoff. Video trouble is never an E-STOP
//! condition.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{configure_stream, CircuitBreaker, ExponentialBackoff};
use crate::hardware::VideoCapture;

/// Frame pacing (~10 fps).
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Connect timeout toward the base station.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-send write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Streams captured JPEG frames to the base station.
pub struct VideoStreamer {
    target: String,
    capture: Arc<dyn VideoCapture>,
    socket: Option<TcpStream>,
    backoff: ExponentialBackoff,
    breaker: CircuitBreaker,
    frames_sent: u64,
}

impl std::fmt::Debug for VideoStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStreamer")
            .field("target", &self.target)
            .field("frames_sent", &self.frames_sent)
            .finish_non_exhaustive()
    }
}

impl VideoStreamer {
    /// Streamer targeting `host:port` on the base station.
    pub fn new(host: &str, port: u16, capture: Arc<dyn VideoCapture>) -> Self {
        Self {
            target: format!("{host}:{port}"),
            capture,
            socket: None,
            backoff: ExponentialBackoff::new(),
            breaker: CircuitBreaker::new(),
            frames_sent: 0,
        }
    }

    /// Run until `running` clears. Owns its thread.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            if self.socket.is_none() {
                if !self.connect() {
                    let delay = self.backoff.next_delay();
                    let mut slept = Duration::ZERO;
                    while slept < delay && running.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(100));
                        slept += Duration::from_millis(100);
                    }
                    continue;
                }
            }

            if let Some(frame) = self.capture.latest_frame() {
                self.send_frame(&frame);
            }
            std::thread::sleep(FRAME_INTERVAL);
        }
        self.close();
        log::info!("Video streamer stopped (frames_sent={})", self.frames_sent);
    }

    fn connect(&mut self) -> bool {
        if !self.breaker.allow_request() {
            return false;
        }

        use std::net::ToSocketAddrs;
        let addrs: Vec<_> = match self.target.to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                log::error!("Cannot resolve {}: {e}", self.target);
                self.breaker.record_failure();
                return false;
            }
        };

        for addr in addrs {
            if let Ok(stream) = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                if let Err(e) = configure_stream(&stream, WRITE_TIMEOUT) {
                    log::warn!("Failed to configure video socket: {e}");
                }
                self.socket = Some(stream);
                self.backoff.reset();
                self.breaker.record_success();
                log::info!("Connected to base video at {}", self.target);
                return true;
            }
        }

        log::debug!("Video connect to {} failed", self.target);
        self.breaker.record_failure();
        false
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let Some(socket) = &mut self.socket else {
            return;
        };
        match socket.write_all(frame) {
            Ok(()) => {
                self.frames_sent += 1;
                self.breaker.record_success();
            }
            Err(e) => {
                log::warn!("Video send failed: {e}");
                self.close();
                self.breaker.record_failure();
            }
        }
    }

    fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
}
