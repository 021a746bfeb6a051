//! Video receiver: accepts the robot's raw MJPEG stream and re-frames it.
//!
//! The video channel is not authenticated (it cannot cause actuation).
//! Received bytes run through the [`JpegReframer`]; each recovered frame
//! replaces
//! the shared [`LatestFrame`] slot that the MJPEG consumers poll. Buffer
//! overflow means resync, never E-STOP.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::base::reframer::{JpegReframer, LatestFrame};
use crate::connection::{configure_stream, create_server_socket};

/// Accept timeout (shutdown responsiveness).
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read timeout; video may legitimately pause between frames.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Receive chunk size.
const RECV_BUFFER: usize = 65_536;

/// Base-side video receiver.
pub struct VideoReceiver {
    port: u16,
    latest: Arc<LatestFrame>,
    connected: Arc<AtomicBool>,
    frames_received: Arc<AtomicU64>,
    buffer_overflows: Arc<AtomicU64>,
    bound: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for VideoReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoReceiver")
            .field("port", &self.port)
            .field("frames_received", &self.frames_received())
            .finish_non_exhaustive()
    }
}

impl VideoReceiver {
    /// Receiver listening on `port`.
    pub fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            latest: Arc::new(LatestFrame::new()),
            connected: Arc::new(AtomicBool::new(false)),
            frames_received: Arc::new(AtomicU64::new(0)),
            buffer_overflows: Arc::new(AtomicU64::new(0)),
            bound: Mutex::new(None),
        })
    }

    /// Shared latest-frame slot for downstream consumers (MJPEG server,
    /// video recorder).
    pub fn latest_frame(&self) -> Arc<LatestFrame> {
        Arc::clone(&self.latest)
    }

    /// Whether the robot's video stream is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Frames recovered since start.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Overflow resyncs since start.
    pub fn buffer_overflows(&self) -> u64 {
        self.buffer_overflows.load(Ordering::Relaxed)
    }

    /// The bound listener address once the thread is up (tests use port 0).
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *lock(&self.bound)
    }

    /// Spawn the receive thread.
    pub fn spawn(self: &Arc<Self>, running: &Arc<AtomicBool>) -> Result<JoinHandle<()>> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = create_server_socket(addr, 1, ACCEPT_TIMEOUT)
            .with_context(|| format!("bind video server on port {}", self.port))?;
        let bound = listener.local_addr().context("listener local_addr")?;
        *lock(&self.bound) = Some(bound);
        log::info!("Listening for video on {bound}");

        let receiver = Arc::clone(self);
        let running = Arc::clone(running);
        std::thread::Builder::new()
            .name("video-receiver".into())
            .spawn(move || receiver.run(&listener, &running))
            .context("spawn video receiver")
    }

    fn run(&self, listener: &std::net::TcpListener, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            let stream = match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = configure_stream(&stream, READ_TIMEOUT) {
                        log::warn!("Failed to configure video socket: {e}");
                    }
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("Robot video connected from {peer}");
                    stream
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("Error accepting video connection: {e}");
                    std::thread::sleep(Duration::from_millis(500));
                    continue;
                }
            };

            self.serve_stream(stream, running);
            self.connected.store(false, Ordering::SeqCst);
        }

        log::info!(
            "Video receiver stopped (frames={}, overflows={})",
            self.frames_received(),
            self.buffer_overflows()
        );
    }

    fn serve_stream(&self, mut stream: TcpStream, running: &AtomicBool) {
        let mut reframer = JpegReframer::new();
        let mut buf = vec![0u8; RECV_BUFFER];

        while running.load(Ordering::SeqCst) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::warn!("Robot video disconnected");
                    return;
                }
                Ok(n) => {
                    let before = reframer.overflows();
                    for frame in reframer.feed(&buf[..n]) {
                        log::debug!("Video frame: {} bytes", frame.len());
                        self.latest.store(frame);
                        self.frames_received.fetch_add(1, Ordering::Relaxed);
                    }
                    let overflowed = reframer.overflows() - before;
                    if overflowed > 0 {
                        self.buffer_overflows.fetch_add(overflowed, Ordering::Relaxed);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    // Idle stream; keep waiting.
                }
                Err(e) => {
                    log::error!("Error receiving video stream: {e}");
                    return;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff, 0xd8];
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xff, 0xd9]);
        frame
    }

    #[test]
    fn test_frames_reach_the_latest_slot() {
        let running = Arc::new(AtomicBool::new(true));
        let receiver = VideoReceiver::new(0);
        let handle = receiver.spawn(&running).unwrap();
        let addr = receiver.bound_addr().unwrap();

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"garbage-prefix").unwrap();
        stream.write_all(&jpeg(b"frame-one")).unwrap();
        stream.write_all(&jpeg(b"frame-two")).unwrap();
        stream.flush().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while receiver.frames_received() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(receiver.frames_received(), 2);
        assert_eq!(receiver.latest_frame().get(), Some(jpeg(b"frame-two")));
        assert_eq!(receiver.buffer_overflows(), 0);

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
