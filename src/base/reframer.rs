//! JPEG re-framer for the raw MJPEG video stream.
//!
//! The video channel carries no framing at all - just JPEG after JPEG,
//! possibly with garbage in between after a reconnect. Frames are
//! recovered by scanning for the JPEG markers:
//!
//! ```text
//! SOI = FF D8 (start of image)    EOI = FF D9 (end of image)
//! ```
//!
//! Feed bytes in as they arrive; complete `SOI..=EOI` spans are emitted
//! in order. When no SOI is visible, everything but the trailing two
//! bytes is dropped (a marker could straddle the read boundary). When
//! the buffer outgrows [`MAX_VIDEO_BUFFER`], the overflow is counted and
//! the scanner resynchronizes at the next SOI past the buffer midpoint
//! (or clears outright). Overflow is a statistic, never an E-STOP
//! condition - video is best-effort.

use std::sync::Mutex;
use std::time::Instant;

use crate::constants::MAX_VIDEO_BUFFER;

const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];

/// Incremental JPEG frame extractor with a bounded buffer.
#[derive(Debug)]
pub struct JpegReframer {
    buf: Vec<u8>,
    max_buffer: usize,
    overflows: u64,
    frames_emitted: u64,
}

impl JpegReframer {
    /// Reframer with the standard 256 KB bound.
    pub fn new() -> Self {
        Self::with_max_buffer(MAX_VIDEO_BUFFER)
    }

    /// Reframer with an explicit buffer bound (tests).
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffer,
            overflows: 0,
            frames_emitted: 0,
        }
    }

    /// Append `bytes` and extract every complete JPEG frame now visible.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        // Bounded buffer: on overflow, count it and resync at the next
        // SOI beyond the midpoint.
        if self.buf.len() > self.max_buffer {
            self.overflows += 1;
            log::warn!(
                "Video buffer overflow ({} > {}), resyncing",
                self.buf.len(),
                self.max_buffer
            );
            match find_marker(&self.buf, SOI, self.max_buffer / 2) {
                Some(soi) => {
                    self.buf.drain(..soi);
                }
                None => self.buf.clear(),
            }
            return Vec::new();
        }

        let mut frames = Vec::new();
        loop {
            let Some(soi) = find_marker(&self.buf, SOI, 0) else {
                // No start marker anywhere: keep only the trailing two
                // bytes in case a marker straddles this read.
                if self.buf.len() > 2 {
                    self.buf.drain(..self.buf.len() - 2);
                }
                break;
            };

            let Some(eoi) = find_marker(&self.buf, EOI, soi + 2) else {
                // Frame started but not finished; wait for more bytes.
                break;
            };

            frames.push(self.buf[soi..eoi + 2].to_vec());
            self.frames_emitted += 1;
            self.buf.drain(..eoi + 2);
        }
        frames
    }

    /// Number of overflow resyncs so far.
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Number of frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Bytes currently held waiting for more input.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for JpegReframer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < 2 || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// The single "latest frame" slot shared with downstream consumers.
///
/// Consumers remember the instant of the last frame they took and only
/// receive a new one when the stored instant has advanced, which bounds
/// their polling without delivering duplicates.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: Mutex<Option<(Vec<u8>, Instant)>>,
}

impl LatestFrame {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn store(&self, frame: Vec<u8>) {
        *self.lock() = Some((frame, Instant::now()));
    }

    /// Current frame regardless of freshness.
    pub fn get(&self) -> Option<Vec<u8>> {
        self.lock().as_ref().map(|(frame, _)| frame.clone())
    }

    /// The frame and its arrival instant, only if newer than `since`.
    pub fn newer_than(&self, since: Option<Instant>) -> Option<(Vec<u8>, Instant)> {
        let slot = self.lock();
        let (frame, at) = slot.as_ref()?;
        match since {
            Some(since) if *at <= since => None,
            _ => Some((frame.clone(), *at)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(Vec<u8>, Instant)>> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xff, 0xd8];
        frame.extend_from_slice(body);
        frame.extend_from_slice(&[0xff, 0xd9]);
        frame
    }

    // ── Basic extraction ──────────────────────────────────────────────────

    #[test]
    fn test_two_frames_with_garbage_between() {
        // GG [SOI A B C EOI] HH [SOI D EOI] II
        let mut stream = Vec::new();
        stream.extend_from_slice(b"GG");
        stream.extend_from_slice(&jpeg(b"ABC"));
        stream.extend_from_slice(b"HH");
        stream.extend_from_slice(&jpeg(b"D"));
        stream.extend_from_slice(b"II");

        let mut reframer = JpegReframer::new();
        let frames = reframer.feed(&stream);

        assert_eq!(frames, vec![jpeg(b"ABC"), jpeg(b"D")]);
        assert_eq!(reframer.overflows(), 0);
        assert_eq!(reframer.frames_emitted(), 2);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = jpeg(b"split-me-up");
        let mut reframer = JpegReframer::new();

        for chunk in frame.chunks(3) {
            let frames = reframer.feed(chunk);
            if !frames.is_empty() {
                assert_eq!(frames, vec![frame.clone()]);
                return;
            }
        }
        panic!("frame never emitted");
    }

    #[test]
    fn test_byte_at_a_time() {
        let frame = jpeg(b"x");
        let mut reframer = JpegReframer::new();
        let mut emitted = Vec::new();
        for byte in &frame {
            emitted.extend(reframer.feed(&[*byte]));
        }
        assert_eq!(emitted, vec![frame]);
    }

    #[test]
    fn test_garbage_only_keeps_trailing_two_bytes() {
        let mut reframer = JpegReframer::new();
        assert!(reframer.feed(&[0x11; 1000]).is_empty());
        assert_eq!(reframer.pending(), 2);
    }

    #[test]
    fn test_marker_straddling_read_boundary() {
        let mut reframer = JpegReframer::new();
        // Garbage ending in FF, then D8 ... in the next read.
        assert!(reframer.feed(&[0x00, 0x00, 0xff]).is_empty());
        let mut rest = vec![0xd8];
        rest.extend_from_slice(b"body");
        rest.extend_from_slice(&[0xff, 0xd9]);
        let frames = reframer.feed(&rest);
        assert_eq!(frames, vec![jpeg(b"body")]);
    }

    #[test]
    fn test_incomplete_frame_is_held() {
        let mut reframer = JpegReframer::new();
        let mut partial = vec![0xff, 0xd8];
        partial.extend_from_slice(b"no-end-marker");
        assert!(reframer.feed(&partial).is_empty());
        assert_eq!(reframer.pending(), partial.len());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut stream = Vec::new();
        for i in 0..10u8 {
            stream.extend_from_slice(&jpeg(&[b'0' + i]));
        }
        let mut reframer = JpegReframer::new();
        let frames = reframer.feed(&stream);
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[9], jpeg(b"9"));
    }

    // ── Overflow / resync ─────────────────────────────────────────────────

    #[test]
    fn test_overflow_is_counted_and_resyncs_to_soi() {
        let mut reframer = JpegReframer::with_max_buffer(1000);

        // Garbage larger than the whole buffer with a frame start after
        // the midpoint.
        let mut stream = vec![0x00; 900];
        stream.extend_from_slice(&[0xff, 0xd8]);
        stream.extend_from_slice(b"tail");
        stream.extend_from_slice(&vec![0x00; 200]);

        assert!(reframer.feed(&stream).is_empty());
        assert_eq!(reframer.overflows(), 1);

        // The buffer was truncated to start at the SOI; completing the
        // frame now emits it.
        let frames = reframer.feed(&[0xff, 0xd9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..2], &SOI);
    }

    #[test]
    fn test_overflow_without_soi_clears_buffer() {
        let mut reframer = JpegReframer::with_max_buffer(1000);
        assert!(reframer.feed(&vec![0x42; 2000]).is_empty());
        assert_eq!(reframer.overflows(), 1);
        assert_eq!(reframer.pending(), 0);
    }

    #[test]
    fn test_frames_recovered_after_overflow() {
        let mut reframer = JpegReframer::with_max_buffer(1000);
        reframer.feed(&vec![0x42; 2000]);
        assert_eq!(reframer.overflows(), 1);

        let frames = reframer.feed(&jpeg(b"recovered"));
        assert_eq!(frames, vec![jpeg(b"recovered")]);
        assert_eq!(reframer.overflows(), 1);
    }

    #[test]
    fn test_interleaved_garbage_spans_count_individual_overflows() {
        let mut reframer = JpegReframer::with_max_buffer(1000);
        let mut emitted = 0;

        for i in 0..3 {
            // One garbage span exceeding the buffer, then a good frame.
            reframer.feed(&vec![0x13; 1500]);
            emitted += reframer.feed(&jpeg(&[b'a' + i])).len();
        }

        assert_eq!(reframer.overflows(), 3);
        assert_eq!(emitted, 3);
    }

    // ── Latest-frame slot ─────────────────────────────────────────────────

    #[test]
    fn test_latest_frame_freshness_gate() {
        let latest = LatestFrame::new();
        assert!(latest.newer_than(None).is_none());

        latest.store(jpeg(b"one"));
        let (frame, at) = latest.newer_than(None).expect("fresh frame");
        assert_eq!(frame, jpeg(b"one"));

        // Same frame is not delivered twice.
        assert!(latest.newer_than(Some(at)).is_none());

        latest.store(jpeg(b"two"));
        let (frame2, _) = latest.newer_than(Some(at)).expect("newer frame");
        assert_eq!(frame2, jpeg(b"two"));
    }
}
