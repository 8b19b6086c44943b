use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

pub const BOUNDARY: &str = "frame";

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Re-frames a raw motion-JPEG byte stream into discrete images.
pub struct MjpegDemuxer {
    buffer: Vec<u8>,
    ceiling: usize,
    resync_window: usize,
    // Offset from which to resume the end-marker search once the buffer
    // starts with a start marker.
    scan_from: usize,
    frames: u64,
    resyncs: u64,
}

impl MjpegDemuxer {
    pub fn new(ceiling: usize, resync_window: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(ceiling.min(512 * 1024)),
            ceiling,
            resync_window: resync_window.min(ceiling),
            scan_from: 0,
            frames: 0,
            resyncs: 0,
        }
    }

    /// Feed one read worth of bytes; returns the images it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.scan_from == 0 {
                let start = match find_marker(&self.buffer, SOI, 0) {
                    Some(start) => start,
                    None => {
                        // A marker may straddle the read boundary.
                        let keep = self.buffer.len().min(1);
                        self.buffer.drain(..self.buffer.len() - keep);
                        break;
                    }
                };
                self.buffer.drain(..start);
                self.scan_from = SOI.len();
            }

            match find_marker(&self.buffer, EOI, self.scan_from) {
                Some(end) => {
                    let frame_len = end + EOI.len();
                    let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
                    frames.push(Bytes::from(frame));
                    self.frames += 1;
                    self.scan_from = 0;
                }
                None => {
                    // Resume at the last byte, which may be the 0xFF of a split marker.
                    self.scan_from = self.buffer.len().saturating_sub(1).max(SOI.len());
                    break;
                }
            }
        }

        if self.buffer.len() > self.ceiling {
            warn!(
                "MJPEG buffer exceeded {} bytes without a complete frame, keeping last {} bytes",
                self.ceiling, self.resync_window
            );
            let cut = self.buffer.len() - self.resync_window;
            self.buffer.drain(..cut);
            self.scan_from = 0;
            self.resyncs += 1;
        }

        frames
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|i| i + from)
}

/// Wrap one image as a `multipart/x-mixed-replace` part.
pub fn multipart_chunk(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut chunk = BytesMut::with_capacity(header.len() + frame.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(frame);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}
