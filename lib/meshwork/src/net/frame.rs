//! Length-delimited framing over the gateway byte stream.
//!
//! Each frame is `0x94 0xC3 <len_hi> <len_lo> <payload>` with a big-endian
//! 16-bit length of at most 512 bytes. The stream is noisy: the device can
//! interleave boot logs and garbage between frames, so the reader resyncs
//! by dropping bytes until a plausible header appears.

use byteorder::{BigEndian, WriteBytesExt};
use ferrite::logging;
use std::io;

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xc3;
pub const HEADER_SIZE: usize = 4;
pub const MAX_FRAME_PAYLOAD: usize = 512;

/// Incremental frame reader. Feed raw bytes with `extend`, then drain
/// complete frames with `next_frame`. The scratch buffer handed out by
/// `next_frame` is reused across frames.
pub struct FrameReader {
    buffer: Vec<u8>,
    // Consumed prefix of `buffer`. Compacted lazily so feeding bytes does
    // not shift memory on every frame.
    head: usize,
    frame: Vec<u8>,
    log: logging::Logger,
}

impl FrameReader {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> FrameReader {
        let reader_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        FrameReader {
            buffer: Vec::with_capacity(2 * (HEADER_SIZE + MAX_FRAME_PAYLOAD)),
            head: 0,
            frame: Vec::with_capacity(MAX_FRAME_PAYLOAD),
            log: reader_log,
        }
    }

    /// Number of buffered bytes not yet consumed.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len() - self.head
    }

    /// Appends raw transport bytes to the reassembly buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.compact();
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the payload of the next complete frame, or `None` when more
    /// data is needed. The returned slice is valid until the next call.
    pub fn next_frame(&mut self) -> Option<&[u8]> {
        loop {
            // Scan for the start byte, dropping noise in front of it.
            let dropped = self.pending().iter().take_while(|&&b| b != START1).count();

            if dropped > 0 {
                logging::debug!(self.log, "dropped noise bytes while scanning for frame";
                                "context" => "next_frame",
                                "dropped" => dropped);
                self.head += dropped;
            }

            let pending = self.pending();

            if pending.len() < HEADER_SIZE {
                return None;
            }

            if pending[1] != START2 {
                // A lone start byte; drop it and rescan.
                self.head += 1;
                continue;
            }

            let length = usize::from(pending[2]) << 8 | usize::from(pending[3]);

            if length == 0 || length > MAX_FRAME_PAYLOAD {
                logging::debug!(self.log, "dropped frame header with implausible length";
                                "context" => "next_frame",
                                "length" => length);
                self.head += 2;
                continue;
            }

            if pending.len() < HEADER_SIZE + length {
                return None;
            }

            self.frame.clear();
            self.frame.extend_from_slice(
                &self.buffer[self.head + HEADER_SIZE..self.head + HEADER_SIZE + length],
            );
            self.head += HEADER_SIZE + length;

            return Some(&self.frame);
        }
    }

    #[inline]
    fn pending(&self) -> &[u8] {
        &self.buffer[self.head..]
    }

    fn compact(&mut self) {
        if self.head > 0 {
            self.buffer.drain(..self.head);
            self.head = 0;
        }
    }
}

/// Writes a single framed payload to the supplied stream.
pub fn write_frame<W: io::Write>(stream: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload exceeds frame limit",
        ));
    }

    stream.write_all(&[START1, START2])?;
    stream.write_u16::<BigEndian>(payload.len() as u16)?;
    stream.write_all(payload)
}

/// Frames a payload into a fresh byte vector.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    write_frame(&mut frame, payload).expect("Vec writes are infallible");
    frame
}
