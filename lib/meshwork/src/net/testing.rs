//! In-memory duplex transport for exercising the link and session without
//! sockets.

use crate::net::frame::{encode_frame, FrameReader};
use crate::net::link::Transport;
use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// Transport half handed to the link manager.
pub struct PipeTransport {
    reader: Mutex<Option<PipeReader>>,
    writer_tx: Mutex<Sender<Vec<u8>>>,
    // Cloned into shutdown so a parked reader can be released with an EOF
    // sentinel (empty chunk).
    eof_tx: Mutex<Sender<Vec<u8>>>,
}

/// Test-side half that plays the role of the physical gateway.
pub struct RemoteEnd {
    to_device: Option<Sender<Vec<u8>>>,
    from_device: Receiver<Vec<u8>>,
    frames: FrameReader,
}

pub fn pipe() -> (PipeTransport, RemoteEnd) {
    let (to_device_tx, to_device_rx) = channel();
    let (from_device_tx, from_device_rx) = channel();

    let transport = PipeTransport {
        reader: Mutex::new(Some(PipeReader {
            rx: to_device_rx,
            pending: Vec::new(),
            offset: 0,
        })),
        writer_tx: Mutex::new(from_device_tx),
        eof_tx: Mutex::new(to_device_tx.clone()),
    };

    let remote = RemoteEnd {
        to_device: Some(to_device_tx),
        from_device: from_device_rx,
        frames: FrameReader::new(None),
    };

    (transport, remote)
}

impl Transport for PipeTransport {
    fn reader(&self) -> io::Result<Box<dyn io::Read + Send>> {
        self.reader
            .lock()
            .expect("Poisoned reader lock")
            .take()
            .map(|reader| Box::new(reader) as Box<dyn io::Read + Send>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "reader already split off"))
    }

    fn writer(&self) -> io::Result<Box<dyn io::Write + Send>> {
        Ok(Box::new(PipeWriter {
            tx: self.writer_tx.lock().expect("Poisoned writer lock").clone(),
        }))
    }

    fn shutdown(&self) {
        drop(
            self.eof_tx
                .lock()
                .expect("Poisoned eof lock")
                .send(Vec::new()),
        );
    }
}

struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset == self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) if chunk.is_empty() => return Ok(0),
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }

        let count = buf.len().min(self.pending.len() - self.offset);
        buf[..count].copy_from_slice(&self.pending[self.offset..self.offset + count]);
        self.offset += count;

        Ok(count)
    }
}

struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RemoteEnd {
    /// Frames and delivers a payload to the device-side reader.
    pub fn send_frame(&mut self, payload: &[u8]) {
        self.send_raw(&encode_frame(payload));
    }

    /// Delivers raw bytes, bypassing the framer (for noise injection).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        if let Some(tx) = &self.to_device {
            drop(tx.send(bytes.to_vec()));
        }
    }

    /// Next frame written by the device side, or `None` after two quiet
    /// seconds.
    pub fn recv_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.frames.next_frame() {
                return Some(frame.to_vec());
            }

            match self.from_device.recv_timeout(Duration::from_secs(2)) {
                Ok(chunk) => self.frames.extend(&chunk),
                Err(_) => return None,
            }
        }
    }

    /// Simulates the gateway closing the connection.
    pub fn close(&mut self) {
        self.to_device = None;
    }
}
