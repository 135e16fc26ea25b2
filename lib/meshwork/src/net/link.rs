//! Ownership of the physical transport.
//!
//! The link manager dials the gateway, runs one blocking reader thread and
//! one writer thread, reframes the inbound byte stream and hands complete
//! payloads to the session. On connection loss it backs off and redials
//! unless the user asked for the disconnect.

use crate::net::frame::{self, FrameReader};
use crate::proto::ToRadio;
use ferrite::logging;
use prost::Message;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered to the session, strictly in transport arrival order.
#[derive(Debug, PartialEq)]
pub enum LinkEvent {
    Connected,
    Frame(Vec<u8>),
    Disconnected,
}

#[derive(Clone)]
pub struct LinkConfig {
    pub target: String,
    /// Keepalive cadence while connected; the gateway drops quiet hosts.
    pub heartbeat_interval: Duration,
}

impl LinkConfig {
    pub fn new<S: Into<String>>(target: S) -> LinkConfig {
        LinkConfig {
            target: target.into(),
            heartbeat_interval: Duration::from_secs(300),
        }
    }
}

/// A connected byte-stream transport that can be split into independently
/// owned blocking halves.
pub trait Transport: Send + Sync + 'static {
    fn reader(&self) -> io::Result<Box<dyn io::Read + Send>>;
    fn writer(&self) -> io::Result<Box<dyn io::Write + Send>>;

    /// Forces both halves closed, unblocking a parked reader.
    fn shutdown(&self);
}

/// Produces a fresh transport on every (re)connect attempt.
pub trait Dialer: Send + 'static {
    fn dial(&mut self) -> io::Result<Box<dyn Transport>>;
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl Transport for TcpTransport {
    fn reader(&self) -> io::Result<Box<dyn io::Read + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn io::Write + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    fn shutdown(&self) {
        drop(self.stream.shutdown(Shutdown::Both));
    }
}

pub struct TcpDialer {
    target: String,
}

impl TcpDialer {
    pub fn new<S: Into<String>>(target: S) -> TcpDialer {
        TcpDialer {
            target: target.into(),
        }
    }
}

impl Dialer for TcpDialer {
    fn dial(&mut self) -> io::Result<Box<dyn Transport>> {
        use std::net::ToSocketAddrs;

        let target = dial_target(&self.target, crate::DEFAULT_DEVICE_PORT);
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for target"))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;

        Ok(Box::new(TcpTransport { stream }))
    }
}

/// Appends the default port to a bare hostname; `host:port` passes through.
pub fn dial_target(target: &str, default_port: u16) -> String {
    if target.rsplit(':').next().map_or(false, |tail| {
        !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())
    }) {
        target.to_string()
    } else {
        format!("{}:{}", target, default_port)
    }
}

struct LinkShared {
    writer: Mutex<Option<Box<dyn io::Write + Send>>>,
    current: Mutex<Option<Arc<Box<dyn Transport>>>>,
    status: Mutex<ConnectionStatus>,
    user_disconnected: AtomicBool,
}

impl LinkShared {
    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().expect("Poisoned status lock") = status;
    }

    /// Frames and writes one payload under the writer lock. Returns false
    /// on write failure, after forcing the connection closed so the reader
    /// observes the loss too.
    fn write_payload(&self, payload: &[u8]) -> bool {
        let mut slot = self.writer.lock().expect("Poisoned writer lock");

        let writer = match slot.as_mut() {
            Some(writer) => writer,
            None => return false,
        };

        let result = frame::write_frame(writer, payload).and_then(|_| writer.flush());

        if result.is_err() {
            *slot = None;
            drop(slot);
            self.drop_connection();
            return false;
        }

        true
    }

    fn drop_connection(&self) {
        if let Some(transport) = self.current.lock().expect("Poisoned transport lock").take() {
            transport.shutdown();
        }
    }
}

/// Handle to the link, shared by the session and the embedding layer.
#[derive(Clone)]
pub struct LinkHandle {
    outbox: Sender<Vec<u8>>,
    shared: Arc<LinkShared>,
}

impl LinkHandle {
    /// Queues an encoded to-radio record for transmission. Records queued
    /// while disconnected are dropped by the writer.
    pub fn send_record(&self, payload: Vec<u8>) {
        drop(self.outbox.send(payload));
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock().expect("Poisoned status lock")
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// User-initiated disconnect: suppresses the reconnect backoff and
    /// unblocks the reader at its next suspension point.
    pub fn disconnect(&self) {
        self.shared.user_disconnected.store(true, Ordering::SeqCst);
        self.shared.drop_connection();
    }

    #[inline]
    pub fn is_user_disconnected(&self) -> bool {
        self.shared.user_disconnected.load(Ordering::SeqCst)
    }
}

pub struct LinkManager {
    handle: LinkHandle,
    run_thread: Option<thread::JoinHandle<()>>,
    write_thread: Option<thread::JoinHandle<()>>,
}

impl LinkManager {
    /// Spawns the dial/read loop and the writer. Events arrive on the
    /// supplied channel in transport order.
    pub fn spawn<'a, D, L>(
        config: LinkConfig,
        dialer: D,
        events: Sender<LinkEvent>,
        log: L,
    ) -> LinkManager
    where
        D: Dialer,
        L: Into<Option<&'a logging::Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let shared = Arc::new(LinkShared {
            writer: Mutex::new(None),
            current: Mutex::new(None),
            status: Mutex::new(ConnectionStatus::Disconnected),
            user_disconnected: AtomicBool::new(false),
        });

        let (outbox_tx, outbox_rx) = mpsc::channel();

        let handle = LinkHandle {
            outbox: outbox_tx,
            shared: shared.clone(),
        };

        let run_shared = shared.clone();
        let run_log = log.new(logging::o!());
        let heartbeat = config.heartbeat_interval;
        let run_thread = thread::Builder::new()
            .name("link".into())
            .spawn(move || run_loop(config.target, dialer, run_shared, events, run_log))
            .expect("Error spawning link thread");

        let write_log = log.new(logging::o!());
        let write_thread = thread::Builder::new()
            .name("link-writer".into())
            .spawn(move || write_loop(outbox_rx, shared, heartbeat, write_log))
            .expect("Error spawning link writer thread");

        LinkManager {
            handle,
            run_thread: Some(run_thread),
            write_thread: Some(write_thread),
        }
    }

    #[inline]
    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Blocks until the link threads exit (after a user disconnect).
    pub fn join(mut self) {
        if let Some(thread) = self.run_thread.take() {
            drop(thread.join());
        }
        if let Some(thread) = self.write_thread.take() {
            drop(thread.join());
        }
    }
}

fn run_loop(
    target: String,
    mut dialer: impl Dialer,
    shared: Arc<LinkShared>,
    events: Sender<LinkEvent>,
    log: logging::Logger,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        if shared.user_disconnected.load(Ordering::SeqCst) {
            break;
        }

        shared.set_status(ConnectionStatus::Connecting);

        match dialer.dial() {
            Ok(transport) => {
                let transport = Arc::new(transport);

                let reader = match transport.reader() {
                    Ok(reader) => reader,
                    Err(err) => {
                        logging::warn!(log, "failed to split transport";
                                       "context" => "run_loop", "error" => %err);
                        continue;
                    }
                };

                match transport.writer() {
                    Ok(writer) => {
                        *shared.writer.lock().expect("Poisoned writer lock") = Some(writer)
                    }
                    Err(err) => {
                        logging::warn!(log, "failed to split transport";
                                       "context" => "run_loop", "error" => %err);
                        continue;
                    }
                }

                *shared.current.lock().expect("Poisoned transport lock") =
                    Some(transport.clone());
                shared.set_status(ConnectionStatus::Connected);
                backoff = BACKOFF_INITIAL;

                logging::info!(log, "link established"; "context" => "run_loop", "target" => %target);

                if events.send(LinkEvent::Connected).is_err() {
                    break;
                }

                read_loop(reader, &events, &log);

                // The connection is gone; tear down the writer half so
                // queued records stop flowing into a dead socket.
                *shared.writer.lock().expect("Poisoned writer lock") = None;
                shared.drop_connection();
                shared.set_status(ConnectionStatus::Disconnected);

                logging::info!(log, "link lost"; "context" => "run_loop", "target" => %target);

                if events.send(LinkEvent::Disconnected).is_err() {
                    break;
                }
            }
            Err(err) => {
                logging::warn!(log, "connect failed";
                               "context" => "run_loop",
                               "target" => %target,
                               "retry_in_secs" => backoff.as_secs(),
                               "error" => %err);
            }
        }

        if shared.user_disconnected.load(Ordering::SeqCst) {
            break;
        }

        thread::sleep(backoff);
        backoff = next_backoff(backoff);
    }

    shared.set_status(ConnectionStatus::Disconnected);
    logging::debug!(log, "link loop exited"; "context" => "run_loop");
}

/// Doubles the delay up to the cap.
#[inline]
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

fn read_loop(mut reader: Box<dyn io::Read + Send>, events: &Sender<LinkEvent>, log: &logging::Logger) {
    let mut frames = FrameReader::new(log);
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(count) => {
                frames.extend(&buf[..count]);

                while let Some(frame) = frames.next_frame() {
                    if events.send(LinkEvent::Frame(frame.to_vec())).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                logging::debug!(log, "read failed"; "context" => "read_loop", "error" => %err);
                return;
            }
        }
    }
}

fn write_loop(
    outbox: Receiver<Vec<u8>>,
    shared: Arc<LinkShared>,
    heartbeat_interval: Duration,
    log: logging::Logger,
) {
    let heartbeat = ToRadio::heartbeat().encode_to_vec();
    let mut last_activity = std::time::Instant::now();

    loop {
        if shared.user_disconnected.load(Ordering::SeqCst) {
            return;
        }

        match outbox.recv_timeout(Duration::from_secs(1)) {
            Ok(payload) => {
                if shared.write_payload(&payload) {
                    last_activity = std::time::Instant::now();
                } else {
                    logging::debug!(log, "dropped record while disconnected";
                                    "context" => "write_loop",
                                    "size" => payload.len());
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // Quiet link; nudge the gateway so it keeps the stream open.
                if last_activity.elapsed() >= heartbeat_interval && shared.write_payload(&heartbeat)
                {
                    logging::trace!(log, "heartbeat sent"; "context" => "write_loop");
                    last_activity = std::time::Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testing::{pipe, PipeTransport};
    use std::sync::mpsc::channel;

    #[test]
    fn test_dial_target_forms() {
        assert_eq!(dial_target("gw.local", 4403), "gw.local:4403");
        assert_eq!(dial_target("gw.local:1234", 4403), "gw.local:1234");
        assert_eq!(dial_target("10.0.0.7", 4403), "10.0.0.7:4403");
        assert_eq!(dial_target("10.0.0.7:4403", 4403), "10.0.0.7:4403");
    }

    #[test]
    fn test_backoff_progression() {
        let mut backoff = BACKOFF_INITIAL;
        let mut observed = Vec::new();

        for _ in 0..6 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }

        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(next_backoff(backoff).as_secs(), 30);
    }

    struct OneShotDialer {
        transport: Option<PipeTransport>,
    }

    impl Dialer for OneShotDialer {
        fn dial(&mut self) -> io::Result<Box<dyn Transport>> {
            match self.transport.take() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(io::ErrorKind::ConnectionRefused.into()),
            }
        }
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let (transport, mut remote) = pipe();
        let (events_tx, events_rx) = channel();

        let link = LinkManager::spawn(
            LinkConfig::new("test"),
            OneShotDialer {
                transport: Some(transport),
            },
            events_tx,
            None,
        );

        assert_eq!(events_rx.recv().unwrap(), LinkEvent::Connected);

        remote.send_frame(b"first");
        remote.send_frame(b"second");

        assert_eq!(
            events_rx.recv().unwrap(),
            LinkEvent::Frame(b"first".to_vec())
        );
        assert_eq!(
            events_rx.recv().unwrap(),
            LinkEvent::Frame(b"second".to_vec())
        );

        link.handle().disconnect();
        remote.close();

        assert_eq!(events_rx.recv().unwrap(), LinkEvent::Disconnected);
        link.join();
    }

    #[test]
    fn test_outbound_records_framed() {
        let (transport, mut remote) = pipe();
        let (events_tx, events_rx) = channel();

        let link = LinkManager::spawn(
            LinkConfig::new("test"),
            OneShotDialer {
                transport: Some(transport),
            },
            events_tx,
            None,
        );

        assert_eq!(events_rx.recv().unwrap(), LinkEvent::Connected);

        link.handle().send_record(b"payload".to_vec());

        assert_eq!(remote.recv_frame(), Some(b"payload".to_vec()));

        link.handle().disconnect();
        remote.close();
        link.join();
    }

    #[test]
    fn test_user_disconnect_suppresses_reconnect() {
        let (transport, mut remote) = pipe();
        let (events_tx, events_rx) = channel();

        let link = LinkManager::spawn(
            LinkConfig::new("test"),
            OneShotDialer {
                transport: Some(transport),
            },
            events_tx,
            None,
        );

        assert_eq!(events_rx.recv().unwrap(), LinkEvent::Connected);

        let handle = link.handle();
        handle.disconnect();
        remote.close();

        assert_eq!(events_rx.recv().unwrap(), LinkEvent::Disconnected);

        // The run loop must exit rather than redial.
        link.join();
        assert!(handle.is_user_disconnected());
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    }
}
