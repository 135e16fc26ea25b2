//! Virtual device server.
//!
//! Re-serves the framed gateway protocol to auxiliary clients so they do
//! not contend for the single physical link. Each accepted client gets a
//! replay of the captured inventory, then every from-radio record the
//! session emits. Client to-radio records funnel back into the session's
//! send queue.

use crate::events::FrameSink;
use crate::net::frame::{self, FrameReader};
use crate::proto;
use crate::session::RadioSession;
use ferrite::logging;
use indexmap::IndexMap;
use prost::Message;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Bounded per-client queue; a reader that falls this far behind is
/// disconnected.
pub const CLIENT_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct VirtualDeviceConfig {
    pub port: u16,
    pub allow_admin_commands: bool,
}

impl VirtualDeviceConfig {
    pub fn new(port: u16, allow_admin_commands: bool) -> VirtualDeviceConfig {
        VirtualDeviceConfig {
            port,
            allow_admin_commands,
        }
    }
}

type ClientId = usize;

struct Client {
    queue: SyncSender<Vec<u8>>,
    stream: TcpStream,
    /// The config id of the client's last want-config, echoed on refresh.
    want_config_id: Option<u32>,
}

/// Shared server surface: the session broadcasts through it, the
/// embedding layer inspects it.
pub struct VirtualDeviceHandle {
    session: Weak<RadioSession>,
    clients: Mutex<IndexMap<ClientId, Client>>,
    next_client: AtomicUsize,
    allow_admin: bool,
    stopped: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    log: logging::Logger,
}

pub struct VirtualDeviceServer {
    handle: Arc<VirtualDeviceHandle>,
}

impl VirtualDeviceServer {
    /// Binds the listener and spawns the accept loop. The returned handle
    /// is also attached to the session as its broadcast sink.
    pub fn spawn<'a, L: Into<Option<&'a logging::Logger>>>(
        config: VirtualDeviceConfig,
        session: &Arc<RadioSession>,
        log: L,
    ) -> std::io::Result<VirtualDeviceServer> {
        let server_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let local_addr = listener.local_addr()?;

        let handle = Arc::new(VirtualDeviceHandle {
            session: Arc::downgrade(session),
            clients: Mutex::new(IndexMap::new()),
            next_client: AtomicUsize::new(1),
            allow_admin: config.allow_admin_commands,
            stopped: AtomicBool::new(false),
            local_addr: Mutex::new(Some(local_addr)),
            log: server_log.new(logging::o!()),
        });

        session.attach_sink(handle.clone());

        let accept_handle = handle.clone();
        thread::Builder::new()
            .name("vdev-accept".into())
            .spawn(move || accept_loop(listener, accept_handle))
            .expect("Error spawning accept loop");

        logging::info!(server_log, "virtual device listening";
                       "context" => "spawn",
                       "addr" => %local_addr);

        Ok(VirtualDeviceServer { handle })
    }

    #[inline]
    pub fn handle(&self) -> Arc<VirtualDeviceHandle> {
        self.handle.clone()
    }

    /// Port the listener actually bound (for port-0 deployments).
    pub fn port(&self) -> u16 {
        self.handle
            .local_addr
            .lock()
            .expect("Poisoned addr lock")
            .map_or(0, |addr| addr.port())
    }

    /// Stops accepting; existing clients are disconnected.
    pub fn stop(&self) {
        self.handle.stopped.store(true, Ordering::SeqCst);

        // Unblock the accept loop with a throwaway connection.
        if let Some(addr) = *self.handle.local_addr.lock().expect("Poisoned addr lock") {
            drop(TcpStream::connect(("127.0.0.1", addr.port())));
        }

        let mut clients = self.handle.clients.lock().expect("Poisoned client lock");
        for (_, client) in clients.drain(..) {
            drop(client.stream.shutdown(Shutdown::Both));
        }
    }
}

impl VirtualDeviceHandle {
    fn enroll(&self, stream: TcpStream) -> Option<(ClientId, Receiver<Vec<u8>>)> {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = sync_channel(CLIENT_QUEUE_DEPTH);

        let registered = stream.try_clone().ok()?;

        self.clients.lock().expect("Poisoned client lock").insert(
            id,
            Client {
                queue: tx,
                stream: registered,
                want_config_id: None,
            },
        );

        logging::info!(self.log, "virtual client connected";
                       "context" => "enroll",
                       "client" => id,
                       "clients" => self.client_count());

        Some((id, rx))
    }

    fn deenroll(&self, id: ClientId) {
        let removed = self
            .clients
            .lock()
            .expect("Poisoned client lock")
            .shift_remove(&id);

        if let Some(client) = removed {
            drop(client.stream.shutdown(Shutdown::Both));

            logging::info!(self.log, "virtual client disconnected";
                           "context" => "deenroll",
                           "client" => id,
                           "clients" => self.client_count());
        }
    }

    /// Queues one record for one client, disconnecting it on overflow.
    fn enqueue(&self, id: ClientId, raw: Vec<u8>) -> bool {
        let result = {
            let clients = self.clients.lock().expect("Poisoned client lock");

            match clients.get(&id) {
                Some(client) => client.queue.try_send(raw),
                None => return false,
            }
        };

        match result {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                logging::warn!(self.log, "virtual client too slow, dropping";
                               "context" => "enqueue",
                               "client" => id);
                self.deenroll(id);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.deenroll(id);
                false
            }
        }
    }

    /// Sends the full captured inventory to one client, ending with a
    /// sentinel that echoes the client's want-config id.
    fn replay_to(&self, id: ClientId, want_config_id: u32) {
        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return,
        };

        {
            let mut clients = self.clients.lock().expect("Poisoned client lock");
            if let Some(client) = clients.get_mut(&id) {
                client.want_config_id = Some(want_config_id);
            }
        }

        let records = session.state().replay_inventory(want_config_id);

        logging::debug!(self.log, "replaying inventory";
                        "context" => "replay_to",
                        "client" => id,
                        "records" => records.len());

        for record in records {
            if !self.enqueue(id, record) {
                return;
            }
        }
    }

    fn handle_client_record(&self, id: ClientId, raw: &[u8]) {
        let record = match proto::ToRadio::decode(raw) {
            Ok(record) => record,
            Err(err) => {
                logging::debug!(self.log, "malformed client record dropped";
                                "context" => "handle_client_record",
                                "client" => id,
                                "error" => %err);
                return;
            }
        };

        if record.want_config_id != 0 {
            self.replay_to(id, record.want_config_id);
            return;
        }

        if record.disconnect {
            self.deenroll(id);
            return;
        }

        if record.heartbeat.is_some() {
            return;
        }

        let packet = match &record.packet {
            Some(packet) => packet,
            None => return,
        };

        let is_admin = packet
            .decoded
            .as_ref()
            .map_or(false, |data| data.portnum == proto::PortNum::AdminApp as i32);

        if is_admin && !self.allow_admin {
            logging::warn!(self.log, "admin record from client rejected";
                           "context" => "handle_client_record",
                           "client" => id);
            self.reject_admin(id, packet);
            return;
        }

        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return,
        };

        if let Err(err) = session.funnel_client_record(raw) {
            logging::debug!(self.log, "client record not funneled";
                            "context" => "handle_client_record",
                            "client" => id,
                            "error" => %err);
        }
    }

    /// Synthesizes a not-authorized routing reply for this client only.
    fn reject_admin(&self, id: ClientId, packet: &proto::MeshPacket) {
        let local = self
            .session
            .upgrade()
            .and_then(|session| session.state().local_node_num())
            .unwrap_or(0);

        let reply = proto::FromRadio {
            packet: Some(proto::MeshPacket {
                from: packet.to,
                to: local,
                decoded: Some(proto::Data {
                    portnum: proto::PortNum::RoutingApp as i32,
                    payload: proto::Routing {
                        error_reason: Some(proto::RoutingError::NotAuthorized as i32),
                        ..proto::Routing::default()
                    }
                    .encode_to_vec(),
                    request_id: packet.id,
                    ..proto::Data::default()
                }),
                ..proto::MeshPacket::default()
            }),
            ..proto::FromRadio::default()
        };

        self.enqueue(id, reply.encode_to_vec());
    }
}

impl FrameSink for VirtualDeviceHandle {
    fn broadcast(&self, raw: &[u8]) {
        let ids: Vec<ClientId> = self
            .clients
            .lock()
            .expect("Poisoned client lock")
            .keys()
            .copied()
            .collect();

        for id in ids {
            self.enqueue(id, raw.to_vec());
        }
    }

    fn refresh_all(&self) {
        let pending: Vec<(ClientId, u32)> = self
            .clients
            .lock()
            .expect("Poisoned client lock")
            .iter()
            .filter_map(|(&id, client)| client.want_config_id.map(|cid| (id, cid)))
            .collect();

        logging::debug!(self.log, "refreshing virtual clients";
                        "context" => "refresh_all",
                        "clients" => pending.len());

        for (id, want_config_id) in pending {
            self.replay_to(id, want_config_id);
        }
    }

    fn client_count(&self) -> usize {
        self.clients.lock().expect("Poisoned client lock").len()
    }
}

fn accept_loop(listener: TcpListener, handle: Arc<VirtualDeviceHandle>) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if handle.stopped.load(Ordering::SeqCst) {
                    return;
                }

                logging::warn!(handle.log, "accept failed";
                               "context" => "accept_loop",
                               "error" => %err);
                continue;
            }
        };

        if handle.stopped.load(Ordering::SeqCst) {
            return;
        }

        logging::debug!(handle.log, "incoming virtual client";
                        "context" => "accept_loop",
                        "peer" => %peer);

        if stream.set_nodelay(true).is_err() {
            continue;
        }

        let (id, queue_rx) = match handle.enroll(stream.try_clone().expect("Fresh stream clones")) {
            Some(enrolled) => enrolled,
            None => continue,
        };

        // One writer and one reader per client, independent of all other
        // clients.
        let writer_stream = match stream.try_clone() {
            Ok(writer_stream) => writer_stream,
            Err(_) => {
                handle.deenroll(id);
                continue;
            }
        };

        let writer_handle = handle.clone();
        thread::Builder::new()
            .name(format!("vdev-w-{}", id))
            .spawn(move || client_writer(id, writer_stream, queue_rx, writer_handle))
            .expect("Error spawning client writer");

        let reader_handle = handle.clone();
        thread::Builder::new()
            .name(format!("vdev-r-{}", id))
            .spawn(move || client_reader(id, stream, reader_handle))
            .expect("Error spawning client reader");
    }
}

fn client_writer(
    id: ClientId,
    mut stream: TcpStream,
    queue: Receiver<Vec<u8>>,
    handle: Arc<VirtualDeviceHandle>,
) {
    while let Ok(payload) = queue.recv() {
        if frame::write_frame(&mut stream, &payload)
            .and_then(|_| stream.flush())
            .is_err()
        {
            handle.deenroll(id);
            return;
        }
    }
}

fn client_reader(id: ClientId, mut stream: TcpStream, handle: Arc<VirtualDeviceHandle>) {
    let mut frames = FrameReader::new(&handle.log);
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => {
                handle.deenroll(id);
                return;
            }
            Ok(count) => {
                frames.extend(&buf[..count]);

                while let Some(frame) = frames.next_frame() {
                    let raw = frame.to_vec();
                    handle.handle_client_record(id, &raw);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        complete_capture, harness, recv_to_radio, send_from_radio, teardown, wait_for_ready, LOCAL,
    };
    use std::time::Duration;

    /// Test-side virtual client over a real socket.
    struct VClient {
        stream: TcpStream,
        frames: FrameReader,
    }

    impl VClient {
        fn connect(port: u16) -> VClient {
            let stream = TcpStream::connect(("127.0.0.1", port)).expect("Connect failed");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            VClient {
                stream,
                frames: FrameReader::new(None),
            }
        }

        fn send(&mut self, record: proto::ToRadio) {
            frame::write_frame(&mut self.stream, &record.encode_to_vec()).unwrap();
        }

        fn recv(&mut self) -> Option<proto::FromRadio> {
            let mut buf = [0u8; 4096];

            loop {
                if let Some(frame) = self.frames.next_frame() {
                    return proto::FromRadio::decode(frame).ok();
                }

                match self.stream.read(&mut buf) {
                    Ok(0) | Err(_) => return None,
                    Ok(count) => self.frames.extend(&buf[..count]),
                }
            }
        }

        /// Reads records until the config-complete sentinel, returning
        /// everything seen including it.
        fn recv_until_sentinel(&mut self) -> Vec<proto::FromRadio> {
            let mut records = Vec::new();

            loop {
                let record = self.recv().expect("Stream closed before sentinel");
                let done = record.config_complete_id != 0;
                records.push(record);

                if done {
                    return records;
                }
            }
        }
    }

    fn vdev_harness(allow_admin: bool) -> (crate::testutil::Harness, VirtualDeviceServer) {
        let mut h = harness();

        let server = VirtualDeviceServer::spawn(
            VirtualDeviceConfig::new(0, allow_admin),
            &h.session,
            None,
        )
        .expect("Bind failed");

        complete_capture(&mut h.remote);
        wait_for_ready(&h);

        (h, server)
    }

    #[test]
    fn test_replay_echoes_client_config_id() {
        let (h, server) = vdev_harness(false);

        let mut client = VClient::connect(server.port());
        client.send(proto::ToRadio::want_config(0x0BAD_CAFE));

        let records = client.recv_until_sentinel();

        // Sentinel id echoes the client's request, preceded by at least
        // the local node info, every node, every channel.
        let sentinel = records.last().unwrap();
        assert_eq!(sentinel.config_complete_id, 0x0BAD_CAFE);

        assert!(records.iter().any(|r| r
            .my_info
            .as_ref()
            .map_or(false, |info| info.my_node_num == LOCAL)));
        assert!(records.iter().any(|r| r.node_info.is_some()));
        assert!(records.iter().any(|r| r.channel.is_some()));

        server.stop();
        teardown(h);
    }

    #[test]
    fn test_funnel_and_broadcast_to_both_clients() {
        let (mut h, server) = vdev_harness(false);

        let mut client1 = VClient::connect(server.port());
        let mut client2 = VClient::connect(server.port());

        client1.send(proto::ToRadio::want_config(1));
        client1.recv_until_sentinel();
        client2.send(proto::ToRadio::want_config(2));
        client2.recv_until_sentinel();

        assert_eq!(server.handle().client_count(), 2);

        // Client 1 sends a text to channel 0 with no id of its own.
        client1.send(proto::ToRadio::mesh_packet(proto::MeshPacket {
            to: ferrite::BROADCAST_ADDR,
            channel: 0,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: b"hi from the app".to_vec(),
                ..proto::Data::default()
            }),
            ..proto::MeshPacket::default()
        }));

        // The physical link sees it with a fresh nonzero id.
        let outbound = recv_to_radio(&mut h.remote);
        let sent_packet = outbound.packet.expect("Expected funneled packet");
        assert_ne!(sent_packet.id, 0);

        // The device echoes it; both clients observe the echo.
        send_from_radio(
            &mut h.remote,
            proto::FromRadio {
                packet: Some(sent_packet.clone()),
                ..proto::FromRadio::default()
            },
        );

        for client in [&mut client1, &mut client2] {
            let echoed = client.recv().expect("Echo missing");
            assert_eq!(
                echoed.packet.as_ref().map(|p| p.id),
                Some(sent_packet.id)
            );
        }

        server.stop();
        teardown(h);
    }

    #[test]
    fn test_admin_rejected_when_disallowed() {
        let (h, server) = vdev_harness(false);

        let mut client = VClient::connect(server.port());
        client.send(proto::ToRadio::want_config(3));
        client.recv_until_sentinel();

        client.send(proto::ToRadio::mesh_packet(proto::MeshPacket {
            to: 0x99,
            id: 4242,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: proto::AdminMessage::get_device_metadata().encode_to_vec(),
                ..proto::Data::default()
            }),
            ..proto::MeshPacket::default()
        }));

        // A synthetic not-authorized routing error comes back to this
        // client only.
        let reply = client.recv().expect("Expected synthetic error");
        let packet = reply.packet.expect("Expected routing packet");
        let data = packet.decoded.expect("Expected decoded payload");

        assert_eq!(data.portnum, proto::PortNum::RoutingApp as i32);
        assert_eq!(data.request_id, 4242);

        let routing = proto::Routing::decode(&data.payload[..]).unwrap();
        assert_eq!(
            routing.error_reason,
            Some(proto::RoutingError::NotAuthorized as i32)
        );

        server.stop();
        teardown(h);
    }

    #[test]
    fn test_refresh_on_physical_reconnect_keeps_clients() {
        let (h, server) = vdev_harness(true);

        let mut client = VClient::connect(server.port());
        client.send(proto::ToRadio::want_config(7));
        client.recv_until_sentinel();

        // A physical-side refresh replays without disconnecting anyone.
        server.handle().refresh_all();

        let records = client.recv_until_sentinel();
        assert_eq!(records.last().unwrap().config_complete_id, 7);
        assert_eq!(server.handle().client_count(), 1);

        server.stop();
        teardown(h);
    }
}
