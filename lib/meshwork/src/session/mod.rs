//! The radio session: config capture, request correlation, admin passkey
//! lifecycle, send queue and ACK accounting.
//!
//! One session owns the physical link. Inbound records are applied to the
//! mesh state, matched against outstanding requests, re-broadcast to
//! virtual-device clients and mirrored into typed events for automation.

pub mod outbox;
pub mod passkey;
pub mod requests;

pub use requests::{Response, Waiter};

use crate::error::{Error, RequestKind, Result};
use crate::events::{FrameSink, MeshEvent};
use crate::net::link::{LinkEvent, LinkHandle};
use crate::proto;
use crate::state::{AckKind, DeliveryState, MeshState, StoredMessage};
use crate::DM_CHANNEL;
use ferrite::logging;
use ferrite::time::{timestamp_millis, timestamp_secs};
use ferrite::{NodeNum, BROADCAST_ADDR};
use outbox::Outbox;
use passkey::{Claim, PasskeyCache};
use prost::Message;
use rand::Rng;
use requests::RequestTable;
use std::convert::TryFrom;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// If the config-complete sentinel has not arrived this long after the
/// last useful capture record, the session goes ready anyway.
const CAPTURE_SENTINEL_GRACE: Duration = Duration::from_secs(30);

/// Handshake re-send delay when the device stays silent after want-config.
const CAPTURE_RESEND_DELAY: Duration = Duration::from_secs(7);

const DEFAULT_HOP_LIMIT: u32 = 7;

/// Longest text payload accepted for a single message.
pub const MAX_TEXT_BYTES: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Handshake,
    Capturing,
    Ready,
    Disconnected,
}

/// Outcome of a text send: the packet id, plus the ack awaiter when the
/// caller asked for reliable delivery.
pub struct TextSend {
    pub packet_id: u32,
    pub ack: Option<Waiter>,
}

struct CaptureProgress {
    started: Instant,
    last_useful: Instant,
    any_progress: bool,
    resent: bool,
}

pub struct RadioSession {
    state: Arc<MeshState>,
    link: LinkHandle,
    requests: Arc<RequestTable>,
    passkeys: PasskeyCache,
    outbox: Outbox,
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    events_tx: Mutex<Option<Sender<MeshEvent>>>,
    phase: Mutex<SessionPhase>,
    config_id: Mutex<u32>,
    capture: Mutex<CaptureProgress>,
    on_ready: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    log: logging::Logger,
}

impl RadioSession {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        state: Arc<MeshState>,
        link: LinkHandle,
        log: L,
    ) -> Arc<RadioSession> {
        let session_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let now = Instant::now();

        Arc::new(RadioSession {
            state,
            link: link.clone(),
            requests: RequestTable::new(),
            passkeys: PasskeyCache::new(),
            outbox: Outbox::new(link, &session_log),
            sink: Mutex::new(None),
            events_tx: Mutex::new(None),
            phase: Mutex::new(SessionPhase::Disconnected),
            config_id: Mutex::new(0),
            capture: Mutex::new(CaptureProgress {
                started: now,
                last_useful: now,
                any_progress: false,
                resent: false,
            }),
            on_ready: Mutex::new(None),
            log: session_log,
        })
    }

    /// Wires the virtual-device broadcast surface in.
    pub fn attach_sink(&self, sink: Arc<dyn FrameSink>) {
        *self.sink.lock().expect("Poisoned sink lock") = Some(sink);
    }

    /// Creates the typed event stream for the automation layer. One
    /// consumer only.
    pub fn subscribe_events(&self) -> Receiver<MeshEvent> {
        let (tx, rx) = mpsc::channel();
        *self.events_tx.lock().expect("Poisoned events lock") = Some(tx);
        rx
    }

    /// Registers the capture-complete callback, fired once per connect.
    pub fn set_on_ready<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        *self.on_ready.lock().expect("Poisoned callback lock") = Some(Box::new(callback));
    }

    #[inline]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("Poisoned phase lock")
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    #[inline]
    pub fn state(&self) -> &Arc<MeshState> {
        &self.state
    }

    #[inline]
    pub fn link(&self) -> &LinkHandle {
        &self.link
    }

    /// Spawns the processing loop over link events. Returns when the link
    /// manager drops its end after a user disconnect.
    pub fn run(self: &Arc<Self>, link_events: Receiver<LinkEvent>) -> thread::JoinHandle<()> {
        let session = self.clone();

        thread::Builder::new()
            .name("session".into())
            .spawn(move || loop {
                match link_events.recv_timeout(Duration::from_secs(1)) {
                    Ok(LinkEvent::Connected) => session.on_connected(),
                    Ok(LinkEvent::Frame(raw)) => session.handle_frame(&raw),
                    Ok(LinkEvent::Disconnected) => session.on_disconnected(),
                    Err(RecvTimeoutError::Timeout) => session.housekeeping(),
                    Err(RecvTimeoutError::Disconnected) => {
                        session.on_disconnected();
                        return;
                    }
                }
            })
            .expect("Error spawning session thread")
    }

    fn emit(&self, event: MeshEvent) {
        if let Some(tx) = self.events_tx.lock().expect("Poisoned events lock").as_ref() {
            drop(tx.send(event));
        }
    }

    fn on_connected(&self) {
        let config_id: u32 = rand::thread_rng().gen_range(1..=u32::MAX);

        self.state.begin_capture();
        *self.config_id.lock().expect("Poisoned config id lock") = config_id;
        *self.phase.lock().expect("Poisoned phase lock") = SessionPhase::Handshake;

        let now = Instant::now();
        *self.capture.lock().expect("Poisoned capture lock") = CaptureProgress {
            started: now,
            last_useful: now,
            any_progress: false,
            resent: false,
        };

        logging::info!(self.log, "starting config capture";
                       "context" => "on_connected",
                       "config_id" => config_id);

        self.link
            .send_record(proto::ToRadio::want_config(config_id).encode_to_vec());

        *self.phase.lock().expect("Poisoned phase lock") = SessionPhase::Capturing;
        self.emit(MeshEvent::Connected);
    }

    fn on_disconnected(&self) {
        let mut phase = self.phase.lock().expect("Poisoned phase lock");

        if *phase == SessionPhase::Disconnected {
            return;
        }

        *phase = SessionPhase::Disconnected;
        drop(phase);

        let cancelled = self.requests.fail_all_cancelled();
        self.outbox.reset();

        logging::info!(self.log, "session disconnected";
                       "context" => "on_disconnected",
                       "cancelled_requests" => cancelled);

        self.emit(MeshEvent::Disconnected);
    }

    fn housekeeping(&self) {
        self.requests.sweep(Instant::now());

        if self.phase() != SessionPhase::Capturing {
            return;
        }

        let (stalled, resend) = {
            let mut capture = self.capture.lock().expect("Poisoned capture lock");

            let stalled = capture.last_useful.elapsed() >= CAPTURE_SENTINEL_GRACE;
            let resend = !capture.any_progress
                && !capture.resent
                && capture.started.elapsed() >= CAPTURE_RESEND_DELAY;

            if resend {
                capture.resent = true;
            }

            (stalled, resend)
        };

        if resend {
            let config_id = *self.config_id.lock().expect("Poisoned config id lock");
            logging::debug!(self.log, "re-sending want-config";
                           "context" => "housekeeping",
                           "config_id" => config_id);
            self.link
                .send_record(proto::ToRadio::want_config(config_id).encode_to_vec());
        }

        if stalled {
            logging::warn!(self.log, "config-complete sentinel never arrived, going ready";
                           "context" => "housekeeping");
            self.finish_capture();
        }
    }

    /// Transition Capturing → Ready, firing the callback exactly once.
    /// All capture-derived state updates happened before this point, on
    /// this same thread.
    fn finish_capture(&self) {
        {
            let mut phase = self.phase.lock().expect("Poisoned phase lock");

            if *phase != SessionPhase::Capturing {
                return;
            }

            *phase = SessionPhase::Ready;
        }

        logging::info!(self.log, "config capture complete";
                       "context" => "finish_capture",
                       "nodes" => self.state.node_count());

        if let Some(callback) = self.on_ready.lock().expect("Poisoned callback lock").as_ref() {
            callback();
        }

        if let Some(sink) = self.sink.lock().expect("Poisoned sink lock").as_ref() {
            sink.refresh_all();
        }

        self.emit(MeshEvent::CaptureComplete);
    }

    fn mark_useful(&self) {
        let mut capture = self.capture.lock().expect("Poisoned capture lock");
        capture.last_useful = Instant::now();
        capture.any_progress = true;
    }
}

// Inbound path.
impl RadioSession {
    fn handle_frame(&self, raw: &[u8]) {
        let record = match proto::FromRadio::decode(raw) {
            Ok(record) => record,
            Err(err) => {
                logging::debug!(self.log, "dropped malformed from-radio record";
                                "context" => "handle_frame",
                                "error" => %err,
                                "size" => raw.len());
                return;
            }
        };

        let now_ms = timestamp_millis();
        let mut broadcast = true;

        if record.config_complete_id != 0 {
            // Sentinels are never fanned out; each virtual client gets its
            // own echoing its request id.
            broadcast = false;

            let ours = *self.config_id.lock().expect("Poisoned config id lock");

            if record.config_complete_id == ours {
                self.finish_capture();
            }
        }

        if let Some(my_info) = &record.my_info {
            self.state.observe_my_info(my_info);
            self.mark_useful();
        }

        if let Some(node_info) = &record.node_info {
            let is_new = self.state.node(node_info.num).is_none();
            self.state.observe_node_info(node_info, now_ms);
            self.mark_useful();
            self.emit(MeshEvent::NodeObserved {
                num: node_info.num,
                is_new,
            });
        }

        if let Some(channel) = &record.channel {
            self.state.apply_channel(channel);
            self.mark_useful();
        }

        if record.config.is_some() {
            self.state.cache_config_frame(raw);
            self.mark_useful();
        }

        if record.module_config.is_some() {
            self.state.cache_module_config_frame(raw);
            self.mark_useful();
        }

        if let Some(metadata) = &record.metadata {
            self.state.cache_metadata(metadata);
            self.mark_useful();
        }

        if record.queue_status.is_some() {
            self.mark_useful();
        }

        if record.file_info.is_some() {
            self.state.cache_file_info_frame(raw);
            self.mark_useful();
        }

        if let Some(log_record) = &record.log_record {
            logging::debug!(self.log, "device log";
                            "context" => "handle_frame",
                            "source" => %log_record.source,
                            "message" => %log_record.message);
        }

        if record.rebooted {
            logging::warn!(self.log, "device reports reboot"; "context" => "handle_frame");
        }

        if let Some(packet) = &record.packet {
            self.handle_mesh_packet(packet, now_ms);
        }

        if broadcast {
            if let Some(sink) = self.sink.lock().expect("Poisoned sink lock").as_ref() {
                sink.broadcast(raw);
            }
        }
    }

    fn handle_mesh_packet(&self, packet: &proto::MeshPacket, now_ms: u64) {
        self.state.observe_packet_header(packet, timestamp_secs());

        let data = match &packet.decoded {
            Some(data) => data,
            // Encrypted payloads still update freshness above.
            None => return,
        };

        match proto::PortNum::try_from(data.portnum) {
            Ok(proto::PortNum::TextMessageApp) => self.store_text_message(packet, data, now_ms),
            Ok(proto::PortNum::PositionApp) => self.handle_position(packet, data, now_ms),
            Ok(proto::PortNum::NodeinfoApp) => self.handle_nodeinfo(packet, data),
            Ok(proto::PortNum::TelemetryApp) => self.handle_telemetry(packet, data, now_ms),
            Ok(proto::PortNum::TracerouteApp) => self.handle_traceroute(packet, data, now_ms),
            Ok(proto::PortNum::RoutingApp) => self.handle_routing(packet, data),
            Ok(proto::PortNum::NeighborinfoApp) => self.handle_neighbor_info(packet, now_ms, data),
            Ok(proto::PortNum::AdminApp) => self.handle_admin(packet, data),
            _ => {
                logging::trace!(self.log, "unhandled portnum";
                                "context" => "handle_mesh_packet",
                                "portnum" => data.portnum);
            }
        }
    }

    fn store_text_message(&self, packet: &proto::MeshPacket, data: &proto::Data, now_ms: u64) {
        if packet.id == 0 {
            // Zero ids cannot key a message row.
            logging::debug!(self.log, "text packet without id dropped";
                            "context" => "store_text_message",
                            "from" => packet.from);
            return;
        }

        let channel = if packet.is_broadcast() {
            packet.channel as i32
        } else {
            DM_CHANNEL
        };

        let message = StoredMessage {
            id: packet.id.to_string(),
            from_num: packet.from,
            to_num: packet.to,
            from_id: ferrite::node_id(packet.from),
            to_id: ferrite::node_id(packet.to),
            text: Some(String::from_utf8_lossy(&data.payload).into_owned()),
            channel,
            portnum: data.portnum,
            request_id: if data.request_id != 0 {
                Some(data.request_id)
            } else {
                None
            },
            timestamp: if packet.rx_time > 0 {
                Some(u64::from(packet.rx_time) * 1000)
            } else {
                None
            },
            rx_time: Some(now_ms),
            hop_start: Some(packet.hop_start),
            hop_limit: Some(packet.hop_limit),
            relay_node: if packet.relay_node != 0 {
                Some(packet.relay_node)
            } else {
                None
            },
            reply_id: if data.reply_id != 0 {
                Some(data.reply_id)
            } else {
                None
            },
            emoji: data.emoji != 0,
            via_mqtt: packet.via_mqtt,
            rx_snr: if packet.rx_snr != 0.0 {
                Some(packet.rx_snr)
            } else {
                None
            },
            rx_rssi: if packet.rx_rssi != 0 {
                Some(packet.rx_rssi)
            } else {
                None
            },
            ack_failed: false,
            routing_error_received: false,
            delivery_state: DeliveryState::Pending,
            want_ack: packet.want_ack,
            ack_from_node: None,
            created_at: now_ms,
            decrypted_by: if packet.pki_encrypted {
                Some("pki".into())
            } else {
                None
            },
        };

        if self.state.insert_message(message.clone()) {
            self.emit(MeshEvent::MessageReceived(Box::new(message)));
        }
    }

    fn handle_position(&self, packet: &proto::MeshPacket, data: &proto::Data, now_ms: u64) {
        let position = match proto::Position::decode(&data.payload[..]) {
            Ok(position) => position,
            Err(err) => {
                logging::debug!(self.log, "malformed position payload";
                                "context" => "handle_position",
                                "error" => %err);
                return;
            }
        };

        let accepted =
            self.state
                .apply_position(packet.from, &position, Some(packet.channel), now_ms);

        if accepted {
            if let (Some(latitude), Some(longitude)) = (position.latitude(), position.longitude())
            {
                self.emit(MeshEvent::PositionUpdated {
                    num: packet.from,
                    latitude,
                    longitude,
                });
            }
        }

        let response = Response::Position(Box::new(position));

        if data.request_id != 0 {
            self.requests.resolve(data.request_id, response);
        } else {
            self.requests
                .resolve_by_kind(RequestKind::Position, packet.from, response);
        }
    }

    fn handle_nodeinfo(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let user = match proto::User::decode(&data.payload[..]) {
            Ok(user) => user,
            Err(err) => {
                logging::debug!(self.log, "malformed nodeinfo payload";
                                "context" => "handle_nodeinfo",
                                "error" => %err);
                return;
            }
        };

        let is_new = self.state.node(packet.from).is_none();

        self.state.with_node(packet.from, |node| {
            if !user.long_name.is_empty() {
                node.long_name = Some(user.long_name.clone());
            }
            if !user.short_name.is_empty() {
                node.short_name = Some(user.short_name.clone());
            }
            node.hw_model = Some(user.hw_model);
            node.role = Some(user.role);
            if !user.public_key.is_empty() {
                node.public_key = user.public_key.clone();
            }
        });

        let info = proto::NodeInfo {
            num: packet.from,
            user: Some(user),
            ..proto::NodeInfo::default()
        };

        let response = Response::NodeInfo(Box::new(info));

        if data.request_id != 0 {
            self.requests.resolve(data.request_id, response);
        } else {
            self.requests
                .resolve_by_kind(RequestKind::NodeInfo, packet.from, response);
        }

        self.emit(MeshEvent::NodeObserved {
            num: packet.from,
            is_new,
        });
    }

    fn handle_telemetry(&self, packet: &proto::MeshPacket, data: &proto::Data, now_ms: u64) {
        match proto::Telemetry::decode(&data.payload[..]) {
            Ok(telemetry) => {
                self.state.apply_telemetry(
                    packet.from,
                    &telemetry,
                    if packet.id != 0 { Some(packet.id) } else { None },
                    Some(packet.channel),
                    now_ms,
                );
            }
            Err(err) => {
                logging::debug!(self.log, "malformed telemetry payload";
                                "context" => "handle_telemetry",
                                "error" => %err);
            }
        }
    }

    fn handle_traceroute(&self, packet: &proto::MeshPacket, data: &proto::Data, now_ms: u64) {
        match proto::RouteDiscovery::decode(&data.payload[..]) {
            Ok(discovery) => {
                self.state
                    .record_traceroute(packet.to, packet.from, &discovery.route, now_ms);

                let response = Response::Traceroute {
                    from: packet.from,
                    route: discovery.route,
                };

                if data.request_id != 0 {
                    self.requests.resolve(data.request_id, response);
                } else {
                    self.requests
                        .resolve_by_kind(RequestKind::Traceroute, packet.from, response);
                }
            }
            Err(err) => {
                logging::debug!(self.log, "unparseable traceroute reply";
                                "context" => "handle_traceroute",
                                "error" => %err);
                self.state
                    .record_unparseable_traceroute(packet.to, packet.from, now_ms);
            }
        }
    }

    fn handle_routing(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let routing = match proto::Routing::decode(&data.payload[..]) {
            Ok(routing) => routing,
            Err(err) => {
                logging::debug!(self.log, "malformed routing payload";
                                "context" => "handle_routing",
                                "error" => %err);
                return;
            }
        };

        if data.request_id == 0 {
            logging::debug!(self.log, "routing record without request id discarded";
                            "context" => "handle_routing",
                            "from" => packet.from);
            return;
        }

        let request_id = data.request_id;
        let reason = routing
            .error_reason
            .and_then(|value| proto::RoutingError::try_from(value).ok())
            .unwrap_or(proto::RoutingError::None);

        if reason == proto::RoutingError::None {
            // Acknowledgement. Explicit when it came from the packet's
            // destination itself.
            let target = self
                .state
                .message_by_id(&request_id.to_string())
                .map(|msg| msg.to_num)
                .or_else(|| self.requests.target_of(request_id));

            let explicit = target == Some(packet.from);
            let kind = ferrite::choose!(explicit => AckKind::Explicit, AckKind::Implicit);

            self.state.apply_ack(request_id, kind, packet.from);
            self.outbox.complete(request_id);
            self.requests.resolve(
                request_id,
                Response::Ack {
                    from: packet.from,
                    explicit,
                },
            );
        } else if reason.is_admin_denial() {
            logging::debug!(self.log, "admin denied by remote";
                            "context" => "handle_routing",
                            "from" => packet.from,
                            "reason" => ?reason);

            self.passkeys.invalidate(packet.from);
            self.outbox.complete(request_id);
            self.requests.fail(request_id, Error::AdminDenied(packet.from));
        } else {
            self.state
                .apply_ack(request_id, AckKind::RoutingError, packet.from);
            self.outbox.complete(request_id);
            self.requests.resolve(
                request_id,
                Response::RoutingFailure {
                    from: packet.from,
                    reason,
                },
            );
        }
    }

    fn handle_neighbor_info(&self, packet: &proto::MeshPacket, now_ms: u64, data: &proto::Data) {
        match proto::NeighborInfo::decode(&data.payload[..]) {
            Ok(info) => self.state.observe_neighbor_info(&info, now_ms),
            Err(err) => {
                logging::debug!(self.log, "malformed neighbor info";
                                "context" => "handle_neighbor_info",
                                "from" => packet.from,
                                "error" => %err);
            }
        }
    }

    fn handle_admin(&self, packet: &proto::MeshPacket, data: &proto::Data) {
        let admin = match proto::AdminMessage::decode(&data.payload[..]) {
            Ok(admin) => admin,
            Err(err) => {
                logging::debug!(self.log, "malformed admin payload";
                                "context" => "handle_admin",
                                "error" => %err);
                return;
            }
        };

        let from = packet.from;
        let request_id = data.request_id;

        if !admin.session_passkey.is_empty() {
            self.passkeys
                .complete(from, admin.session_passkey.clone(), Instant::now());
        }

        if let Some(metadata) = &admin.get_device_metadata_response {
            self.state.with_node(from, |node| {
                node.has_remote_admin = Some(true);
                node.remote_admin_checked_at = Some(timestamp_secs());

                if !metadata.firmware_version.is_empty() {
                    node.firmware_version = Some(metadata.firmware_version.clone());
                }
            });

            let response = Response::Metadata(Box::new(metadata.clone()));

            if request_id != 0 {
                self.requests.resolve(request_id, response);
            } else {
                self.requests
                    .resolve_by_kind(RequestKind::DeviceMetadata, from, response);
            }

            return;
        }

        let heuristic_kind = if admin
            .get_config_response
            .as_ref()
            .map_or(false, |config| config.sessionkey.is_some())
        {
            RequestKind::SessionKey
        } else if admin.get_module_config_response.is_some() {
            RequestKind::ModuleConfig
        } else {
            RequestKind::Config
        };

        let response = Response::Admin(Box::new(admin));

        if request_id != 0 {
            self.requests.resolve(request_id, response);
        } else {
            self.requests.resolve_by_kind(heuristic_kind, from, response);
        }
    }
}

// Outbound path.
impl RadioSession {
    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::State("session is not ready".into()))
        }
    }

    fn next_packet_id(&self) -> u32 {
        self.requests.next_request_id()
    }

    fn local_num(&self) -> NodeNum {
        self.state.local_node_num().unwrap_or(0)
    }

    /// Sends a text message to a node or a channel, storing the outbound
    /// row in pending state.
    pub fn send_text(
        &self,
        text: &str,
        dest: Option<NodeNum>,
        channel: u8,
        want_ack: bool,
    ) -> Result<TextSend> {
        self.ensure_ready()?;

        if text.is_empty() {
            return Err(Error::validation("empty message text"));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(Error::validation(format!(
                "message exceeds {} bytes",
                MAX_TEXT_BYTES
            )));
        }
        crate::state::validate_channel_index(i32::from(channel))?;

        let packet_id = self.next_packet_id();
        let to = dest.unwrap_or(BROADCAST_ADDR);
        let now_ms = timestamp_millis();

        let message = StoredMessage {
            id: packet_id.to_string(),
            from_num: self.local_num(),
            to_num: to,
            from_id: ferrite::node_id(self.local_num()),
            to_id: ferrite::node_id(to),
            text: Some(text.to_string()),
            channel: ferrite::choose!(dest.is_some() => DM_CHANNEL, i32::from(channel)),
            portnum: proto::PortNum::TextMessageApp as i32,
            request_id: None,
            timestamp: Some(now_ms),
            rx_time: Some(now_ms),
            hop_start: None,
            hop_limit: Some(DEFAULT_HOP_LIMIT),
            relay_node: None,
            reply_id: None,
            emoji: false,
            via_mqtt: false,
            rx_snr: None,
            rx_rssi: None,
            ack_failed: false,
            routing_error_received: false,
            delivery_state: DeliveryState::Pending,
            want_ack,
            ack_from_node: None,
            created_at: now_ms,
            decrypted_by: None,
        };

        self.state.insert_message(message);

        let packet = proto::MeshPacket {
            to,
            channel: u32::from(channel),
            decoded: Some(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack,
            priority: ferrite::choose!(want_ack => proto::PRIORITY_RELIABLE, 0),
            ..proto::MeshPacket::default()
        };

        let payload = proto::ToRadio::mesh_packet(packet).encode_to_vec();

        let ack = if want_ack {
            let waiter = self
                .requests
                .register_with_id(packet_id, RequestKind::Ack, dest);
            self.outbox.send_reliable(to, packet_id, payload);
            Some(waiter)
        } else {
            self.outbox.send_unreliable(payload);
            None
        };

        logging::debug!(self.log, "text queued";
                        "context" => "send_text",
                        "packet_id" => packet_id,
                        "to" => to,
                        "want_ack" => want_ack);

        Ok(TextSend { packet_id, ack })
    }

    /// Initiates a traceroute; the waiter resolves with the observed
    /// route.
    pub fn send_traceroute(&self, dest: NodeNum) -> Result<Waiter> {
        self.ensure_ready()?;

        let packet_id = self.next_packet_id();
        let waiter =
            self.requests
                .register_with_id(packet_id, RequestKind::Traceroute, Some(dest));

        let packet = proto::MeshPacket {
            to: dest,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::TracerouteApp as i32,
                payload: proto::RouteDiscovery::default().encode_to_vec(),
                want_response: true,
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            priority: proto::PRIORITY_RELIABLE,
            ..proto::MeshPacket::default()
        };

        self.outbox
            .send_unreliable(proto::ToRadio::mesh_packet(packet).encode_to_vec());

        logging::debug!(self.log, "traceroute sent";
                        "context" => "send_traceroute",
                        "dest" => dest,
                        "packet_id" => packet_id);

        Ok(waiter)
    }

    /// Requests fresh node info from a remote, forcing a key exchange.
    pub fn request_node_info(&self, dest: NodeNum) -> Result<Waiter> {
        self.ensure_ready()?;

        let local = self.state.node(self.local_num());
        let user = proto::User {
            id: ferrite::node_id(self.local_num()),
            long_name: local
                .as_ref()
                .and_then(|n| n.long_name.clone())
                .unwrap_or_default(),
            short_name: local
                .as_ref()
                .and_then(|n| n.short_name.clone())
                .unwrap_or_default(),
            ..proto::User::default()
        };

        let packet_id = self.next_packet_id();
        let waiter = self
            .requests
            .register_with_id(packet_id, RequestKind::NodeInfo, Some(dest));

        let packet = proto::MeshPacket {
            to: dest,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::NodeinfoApp as i32,
                payload: user.encode_to_vec(),
                want_response: true,
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            ..proto::MeshPacket::default()
        };

        self.outbox
            .send_unreliable(proto::ToRadio::mesh_packet(packet).encode_to_vec());

        Ok(waiter)
    }

    /// Requests a position report from a remote.
    pub fn request_position(&self, dest: NodeNum) -> Result<Waiter> {
        self.ensure_ready()?;

        let packet_id = self.next_packet_id();
        let waiter = self
            .requests
            .register_with_id(packet_id, RequestKind::Position, Some(dest));

        let packet = proto::MeshPacket {
            to: dest,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::PositionApp as i32,
                payload: proto::Position::default().encode_to_vec(),
                want_response: true,
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            ..proto::MeshPacket::default()
        };

        self.outbox
            .send_unreliable(proto::ToRadio::mesh_packet(packet).encode_to_vec());

        Ok(waiter)
    }
}

// Admin path.
impl RadioSession {
    #[inline]
    fn is_local(&self, dest: NodeNum) -> bool {
        self.state.local_node_num() == Some(dest)
    }

    /// Obtains a passkey for a remote target, coalescing concurrent
    /// misses onto a single round trip. Local targets need none.
    pub fn ensure_passkey(&self, dest: NodeNum) -> Result<Vec<u8>> {
        if self.is_local(dest) {
            return Ok(Vec::new());
        }

        match self.passkeys.claim(dest, Instant::now()) {
            Claim::Cached(passkey) => Ok(passkey),
            Claim::Wait(shared) => shared.wait(RequestKind::SessionKey.timeout()),
            Claim::Fetch => {
                logging::debug!(self.log, "fetching session passkey";
                                "context" => "ensure_passkey",
                                "dest" => dest);

                let waiter = self.dispatch_admin(
                    dest,
                    proto::AdminMessage::get_session_key(),
                    RequestKind::SessionKey,
                    &[],
                )?;

                match waiter.wait() {
                    Ok(Response::Admin(admin)) if !admin.session_passkey.is_empty() => {
                        // The inbound path already completed the cache;
                        // completing again refreshes the stamp.
                        self.passkeys.complete(
                            dest,
                            admin.session_passkey.clone(),
                            Instant::now(),
                        );
                        Ok(admin.session_passkey)
                    }
                    Ok(_) => {
                        let error = Error::State("session key reply carried no passkey".into());
                        self.passkeys.abort(dest, Error::AdminDenied(dest));
                        Err(error)
                    }
                    Err(error) => {
                        self.passkeys.abort(dest, Error::AdminDenied(dest));
                        Err(error)
                    }
                }
            }
        }
    }

    /// Encodes and sends one admin message, registering the appropriate
    /// awaiter. Read requests await their typed response; writes await
    /// the routing ack.
    fn dispatch_admin(
        &self,
        dest: NodeNum,
        admin: proto::AdminMessage,
        kind: RequestKind,
        passkey: &[u8],
    ) -> Result<Waiter> {
        let admin = if passkey.is_empty() {
            admin
        } else {
            admin.with_passkey(passkey)
        };

        let packet_id = self.next_packet_id();
        let waiter = self
            .requests
            .register_with_id(packet_id, kind, Some(dest));

        let want_ack = kind == RequestKind::Ack;

        let packet = proto::MeshPacket {
            to: dest,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: admin.encode_to_vec(),
                want_response: !want_ack,
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack,
            priority: proto::PRIORITY_RELIABLE,
            ..proto::MeshPacket::default()
        };

        let payload = proto::ToRadio::mesh_packet(packet).encode_to_vec();

        if want_ack {
            self.outbox.send_reliable(dest, packet_id, payload);
        } else {
            self.outbox.send_unreliable(payload);
        }

        Ok(waiter)
    }

    /// Admin round trip with the passkey lifecycle: fetch or reuse the
    /// passkey, send, and on an admin denial refresh the passkey and
    /// retry exactly once.
    pub fn admin_round_trip(
        &self,
        dest: NodeNum,
        admin: proto::AdminMessage,
        kind: RequestKind,
    ) -> Result<Response> {
        self.ensure_ready()?;

        let passkey = self.ensure_passkey(dest)?;
        let waiter = self.dispatch_admin(dest, admin.clone(), kind, &passkey)?;

        match waiter.wait() {
            Err(Error::AdminDenied(node)) if !self.is_local(dest) => {
                logging::debug!(self.log, "refreshing passkey after denial";
                                "context" => "admin_round_trip",
                                "dest" => node);

                self.passkeys.invalidate(dest);
                let passkey = self.ensure_passkey(dest)?;
                let waiter = self.dispatch_admin(dest, admin, kind, &passkey)?;
                let response = waiter.wait()?;
                self.passkeys.touch(dest, Instant::now());
                Ok(response)
            }
            Ok(response) => {
                self.passkeys.touch(dest, Instant::now());
                Ok(response)
            }
            Err(error) => Err(error),
        }
    }

    /// Fire-and-forget admin write (no response expected on the wire).
    pub fn send_admin_unacked(&self, dest: NodeNum, admin: proto::AdminMessage) -> Result<u32> {
        self.ensure_ready()?;

        let passkey = self.ensure_passkey(dest)?;
        let admin = if passkey.is_empty() {
            admin
        } else {
            admin.with_passkey(&passkey)
        };

        let packet_id = self.next_packet_id();

        let packet = proto::MeshPacket {
            to: dest,
            decoded: Some(proto::Data {
                portnum: proto::PortNum::AdminApp as i32,
                payload: admin.encode_to_vec(),
                ..proto::Data::default()
            }),
            id: packet_id,
            hop_limit: DEFAULT_HOP_LIMIT,
            ..proto::MeshPacket::default()
        };

        self.outbox
            .send_unreliable(proto::ToRadio::mesh_packet(packet).encode_to_vec());

        Ok(packet_id)
    }

    /// Wraps a multi-record remote import in the edit bracket. The commit
    /// is sent on every exit path so the device never stays in edit mode.
    pub fn with_edit<R, F: FnOnce(&Self) -> Result<R>>(&self, dest: NodeNum, body: F) -> Result<R> {
        self.send_admin_unacked(dest, proto::AdminMessage::begin_edit_settings())?;

        let result = body(self);

        let commit = self.send_admin_unacked(dest, proto::AdminMessage::commit_edit_settings());

        match (result, commit) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), _) => Err(error),
        }
    }

    /// Convenience: set-time admin carrying current UTC epoch seconds.
    pub fn send_time_sync(&self, dest: NodeNum) -> Result<u32> {
        self.send_admin_unacked(dest, proto::AdminMessage::set_time(timestamp_secs() as u32))
    }

    /// Device-metadata probe used by the remote admin scanner.
    pub fn request_device_metadata(&self, dest: NodeNum) -> Result<Response> {
        self.admin_round_trip(
            dest,
            proto::AdminMessage::get_device_metadata(),
            RequestKind::DeviceMetadata,
        )
    }
}

/// Outcome envelope for admin conveniences: a feature the device firmware
/// pre-dates is reported as skipped, never as a failure.
#[derive(Debug, PartialEq, Eq)]
pub enum AdminOutcome {
    Applied,
    Skipped { reason: &'static str },
}

/// Leading `major.minor` of a firmware version string.
fn parse_firmware(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok()?;

    Some((major, minor))
}

// Firmware-gated nodedb conveniences.
impl RadioSession {
    const FAVORITE_MIN_FIRMWARE: (u32, u32) = (2, 1);
    const IGNORED_MIN_FIRMWARE: (u32, u32) = (2, 3);

    /// True when the gateway firmware is at least the given version, or
    /// its version is unknown.
    fn local_firmware_at_least(&self, min: (u32, u32)) -> bool {
        match self.state.device_metadata() {
            Some(metadata) => match parse_firmware(&metadata.firmware_version) {
                Some(version) => version >= min,
                None => true,
            },
            None => true,
        }
    }

    /// Marks a node as favorite in the gateway nodedb.
    pub fn set_favorite_node(&self, num: NodeNum, favorite: bool) -> Result<AdminOutcome> {
        self.ensure_ready()?;

        if !self.local_firmware_at_least(Self::FAVORITE_MIN_FIRMWARE) {
            return Ok(AdminOutcome::Skipped {
                reason: "favorite nodes need firmware 2.1",
            });
        }

        let admin = ferrite::choose!(
            favorite => proto::AdminMessage::set_favorite_node(num),
            proto::AdminMessage::remove_favorite_node(num)
        );

        self.send_admin_unacked(self.local_num(), admin)?;
        self.state.set_favorite(num, favorite);

        Ok(AdminOutcome::Applied)
    }

    /// Marks a node as ignored in the gateway nodedb.
    pub fn set_ignored_node(&self, num: NodeNum, ignored: bool) -> Result<AdminOutcome> {
        self.ensure_ready()?;

        if !self.local_firmware_at_least(Self::IGNORED_MIN_FIRMWARE) {
            return Ok(AdminOutcome::Skipped {
                reason: "ignored nodes need firmware 2.3",
            });
        }

        let admin = ferrite::choose!(
            ignored => proto::AdminMessage::set_ignored_node(num),
            proto::AdminMessage::remove_ignored_node(num)
        );

        self.send_admin_unacked(self.local_num(), admin)?;
        self.state.set_ignored(num, ignored);

        Ok(AdminOutcome::Applied)
    }
}

// Virtual-device funnel.
impl RadioSession {
    /// Routes a client-originated to-radio record onto the physical send
    /// queue. Packets without an id get a fresh one assigned (the id is
    /// returned). Want-config and heartbeat records are not for the
    /// physical link and are ignored here.
    pub fn funnel_client_record(&self, raw: &[u8]) -> Result<Option<u32>> {
        let record = proto::ToRadio::decode(raw)?;

        let mut packet = match record.packet {
            Some(packet) => packet,
            None => return Ok(None),
        };

        if packet.id == 0 {
            packet.id = self.next_packet_id();
        }

        let packet_id = packet.id;

        // Client-sent texts appear in the message log like our own.
        if let Some(data) = &packet.decoded {
            if data.portnum == proto::PortNum::TextMessageApp as i32 {
                let now_ms = timestamp_millis();

                self.state.insert_message(StoredMessage {
                    id: packet_id.to_string(),
                    from_num: self.local_num(),
                    to_num: packet.to,
                    from_id: ferrite::node_id(self.local_num()),
                    to_id: ferrite::node_id(packet.to),
                    text: Some(String::from_utf8_lossy(&data.payload).into_owned()),
                    channel: ferrite::choose!(
                        packet.to == BROADCAST_ADDR => packet.channel as i32,
                        DM_CHANNEL
                    ),
                    portnum: data.portnum,
                    request_id: None,
                    timestamp: Some(now_ms),
                    rx_time: Some(now_ms),
                    hop_start: None,
                    hop_limit: Some(packet.hop_limit),
                    relay_node: None,
                    reply_id: None,
                    emoji: false,
                    via_mqtt: false,
                    rx_snr: None,
                    rx_rssi: None,
                    ack_failed: false,
                    routing_error_received: false,
                    delivery_state: DeliveryState::Pending,
                    want_ack: packet.want_ack,
                    ack_from_node: None,
                    created_at: now_ms,
                    decrypted_by: None,
                });
            }
        }

        let want_ack = packet.want_ack;
        let dest = packet.to;
        let payload = proto::ToRadio::mesh_packet(packet).encode_to_vec();

        if want_ack {
            self.outbox.send_reliable(dest, packet_id, payload);
        } else {
            self.outbox.send_unreliable(payload);
        }

        logging::debug!(self.log, "client record funneled";
                        "context" => "funnel_client_record",
                        "packet_id" => packet_id,
                        "dest" => dest);

        Ok(Some(packet_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        complete_capture, harness, recv_to_radio, send_from_radio, teardown, wait_for_ready, LOCAL,
    };
    use std::sync::atomic::Ordering;

    #[test]
    fn test_capture_then_ready() {
        let mut harness = harness();

        let config_id = complete_capture(&mut harness.remote);
        assert_ne!(config_id, 0);

        wait_for_ready(&harness);

        // Ready fired exactly once; state holds one node and one channel.
        assert!(harness.session.is_ready());
        assert_eq!(harness.ready_count.load(Ordering::SeqCst), 1);
        assert_eq!(harness.session.state().node_count(), 1);
        assert_eq!(harness.session.state().channels().len(), 1);
        assert_eq!(harness.session.state().local_node_num(), Some(LOCAL));
        assert_eq!(
            harness.session.state().node(LOCAL).unwrap().long_name.as_deref(),
            Some("GW")
        );

        teardown(harness);
    }

    #[test]
    fn test_inbound_text_stored_and_emitted() {
        let mut harness = harness();
        complete_capture(&mut harness.remote);
        wait_for_ready(&harness);

        send_from_radio(
            &mut harness.remote,
            proto::FromRadio {
                packet: Some(proto::MeshPacket {
                    from: 0xAA,
                    to: LOCAL,
                    id: 777,
                    decoded: Some(proto::Data {
                        portnum: proto::PortNum::TextMessageApp as i32,
                        payload: b"hello gateway".to_vec(),
                        ..proto::Data::default()
                    }),
                    ..proto::MeshPacket::default()
                }),
                ..proto::FromRadio::default()
            },
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let message = loop {
            assert!(Instant::now() < deadline, "Message event never arrived");

            match harness.events.recv_timeout(Duration::from_millis(200)) {
                Ok(MeshEvent::MessageReceived(message)) => break message,
                _ => continue,
            }
        };

        assert_eq!(message.text.as_deref(), Some("hello gateway"));
        // Addressed to us: stored as a DM regardless of channel.
        assert_eq!(message.channel, DM_CHANNEL);
        assert!(harness.session.state().message_by_id("777").is_some());

        teardown(harness);
    }

    #[test]
    fn test_zero_packet_id_dropped() {
        let mut harness = harness();
        complete_capture(&mut harness.remote);
        wait_for_ready(&harness);

        send_from_radio(
            &mut harness.remote,
            proto::FromRadio {
                packet: Some(proto::MeshPacket {
                    from: 0xAA,
                    to: LOCAL,
                    id: 0,
                    decoded: Some(proto::Data {
                        portnum: proto::PortNum::TextMessageApp as i32,
                        payload: b"ghost".to_vec(),
                        ..proto::Data::default()
                    }),
                    ..proto::MeshPacket::default()
                }),
                ..proto::FromRadio::default()
            },
        );

        // Give the pipeline a moment, then confirm nothing was stored.
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(harness.session.state().message_count(), 0);

        teardown(harness);
    }

    #[test]
    fn test_admin_retry_on_stale_passkey() {
        let mut harness = harness();
        complete_capture(&mut harness.remote);
        wait_for_ready(&harness);

        const REMOTE: NodeNum = 0x42;

        // A cached passkey the remote will refuse.
        harness
            .session
            .passkeys
            .complete(REMOTE, vec![9, 9], Instant::now());

        let caller = {
            let session = harness.session.clone();
            std::thread::spawn(move || {
                session.admin_round_trip(
                    REMOTE,
                    proto::AdminMessage::set_owner(proto::User {
                        long_name: "Renamed".into(),
                        ..proto::User::default()
                    }),
                    RequestKind::Ack,
                )
            })
        };

        // First attempt arrives with the stale passkey.
        let first = recv_to_radio(&mut harness.remote);
        let first_packet = first.packet.expect("Expected admin packet");
        let first_admin = proto::AdminMessage::decode(
            &first_packet.decoded.as_ref().unwrap().payload[..],
        )
        .unwrap();
        assert_eq!(first_admin.session_passkey, vec![9, 9]);
        assert!(first_admin.set_owner.is_some());

        // Refuse it.
        send_from_radio(
            &mut harness.remote,
            proto::FromRadio {
                packet: Some(proto::MeshPacket {
                    from: REMOTE,
                    to: LOCAL,
                    id: 1,
                    decoded: Some(proto::Data {
                        portnum: proto::PortNum::RoutingApp as i32,
                        payload: proto::Routing {
                            error_reason: Some(proto::RoutingError::AdminBadSessionKey as i32),
                            ..proto::Routing::default()
                        }
                        .encode_to_vec(),
                        request_id: first_packet.id,
                        ..proto::Data::default()
                    }),
                    ..proto::MeshPacket::default()
                }),
                ..proto::FromRadio::default()
            },
        );

        // The session transparently fetches a fresh passkey.
        let fetch = recv_to_radio(&mut harness.remote);
        let fetch_packet = fetch.packet.expect("Expected passkey fetch");
        let fetch_admin = proto::AdminMessage::decode(
            &fetch_packet.decoded.as_ref().unwrap().payload[..],
        )
        .unwrap();
        assert_eq!(
            fetch_admin.get_config_request,
            Some(proto::ConfigType::SessionkeyConfig as i32)
        );

        send_from_radio(
            &mut harness.remote,
            proto::FromRadio {
                packet: Some(proto::MeshPacket {
                    from: REMOTE,
                    to: LOCAL,
                    id: 2,
                    decoded: Some(proto::Data {
                        portnum: proto::PortNum::AdminApp as i32,
                        payload: proto::AdminMessage {
                            get_config_response: Some(proto::Config {
                                sessionkey: Some(proto::SessionkeyConfig {}),
                                ..proto::Config::default()
                            }),
                            session_passkey: vec![7, 7, 7],
                            ..proto::AdminMessage::default()
                        }
                        .encode_to_vec(),
                        request_id: fetch_packet.id,
                        ..proto::Data::default()
                    }),
                    ..proto::MeshPacket::default()
                }),
                ..proto::FromRadio::default()
            },
        );

        // The retry carries the fresh passkey; acknowledge it.
        let retry = recv_to_radio(&mut harness.remote);
        let retry_packet = retry.packet.expect("Expected retried admin packet");
        let retry_admin = proto::AdminMessage::decode(
            &retry_packet.decoded.as_ref().unwrap().payload[..],
        )
        .unwrap();
        assert_eq!(retry_admin.session_passkey, vec![7, 7, 7]);
        assert!(retry_admin.set_owner.is_some());

        send_from_radio(
            &mut harness.remote,
            proto::FromRadio {
                packet: Some(proto::MeshPacket {
                    from: REMOTE,
                    to: LOCAL,
                    id: 3,
                    decoded: Some(proto::Data {
                        portnum: proto::PortNum::RoutingApp as i32,
                        payload: proto::Routing::default().encode_to_vec(),
                        request_id: retry_packet.id,
                        ..proto::Data::default()
                    }),
                    ..proto::MeshPacket::default()
                }),
                ..proto::FromRadio::default()
            },
        );

        // The caller observes a single success.
        match caller.join().unwrap() {
            Ok(Response::Ack { from, explicit }) => {
                assert_eq!(from, REMOTE);
                assert!(explicit);
            }
            other => panic!("Unexpected outcome {:?}", other.map(|_| ())),
        }

        teardown(harness);
    }

    #[test]
    fn test_parse_firmware_versions() {
        assert_eq!(parse_firmware("2.3.4.abc123"), Some((2, 3)));
        assert_eq!(parse_firmware("2.1"), Some((2, 1)));
        assert_eq!(parse_firmware("garbage"), None);
    }

    #[test]
    fn test_old_firmware_skips_favorite() {
        let mut harness = harness();
        complete_capture(&mut harness.remote);
        wait_for_ready(&harness);

        harness.session.state().cache_metadata(&proto::DeviceMetadata {
            firmware_version: "1.2.0".into(),
            ..proto::DeviceMetadata::default()
        });

        // Skipped outcome, not an error; nothing marked locally.
        let outcome = harness.session.set_favorite_node(0x55, true).unwrap();
        assert!(matches!(outcome, AdminOutcome::Skipped { .. }));
        assert!(harness.session.state().node(0x55).is_none());

        // Recent firmware applies and mirrors the flag.
        harness.session.state().cache_metadata(&proto::DeviceMetadata {
            firmware_version: "2.5.1".into(),
            ..proto::DeviceMetadata::default()
        });

        let outcome = harness.session.set_favorite_node(0x55, true).unwrap();
        assert_eq!(outcome, AdminOutcome::Applied);
        assert!(harness.session.state().node(0x55).unwrap().is_favorite);

        teardown(harness);
    }

    #[test]
    fn test_disconnect_cancels_awaiters() {
        let mut harness = harness();
        complete_capture(&mut harness.remote);
        wait_for_ready(&harness);

        let waiter = harness.session.send_traceroute(0x99).unwrap();

        // Drop the link; the outstanding traceroute fails Cancelled.
        harness.remote.close();

        match waiter.wait_for(Duration::from_secs(5)) {
            Err(Error::Cancelled) => {}
            other => panic!("Unexpected outcome {:?}", other.map(|_| ())),
        }

        assert_eq!(harness.session.phase(), SessionPhase::Disconnected);

        harness.link.handle().disconnect();
        teardown(harness);
    }
}
