//! The authoritative mesh model.
//!
//! All mutation flows through this facade: the session applies inbound
//! records, the scheduler reads filters and writes audit entries, the
//! virtual device server replays the captured inventory. Indices are
//! guarded by fine-grained mutexes and mirrored into a durable store.

pub mod channel;
pub mod message;
pub mod node;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use channel::{validate_channel_index, ChannelEntry, CHANNEL_COUNT};
pub use message::{AckKind, DeliveryState, MessageLog, MessagePage, StoredMessage};
pub use node::{Node, NodePosition, PositionOverride};
pub use settings::Settings;
pub use store::{AuditEntry, JsonStore, MemoryStore, Snapshot, Store, StoreError};
pub use telemetry::{
    NeighborEntry, NeighborLog, RouteSegment, RouteSegmentLog, TelemetryLog, TelemetrySample,
    Traceroute, TracerouteLog,
};

use crate::proto;
use ferrite::logging;
use ferrite::time::timestamp_millis;
use ferrite::NodeNum;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use prost::Message;
use std::sync::Mutex;

const AUDIT_LOG_CAP: usize = 10_000;

lazy_static! {
    /// Public keys known to come from broken key generation. Compared
    /// verbatim against observed node keys.
    static ref LOW_ENTROPY_KEYS: Vec<Vec<u8>> = vec![
        vec![0u8; 32],
        {
            let mut key = vec![0u8; 32];
            key[0] = 1;
            key
        },
    ];
}

/// Per-kind retention windows, in days. Favorited nodes keep telemetry for
/// the extended window.
#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub messages_days: u64,
    pub telemetry_days: u64,
    pub telemetry_favorite_days: u64,
    pub traceroutes_days: u64,
    pub route_segments_days: u64,
    pub neighbor_days: u64,
}

impl Default for RetentionPolicy {
    fn default() -> RetentionPolicy {
        RetentionPolicy {
            messages_days: 30,
            telemetry_days: 7,
            telemetry_favorite_days: 30,
            traceroutes_days: 30,
            route_segments_days: 14,
            neighbor_days: 14,
        }
    }
}

impl RetentionPolicy {
    pub fn from_settings(settings: &Settings) -> RetentionPolicy {
        let default = RetentionPolicy::default();

        RetentionPolicy {
            messages_days: settings.get_u64("retention_messages_days", default.messages_days),
            telemetry_days: settings.get_u64("retention_telemetry_days", default.telemetry_days),
            telemetry_favorite_days: settings.get_u64(
                "retention_telemetry_favorite_days",
                default.telemetry_favorite_days,
            ),
            traceroutes_days: settings
                .get_u64("retention_traceroutes_days", default.traceroutes_days),
            route_segments_days: settings
                .get_u64("retention_route_segments_days", default.route_segments_days),
            neighbor_days: settings.get_u64("retention_neighbor_days", default.neighbor_days),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepStats {
    pub messages: usize,
    pub telemetry: usize,
    pub traceroutes: usize,
    pub route_segments: usize,
    pub neighbors: usize,
}

/// Device inventory captured during the config handshake, kept verbatim
/// for virtual-device replay. Refreshed on every reconnect.
#[derive(Default)]
pub struct CaptureCache {
    pub my_info: Option<proto::MyNodeInfo>,
    pub metadata: Option<proto::DeviceMetadata>,
    /// Raw config-fragment payloads in arrival order.
    pub config_frames: Vec<Vec<u8>>,
    pub module_config_frames: Vec<Vec<u8>>,
    pub file_info_frames: Vec<Vec<u8>>,
}

pub struct MeshState {
    nodes: Mutex<HashMap<NodeNum, Node>>,
    local_node: Mutex<Option<NodeNum>>,
    channels: Mutex<Vec<Option<ChannelEntry>>>,
    messages: Mutex<MessageLog>,
    telemetry: Mutex<TelemetryLog>,
    traceroutes: Mutex<TracerouteLog>,
    segments: Mutex<RouteSegmentLog>,
    neighbors: Mutex<NeighborLog>,
    settings: Mutex<Settings>,
    audit: Mutex<Vec<AuditEntry>>,
    capture: Mutex<CaptureCache>,
    mirror: Mutex<Box<dyn Store>>,
    log: logging::Logger,
}

impl MeshState {
    /// Builds the state over a mirror, hydrating from its last image.
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        mut mirror: Box<dyn Store>,
        log: L,
    ) -> Result<MeshState, StoreError> {
        let state_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let snapshot = mirror.load()?.unwrap_or_default();

        logging::debug!(state_log, "state hydrated";
                        "context" => "open",
                        "nodes" => snapshot.nodes.len(),
                        "messages" => snapshot.messages.len());

        let mut channels = snapshot.channels;
        channels.resize(CHANNEL_COUNT, None);

        Ok(MeshState {
            nodes: Mutex::new(snapshot.nodes),
            local_node: Mutex::new(snapshot.local_node),
            channels: Mutex::new(channels),
            messages: Mutex::new(snapshot.messages),
            telemetry: Mutex::new(snapshot.telemetry),
            traceroutes: Mutex::new(snapshot.traceroutes),
            segments: Mutex::new(snapshot.route_segments),
            neighbors: Mutex::new(snapshot.neighbor_info),
            settings: Mutex::new(snapshot.settings),
            audit: Mutex::new(snapshot.audit_log),
            capture: Mutex::new(CaptureCache::default()),
            mirror: Mutex::new(mirror),
            log: state_log,
        })
    }

    /// In-memory state with a volatile mirror, for tests and tools.
    pub fn ephemeral() -> MeshState {
        Self::open(Box::new(MemoryStore::new()), None).expect("Memory store cannot fail")
    }

    /// Writes the full image to the mirror.
    pub fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        self.mirror
            .lock()
            .expect("Poisoned mirror lock")
            .save(&snapshot)
    }

    fn snapshot(&self) -> Snapshot {
        let nodes = self.nodes.lock().expect("Poisoned nodes lock").clone();
        let ignored_nodes = nodes
            .values()
            .filter(|n| n.is_ignored)
            .map(|n| n.num)
            .collect();

        Snapshot {
            nodes,
            local_node: *self.local_node.lock().expect("Poisoned local lock"),
            channels: self.channels.lock().expect("Poisoned channels lock").clone(),
            messages: self.messages.lock().expect("Poisoned messages lock").clone(),
            telemetry: self.telemetry.lock().expect("Poisoned telemetry lock").clone(),
            traceroutes: self
                .traceroutes
                .lock()
                .expect("Poisoned traceroutes lock")
                .clone(),
            route_segments: self.segments.lock().expect("Poisoned segments lock").clone(),
            neighbor_info: self.neighbors.lock().expect("Poisoned neighbors lock").clone(),
            settings: self.settings.lock().expect("Poisoned settings lock").clone(),
            audit_log: self.audit.lock().expect("Poisoned audit lock").clone(),
            ignored_nodes,
        }
    }
}

// Node index.
impl MeshState {
    pub fn local_node_num(&self) -> Option<NodeNum> {
        *self.local_node.lock().expect("Poisoned local lock")
    }

    pub fn node(&self, num: NodeNum) -> Option<Node> {
        self.nodes
            .lock()
            .expect("Poisoned nodes lock")
            .get(&num)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes
            .lock()
            .expect("Poisoned nodes lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().expect("Poisoned nodes lock").len()
    }

    /// Runs a mutation against a node, creating the record on first
    /// observation.
    pub fn with_node<R, F: FnOnce(&mut Node) -> R>(&self, num: NodeNum, mutate: F) -> R {
        let mut nodes = self.nodes.lock().expect("Poisoned nodes lock");
        let node = nodes.entry(num).or_insert_with(|| Node::new(num));
        mutate(node)
    }

    /// Destroys a node record and its neighbor edges. Messages and
    /// telemetry survive for history.
    pub fn purge_node(&self, num: NodeNum) -> bool {
        let removed = self
            .nodes
            .lock()
            .expect("Poisoned nodes lock")
            .remove(&num)
            .is_some();

        if removed {
            logging::info!(self.log, "node purged"; "context" => "purge_node", "node" => num);
            self.neighbors
                .lock()
                .expect("Poisoned neighbors lock")
                .purge_node(num);
        }

        removed
    }

    pub fn set_favorite(&self, num: NodeNum, favorite: bool) {
        self.with_node(num, |node| node.is_favorite = favorite);
    }

    pub fn set_ignored(&self, num: NodeNum, ignored: bool) {
        self.with_node(num, |node| node.is_ignored = ignored);
    }

    pub fn mark_welcomed(&self, num: NodeNum) {
        self.with_node(num, |node| node.welcomed = true);
    }

    /// Marks every known node welcomed. Done once when auto-welcome is
    /// first enabled so the whole mesh is not greeted at once.
    pub fn bulk_mark_welcomed(&self) -> usize {
        let mut nodes = self.nodes.lock().expect("Poisoned nodes lock");
        let mut marked = 0;

        for node in nodes.values_mut() {
            if !node.welcomed {
                node.welcomed = true;
                marked += 1;
            }
        }

        marked
    }

    pub fn set_position_override(
        &self,
        num: NodeNum,
        over: Option<PositionOverride>,
        enabled: bool,
    ) -> crate::Result<()> {
        if let Some(over) = &over {
            if !(-90.0..=90.0).contains(&over.latitude) {
                return Err(crate::Error::validation("latitude outside [-90, 90]"));
            }
            if !(-180.0..=180.0).contains(&over.longitude) {
                return Err(crate::Error::validation("longitude outside [-180, 180]"));
            }
        }

        self.with_node(num, |node| {
            node.position_override = over;
            node.position_override_enabled = enabled;
        });

        Ok(())
    }
}

// Inbound record application.
impl MeshState {
    pub fn observe_my_info(&self, my_info: &proto::MyNodeInfo) {
        *self.local_node.lock().expect("Poisoned local lock") = Some(my_info.my_node_num);

        self.with_node(my_info.my_node_num, |node| {
            node.is_local = true;
            node.reboot_count = Some(my_info.reboot_count);
        });

        self.capture.lock().expect("Poisoned capture lock").my_info = Some(my_info.clone());

        logging::debug!(self.log, "local node identified";
                        "context" => "observe_my_info",
                        "node" => my_info.my_node_num);
    }

    pub fn observe_node_info(&self, info: &proto::NodeInfo, now_ms: u64) {
        self.with_node(info.num, |node| {
            if info.last_heard > 0 {
                node.last_heard = Some(u64::from(info.last_heard));
            }
            if info.snr != 0.0 {
                node.snr = Some(info.snr);
            }
            if let Some(hops) = info.hops_away {
                node.hops_away = Some(hops);
            }
            node.channel = Some(info.channel);
            node.is_favorite = info.is_favorite;
            node.is_ignored = info.is_ignored;

            if let Some(user) = &info.user {
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
            }
        });

        if let Some(position) = &info.position {
            self.apply_position(info.num, position, None, now_ms);
        }
    }

    /// Header-level observation of any mesh packet: freshness, link
    /// quality, hop distance.
    pub fn observe_packet_header(&self, packet: &proto::MeshPacket, now_secs: u64) {
        if packet.from == 0 {
            return;
        }

        self.with_node(packet.from, |node| {
            node.last_heard = Some(now_secs);

            if packet.rx_snr != 0.0 {
                node.snr = Some(packet.rx_snr);
            }

            if packet.hop_start > 0 && packet.hop_start >= packet.hop_limit {
                node.hops_away = Some(packet.hop_start - packet.hop_limit);
            }

            node.channel = Some(packet.channel);

            if !packet.public_key.is_empty() {
                node.public_key = packet.public_key.clone();
            }
        });
    }

    /// Applies a position fix under the arbitration law and records the
    /// coordinate telemetry series. Returns whether the fix was accepted.
    pub fn apply_position(
        &self,
        num: NodeNum,
        position: &proto::Position,
        channel: Option<u32>,
        now_ms: u64,
    ) -> bool {
        let (latitude, longitude) = match (position.latitude(), position.longitude()) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return false,
        };

        let timestamp = if position.time > 0 {
            Some(u64::from(position.time) * 1000)
        } else {
            Some(now_ms)
        };

        let fix = NodePosition {
            latitude,
            longitude,
            altitude: position.altitude,
            precision_bits: position.precision_bits,
            gps_accuracy: if position.gps_accuracy > 0 {
                Some(position.gps_accuracy)
            } else {
                None
            },
            hdop: if position.hdop > 0 {
                Some(position.hdop)
            } else {
                None
            },
            channel,
            timestamp,
        };

        let accepted = self.with_node(num, |node| node.apply_position(fix, now_ms));

        if !accepted {
            logging::debug!(self.log, "position rejected by precision arbitration";
                            "context" => "apply_position",
                            "node" => num,
                            "precision" => ?position.precision_bits);
            return false;
        }

        let sample_time = timestamp.unwrap_or(now_ms);
        self.record_sample(num, "latitude", sample_time, latitude, None, None, channel, position);
        self.record_sample(num, "longitude", sample_time, longitude, None, None, channel, position);

        if let Some(altitude) = position.altitude {
            self.record_sample(
                num,
                "altitude",
                sample_time,
                f64::from(altitude),
                Some("m"),
                None,
                channel,
                position,
            );
        }
        if let Some(speed) = position.ground_speed {
            self.record_sample(
                num,
                "groundSpeed",
                sample_time,
                f64::from(speed),
                Some("m/s"),
                None,
                channel,
                position,
            );
        }
        if let Some(track) = position.ground_track {
            self.record_sample(
                num,
                "groundTrack",
                sample_time,
                f64::from(track) * 1e-5,
                Some("deg"),
                None,
                channel,
                position,
            );
        }

        true
    }

    #[allow(clippy::too_many_arguments)]
    fn record_sample(
        &self,
        num: NodeNum,
        kind: &str,
        timestamp: u64,
        value: f64,
        unit: Option<&str>,
        packet_id: Option<u32>,
        channel: Option<u32>,
        position: &proto::Position,
    ) {
        self.telemetry
            .lock()
            .expect("Poisoned telemetry lock")
            .insert(TelemetrySample {
                node_id: ferrite::node_id(num),
                node_num: num,
                telemetry_type: kind.to_string(),
                timestamp,
                value,
                unit: unit.map(str::to_string),
                packet_id,
                channel,
                precision_bits: position.precision_bits,
                gps_accuracy: if position.gps_accuracy > 0 {
                    Some(position.gps_accuracy)
                } else {
                    None
                },
            });
    }

    /// Flattens a telemetry envelope into typed samples.
    pub fn apply_telemetry(
        &self,
        num: NodeNum,
        telemetry: &proto::Telemetry,
        packet_id: Option<u32>,
        channel: Option<u32>,
        now_ms: u64,
    ) {
        let timestamp = if telemetry.time > 0 {
            u64::from(telemetry.time) * 1000
        } else {
            now_ms
        };

        let mut samples: Vec<(&str, f64, Option<&str>)> = Vec::new();

        if let Some(device) = &telemetry.device_metrics {
            if let Some(battery) = device.battery_level {
                samples.push(("batteryLevel", f64::from(battery), Some("%")));
            }
            if let Some(voltage) = device.voltage {
                samples.push(("voltage", f64::from(voltage), Some("V")));
            }
            if let Some(util) = device.channel_utilization {
                samples.push(("channelUtilization", f64::from(util), Some("%")));
            }
            if let Some(air) = device.air_util_tx {
                samples.push(("airUtilTx", f64::from(air), Some("%")));
            }
        }

        if let Some(env) = &telemetry.environment_metrics {
            if let Some(temperature) = env.temperature {
                samples.push(("temperature", f64::from(temperature), Some("C")));
            }
            if let Some(humidity) = env.relative_humidity {
                samples.push(("relativeHumidity", f64::from(humidity), Some("%")));
            }
            if let Some(pressure) = env.barometric_pressure {
                samples.push(("barometricPressure", f64::from(pressure), Some("hPa")));
            }
        }

        if let Some(stats) = &telemetry.local_stats {
            samples.push(("numPacketsRx", f64::from(stats.num_packets_rx), None));
            samples.push(("numPacketsRxBad", f64::from(stats.num_packets_rx_bad), None));
            samples.push(("numRxDupe", f64::from(stats.num_rx_dupe), None));
            samples.push(("numPacketsTx", f64::from(stats.num_packets_tx), None));
            samples.push(("numTxDropped", f64::from(stats.num_tx_dropped), None));
            samples.push(("numTxRelay", f64::from(stats.num_tx_relay), None));
            samples.push((
                "numTxRelayCanceled",
                f64::from(stats.num_tx_relay_canceled),
                None,
            ));
        }

        let mut log = self.telemetry.lock().expect("Poisoned telemetry lock");

        for (kind, value, unit) in samples {
            log.insert(TelemetrySample {
                node_id: ferrite::node_id(num),
                node_num: num,
                telemetry_type: kind.to_string(),
                timestamp,
                value,
                unit: unit.map(str::to_string),
                packet_id,
                channel,
                precision_bits: None,
                gps_accuracy: None,
            });
        }
    }

    /// Derived position estimate from neighbor triangulation or similar
    /// external analysis.
    pub fn record_estimated_position(&self, num: NodeNum, latitude: f64, longitude: f64, now_ms: u64) {
        let mut log = self.telemetry.lock().expect("Poisoned telemetry lock");

        for (kind, value) in &[("estimated_latitude", latitude), ("estimated_longitude", longitude)] {
            log.insert(TelemetrySample {
                node_id: ferrite::node_id(num),
                node_num: num,
                telemetry_type: (*kind).to_string(),
                timestamp: now_ms,
                value: *value,
                unit: None,
                packet_id: None,
                channel: None,
                precision_bits: None,
                gps_accuracy: None,
            });
        }
    }

    /// Applies a channel announcement. Channel 0 exists from the first
    /// announcement onwards.
    pub fn apply_channel(&self, channel: &proto::Channel) {
        let entry = match ChannelEntry::from_proto(channel) {
            Some(entry) => entry,
            None => {
                logging::warn!(self.log, "discarded channel with invalid index";
                               "context" => "apply_channel",
                               "index" => channel.index);
                return;
            }
        };

        let mut channels = self.channels.lock().expect("Poisoned channels lock");

        if channels[0].is_none() {
            channels[0] = Some(ChannelEntry::disabled(0));
        }

        let index = usize::from(entry.index);
        channels[index] = Some(entry);
    }

    pub fn set_channel(&self, entry: ChannelEntry) -> crate::Result<()> {
        validate_channel_index(i32::from(entry.index))?;

        if entry.name.len() > 11 {
            return Err(crate::Error::validation("channel name exceeds 11 bytes"));
        }

        let mut channels = self.channels.lock().expect("Poisoned channels lock");

        if channels[0].is_none() {
            channels[0] = Some(ChannelEntry::disabled(0));
        }

        let index = usize::from(entry.index);
        channels[index] = Some(entry);
        Ok(())
    }

    pub fn channel(&self, index: u8) -> Option<ChannelEntry> {
        self.channels
            .lock()
            .expect("Poisoned channels lock")
            .get(usize::from(index))
            .and_then(Clone::clone)
    }

    pub fn channels(&self) -> Vec<ChannelEntry> {
        self.channels
            .lock()
            .expect("Poisoned channels lock")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn observe_neighbor_info(&self, info: &proto::NeighborInfo, now_ms: u64) {
        let mut neighbors = self.neighbors.lock().expect("Poisoned neighbors lock");

        for neighbor in &info.neighbors {
            neighbors.observe(info.node_id, neighbor.node_id, neighbor.snr, now_ms);
        }
    }

    pub fn record_traceroute(
        &self,
        from_num: NodeNum,
        to_num: NodeNum,
        route: &[NodeNum],
        now_ms: u64,
    ) -> u32 {
        let hop_count = self
            .traceroutes
            .lock()
            .expect("Poisoned traceroutes lock")
            .record(from_num, to_num, route, now_ms)
            .hop_count;

        self.segments
            .lock()
            .expect("Poisoned segments lock")
            .observe_route((from_num, to_num), route, now_ms);

        hop_count
    }

    pub fn record_unparseable_traceroute(&self, from_num: NodeNum, to_num: NodeNum, now_ms: u64) {
        self.traceroutes
            .lock()
            .expect("Poisoned traceroutes lock")
            .record_unparseable(from_num, to_num, now_ms);
    }

    pub fn latest_traceroute(&self, to_num: NodeNum) -> Option<Traceroute> {
        self.traceroutes
            .lock()
            .expect("Poisoned traceroutes lock")
            .latest_for(to_num)
            .cloned()
    }

    pub fn longest_active_segments(&self, horizon_ms: u64) -> Vec<RouteSegment> {
        self.segments
            .lock()
            .expect("Poisoned segments lock")
            .longest_active(horizon_ms)
            .into_iter()
            .cloned()
            .collect()
    }
}

// Message log.
impl MeshState {
    pub fn insert_message(&self, message: StoredMessage) -> bool {
        self.messages
            .lock()
            .expect("Poisoned messages lock")
            .insert(message)
    }

    pub fn message_by_id(&self, id: &str) -> Option<StoredMessage> {
        self.messages
            .lock()
            .expect("Poisoned messages lock")
            .get(id)
            .cloned()
    }

    pub fn message_by_request_id(&self, request_id: u32) -> Option<StoredMessage> {
        let messages = self.messages.lock().expect("Poisoned messages lock");

        messages
            .get(&request_id.to_string())
            .or_else(|| messages.find_by_request_id(request_id))
            .cloned()
    }

    pub fn messages_by_channel(&self, channel: i32, limit: usize, offset: usize) -> MessagePage {
        self.messages
            .lock()
            .expect("Poisoned messages lock")
            .by_channel(channel, limit, offset)
    }

    pub fn direct_messages(
        &self,
        a: NodeNum,
        b: NodeNum,
        limit: usize,
        offset: usize,
    ) -> MessagePage {
        self.messages
            .lock()
            .expect("Poisoned messages lock")
            .direct(a, b, limit, offset)
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().expect("Poisoned messages lock").len()
    }

    /// Applies an acknowledgement to the message the given request id
    /// belongs to. The outbound packet id is the primary match; the
    /// request-id column is the fallback.
    pub fn apply_ack(&self, request_id: u32, kind: AckKind, ack_from: NodeNum) -> bool {
        let mut messages = self.messages.lock().expect("Poisoned messages lock");

        let id = request_id.to_string();
        let message = match messages.get_mut(&id) {
            Some(message) => Some(message),
            None => messages.find_by_request_id_mut(request_id),
        };

        match message {
            Some(message) => {
                message.apply_ack(kind, ack_from);
                true
            }
            None => {
                logging::debug!(self.log, "ack for unknown request discarded";
                                "context" => "apply_ack",
                                "request_id" => request_id);
                false
            }
        }
    }
}

// Key security.
impl MeshState {
    /// Rescans all published keys: flags low-entropy keys and groups of
    /// nodes sharing one key. Stale flags are cleared first, so the scan
    /// is idempotent. Returns the number of flagged nodes.
    pub fn scan_key_security(&self) -> usize {
        let mut nodes = self.nodes.lock().expect("Poisoned nodes lock");

        let mut by_key: HashMap<Vec<u8>, Vec<NodeNum>> = HashMap::new();

        for node in nodes.values() {
            if !node.public_key.is_empty() {
                by_key
                    .entry(node.public_key.clone())
                    .or_default()
                    .push(node.num);
            }
        }

        let mut flagged = 0;

        for node in nodes.values_mut() {
            node.duplicate_key_detected = false;
            node.key_security_issue_details = None;
            node.key_is_low_entropy = false;

            if node.public_key.is_empty() {
                continue;
            }

            if LOW_ENTROPY_KEYS.iter().any(|bad| *bad == node.public_key) {
                node.key_is_low_entropy = true;
            }

            if let Some(sharers) = by_key.get(&node.public_key) {
                if sharers.len() >= 2 {
                    node.duplicate_key_detected = true;

                    let mut others: Vec<NodeNum> = sharers
                        .iter()
                        .copied()
                        .filter(|&num| num != node.num)
                        .collect();
                    others.sort_unstable();
                    node.key_security_issue_details = Some(others);
                }
            }

            if node.duplicate_key_detected || node.key_is_low_entropy {
                flagged += 1;
            }
        }

        logging::debug!(self.log, "key security scan finished";
                        "context" => "scan_key_security",
                        "flagged" => flagged);

        flagged
    }
}

// Settings, audit, retention.
impl MeshState {
    pub fn settings(&self) -> Settings {
        self.settings.lock().expect("Poisoned settings lock").clone()
    }

    pub fn with_settings<R, F: FnOnce(&mut Settings) -> R>(&self, mutate: F) -> R {
        mutate(&mut self.settings.lock().expect("Poisoned settings lock"))
    }

    pub fn append_audit(&self, entry: AuditEntry) {
        let mut audit = self.audit.lock().expect("Poisoned audit lock");

        audit.push(entry);

        if audit.len() > AUDIT_LOG_CAP {
            let excess = audit.len() - AUDIT_LOG_CAP;
            audit.drain(..excess);
        }
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().expect("Poisoned audit lock").clone()
    }

    /// Purges expired rows of every retained kind.
    pub fn retention_sweep(&self, policy: &RetentionPolicy, now_ms: u64) -> SweepStats {
        let day = 24 * 3600 * 1000;
        let cutoff = |days: u64| now_ms.saturating_sub(days * day);

        let favorites: std::collections::HashSet<NodeNum> = self
            .nodes
            .lock()
            .expect("Poisoned nodes lock")
            .values()
            .filter(|n| n.is_favorite)
            .map(|n| n.num)
            .collect();

        let stats = SweepStats {
            messages: self
                .messages
                .lock()
                .expect("Poisoned messages lock")
                .retain_since(cutoff(policy.messages_days))
                .len(),
            telemetry: self
                .telemetry
                .lock()
                .expect("Poisoned telemetry lock")
                .sweep(
                    cutoff(policy.telemetry_days),
                    cutoff(policy.telemetry_favorite_days),
                    &|num| favorites.contains(&num),
                ),
            traceroutes: self
                .traceroutes
                .lock()
                .expect("Poisoned traceroutes lock")
                .sweep(cutoff(policy.traceroutes_days)),
            route_segments: self
                .segments
                .lock()
                .expect("Poisoned segments lock")
                .sweep(cutoff(policy.route_segments_days)),
            neighbors: self
                .neighbors
                .lock()
                .expect("Poisoned neighbors lock")
                .sweep(cutoff(policy.neighbor_days)),
        };

        logging::info!(self.log, "retention sweep finished";
                       "context" => "retention_sweep",
                       "messages" => stats.messages,
                       "telemetry" => stats.telemetry,
                       "traceroutes" => stats.traceroutes);

        stats
    }
}

// Capture cache for virtual-device replay.
impl MeshState {
    pub fn begin_capture(&self) {
        let mut capture = self.capture.lock().expect("Poisoned capture lock");
        *capture = CaptureCache::default();
    }

    pub fn cache_metadata(&self, metadata: &proto::DeviceMetadata) {
        self.capture.lock().expect("Poisoned capture lock").metadata = Some(metadata.clone());
    }

    /// Metadata of the local device, as captured.
    pub fn device_metadata(&self) -> Option<proto::DeviceMetadata> {
        self.capture
            .lock()
            .expect("Poisoned capture lock")
            .metadata
            .clone()
    }

    pub fn cache_config_frame(&self, raw: &[u8]) {
        self.capture
            .lock()
            .expect("Poisoned capture lock")
            .config_frames
            .push(raw.to_vec());
    }

    pub fn cache_module_config_frame(&self, raw: &[u8]) {
        self.capture
            .lock()
            .expect("Poisoned capture lock")
            .module_config_frames
            .push(raw.to_vec());
    }

    pub fn cache_file_info_frame(&self, raw: &[u8]) {
        self.capture
            .lock()
            .expect("Poisoned capture lock")
            .file_info_frames
            .push(raw.to_vec());
    }

    /// Builds the replay inventory for one virtual client: local node
    /// info, every node, every channel, the captured config fragments,
    /// device metadata, and a sentinel echoing the client's config id.
    pub fn replay_inventory(&self, want_config_id: u32) -> Vec<Vec<u8>> {
        let mut records: Vec<Vec<u8>> = Vec::new();
        let capture = self.capture.lock().expect("Poisoned capture lock");

        if let Some(my_info) = &capture.my_info {
            records.push(
                proto::FromRadio {
                    my_info: Some(my_info.clone()),
                    ..proto::FromRadio::default()
                }
                .encode_to_vec(),
            );
        }

        for node in self.nodes() {
            records.push(
                proto::FromRadio {
                    node_info: Some(node_to_proto(&node)),
                    ..proto::FromRadio::default()
                }
                .encode_to_vec(),
            );
        }

        for entry in self.channels() {
            records.push(
                proto::FromRadio {
                    channel: Some(entry.to_proto()),
                    ..proto::FromRadio::default()
                }
                .encode_to_vec(),
            );
        }

        records.extend(capture.config_frames.iter().cloned());
        records.extend(capture.module_config_frames.iter().cloned());

        if let Some(metadata) = &capture.metadata {
            records.push(
                proto::FromRadio {
                    metadata: Some(metadata.clone()),
                    ..proto::FromRadio::default()
                }
                .encode_to_vec(),
            );
        }

        records.extend(capture.file_info_frames.iter().cloned());

        records.push(
            proto::FromRadio {
                config_complete_id: want_config_id,
                ..proto::FromRadio::default()
            }
            .encode_to_vec(),
        );

        records
    }
}

/// Projects a stored node back into the wire shape for replay.
pub fn node_to_proto(node: &Node) -> proto::NodeInfo {
    let position = node.effective_position().map(|pos| proto::Position {
        latitude_i: Some((pos.latitude / proto::COORD_SCALE) as i32),
        longitude_i: Some((pos.longitude / proto::COORD_SCALE) as i32),
        altitude: pos.altitude,
        time: pos.timestamp.map(|ms| (ms / 1000) as u32).unwrap_or(0),
        precision_bits: pos.precision_bits,
        gps_accuracy: pos.gps_accuracy.unwrap_or(0),
        hdop: pos.hdop.unwrap_or(0),
        ..proto::Position::default()
    });

    proto::NodeInfo {
        num: node.num,
        user: Some(proto::User {
            id: node.node_id(),
            long_name: node.long_name.clone().unwrap_or_default(),
            short_name: node.short_name.clone().unwrap_or_default(),
            hw_model: node.hw_model.unwrap_or(0),
            is_licensed: false,
            role: node.role.unwrap_or(0),
            public_key: node.public_key.clone(),
        }),
        position,
        snr: node.snr.unwrap_or(0.0),
        last_heard: node.last_heard.map(|secs| secs as u32).unwrap_or(0),
        device_metrics: None,
        channel: node.channel.unwrap_or(0),
        via_mqtt: false,
        hops_away: node.hops_away,
        is_favorite: node.is_favorite,
        is_ignored: node.is_ignored,
    }
}

/// Convenience used by automation and sends.
pub fn now_ms() -> u64 {
    timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::PortNum;
    use crate::DM_CHANNEL;

    fn text_message(id: u32, from: NodeNum, to: NodeNum, channel: i32) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            from_num: from,
            to_num: to,
            from_id: ferrite::node_id(from),
            to_id: ferrite::node_id(to),
            text: Some("hello".into()),
            channel,
            portnum: PortNum::TextMessageApp as i32,
            request_id: None,
            timestamp: Some(1000),
            rx_time: Some(1000),
            hop_start: None,
            hop_limit: None,
            relay_node: None,
            reply_id: None,
            emoji: false,
            via_mqtt: false,
            rx_snr: None,
            rx_rssi: None,
            ack_failed: false,
            routing_error_received: false,
            delivery_state: DeliveryState::Pending,
            want_ack: true,
            ack_from_node: None,
            created_at: 1000,
            decrypted_by: None,
        }
    }

    #[test]
    fn test_channel_zero_materializes() {
        let state = MeshState::ephemeral();

        state.apply_channel(&proto::Channel {
            index: 2,
            settings: Some(proto::ChannelSettings {
                name: "aux".into(),
                ..proto::ChannelSettings::default()
            }),
            role: proto::ChannelRole::Secondary as i32,
        });

        let channels = state.channels();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].index, 0);
        assert_eq!(channels[1].index, 2);
        assert_eq!(channels[1].name, "aux");
    }

    #[test]
    fn test_duplicate_key_scan_idempotent() {
        let state = MeshState::ephemeral();
        let shared_key = vec![7u8; 32];

        for num in &[1u32, 2, 3] {
            state.with_node(*num, |node| node.public_key = shared_key.clone());
        }
        state.with_node(4, |node| node.public_key = vec![9u8; 32]);

        let flagged = state.scan_key_security();
        assert_eq!(flagged, 3);

        for num in &[1u32, 2, 3] {
            let node = state.node(*num).unwrap();
            assert!(node.duplicate_key_detected);

            let details = node.key_security_issue_details.unwrap();
            assert_eq!(details.len(), 2);
            assert!(!details.contains(num));
        }

        assert!(!state.node(4).unwrap().duplicate_key_detected);

        // Second run is a no-op.
        let again = state.scan_key_security();
        assert_eq!(again, 3);
        assert!(state.node(1).unwrap().duplicate_key_detected);

        // Rotating one key clears its flag on the next scan.
        state.with_node(1, |node| node.public_key = vec![8u8; 32]);
        state.scan_key_security();

        assert!(!state.node(1).unwrap().duplicate_key_detected);
        let details = state
            .node(2)
            .unwrap()
            .key_security_issue_details
            .unwrap();
        assert_eq!(details, vec![3]);
    }

    #[test]
    fn test_low_entropy_key_flagged() {
        let state = MeshState::ephemeral();

        state.with_node(1, |node| node.public_key = vec![0u8; 32]);
        state.scan_key_security();

        assert!(state.node(1).unwrap().key_is_low_entropy);
        assert!(!state.node(1).unwrap().duplicate_key_detected);
    }

    #[test]
    fn test_message_idempotence_via_state() {
        let state = MeshState::ephemeral();

        assert!(state.insert_message(text_message(42, 1, 2, 0)));
        assert!(!state.insert_message(text_message(42, 1, 2, 0)));

        assert_eq!(state.message_count(), 1);
        let page = state.messages_by_channel(0, 10, 0);
        assert_eq!(page.messages.len(), 1);
    }

    #[test]
    fn test_ack_for_unknown_request_discarded() {
        let state = MeshState::ephemeral();

        assert!(!state.apply_ack(999, AckKind::Explicit, 2));
    }

    #[test]
    fn test_ack_matches_packet_id_then_request_id() {
        let state = MeshState::ephemeral();

        state.insert_message(text_message(42, 1, 2, DM_CHANNEL));

        let mut with_request = text_message(43, 1, 2, DM_CHANNEL);
        with_request.request_id = Some(4040);
        state.insert_message(with_request);

        assert!(state.apply_ack(42, AckKind::Explicit, 2));
        assert_eq!(
            state.message_by_id("42").unwrap().delivery_state,
            DeliveryState::Confirmed
        );

        assert!(state.apply_ack(4040, AckKind::Explicit, 2));
        assert_eq!(
            state.message_by_id("43").unwrap().delivery_state,
            DeliveryState::Confirmed
        );
    }

    #[test]
    fn test_observe_node_info_populates_node() {
        let state = MeshState::ephemeral();

        state.observe_node_info(
            &proto::NodeInfo {
                num: 0x1234,
                user: Some(proto::User {
                    id: "!00001234".into(),
                    long_name: "Relay West".into(),
                    short_name: "RW".into(),
                    hw_model: 9,
                    role: proto::Role::Router as i32,
                    public_key: vec![5; 32],
                    is_licensed: false,
                }),
                position: Some(proto::Position::from_degrees(47.5, 19.0, Some(200))),
                snr: 8.25,
                last_heard: 1_700_000_000,
                hops_away: Some(2),
                channel: 1,
                ..proto::NodeInfo::default()
            },
            1_700_000_000_000,
        );

        let node = state.node(0x1234).unwrap();

        assert_eq!(node.long_name.as_deref(), Some("Relay West"));
        assert_eq!(node.hops_away, Some(2));
        assert!(node.has_pkc());

        let position = node.position.unwrap();
        assert!((position.latitude - 47.5).abs() < 1e-6);

        // Coordinate telemetry series got seeded.
        let telemetry = state.telemetry.lock().unwrap();
        assert!(telemetry.latest(0x1234, "latitude").is_some());
        assert!(telemetry.latest(0x1234, "altitude").is_some());
    }

    #[test]
    fn test_retention_sweep_counts() {
        let state = MeshState::ephemeral();
        let now = 100 * 24 * 3600 * 1000u64;

        let mut old = text_message(1, 1, 2, 0);
        old.rx_time = Some(1000);
        old.timestamp = Some(1000);
        old.created_at = 1000;
        state.insert_message(old);

        let mut fresh = text_message(2, 1, 2, 0);
        fresh.rx_time = Some(now - 1000);
        fresh.created_at = now - 1000;
        state.insert_message(fresh);

        let stats = state.retention_sweep(&RetentionPolicy::default(), now);

        assert_eq!(stats.messages, 1);
        assert_eq!(state.message_count(), 1);
    }

    #[test]
    fn test_replay_inventory_shape() {
        let state = MeshState::ephemeral();

        state.observe_my_info(&proto::MyNodeInfo {
            my_node_num: 0x10,
            ..proto::MyNodeInfo::default()
        });
        state.observe_node_info(&proto::NodeInfo {
            num: 0x20,
            ..proto::NodeInfo::default()
        }, 0);
        state.apply_channel(&proto::Channel {
            index: 0,
            role: proto::ChannelRole::Primary as i32,
            ..proto::Channel::default()
        });
        state.cache_metadata(&proto::DeviceMetadata {
            firmware_version: "2.5.0".into(),
            ..proto::DeviceMetadata::default()
        });

        let records = state.replay_inventory(0xBEEF);

        let decoded: Vec<proto::FromRadio> = records
            .iter()
            .map(|raw| proto::FromRadio::decode(&raw[..]).unwrap())
            .collect();

        assert!(decoded[0].my_info.is_some());
        assert!(decoded.iter().any(|r| r.node_info.is_some()));
        assert!(decoded.iter().any(|r| r.channel.is_some()));
        assert!(decoded.iter().any(|r| r.metadata.is_some()));

        let sentinel = decoded.last().unwrap();
        assert_eq!(sentinel.config_complete_id, 0xBEEF);
    }

    #[test]
    fn test_bulk_mark_welcomed() {
        let state = MeshState::ephemeral();

        for num in 1..=5u32 {
            state.with_node(num, |_| {});
        }
        state.mark_welcomed(1);

        assert_eq!(state.bulk_mark_welcomed(), 4);
        assert_eq!(state.bulk_mark_welcomed(), 0);
    }

    #[test]
    fn test_position_override_validation() {
        let state = MeshState::ephemeral();

        let result = state.set_position_override(
            1,
            Some(PositionOverride {
                latitude: 95.0,
                longitude: 0.0,
                altitude: None,
                private: false,
            }),
            true,
        );

        assert!(matches!(result, Err(crate::Error::Validation(_))));
        // Nothing was persisted for the node.
        assert!(state.node(1).is_none());
    }

    #[test]
    fn test_persist_and_rehydrate() {
        let mut mirror = MemoryStore::new();

        {
            let state = MeshState::open(Box::new(MemoryStore::new()), None).unwrap();
            state.with_node(7, |node| node.long_name = Some("Seven".into()));
            state.insert_message(text_message(1, 7, 8, 0));
            mirror.save(&state.snapshot()).unwrap();
        }

        let state = MeshState::open(Box::new(mirror), None).unwrap();

        assert_eq!(state.node(7).unwrap().long_name.as_deref(), Some("Seven"));
        assert_eq!(state.message_count(), 1);
    }
}
