//! Typed packet schema for the gateway protocol.
//!
//! Hand-annotated from the mesh device schema. Only the messages and fields
//! the service consumes are declared; unknown fields are skipped on decode,
//! and the virtual-device replay path works from captured raw payloads, so
//! partial coverage is safe.

pub mod admin;
pub mod telemetry;

use prost::Message;
use std::convert::TryFrom;

pub use admin::{AdminMessage, ConfigType};
pub use telemetry::{DeviceMetrics, EnvironmentMetrics, LocalStats, Telemetry};

/// Scale factor between integer wire coordinates and decimal degrees.
pub const COORD_SCALE: f64 = 1e-7;

/// Records streamed by the device towards the host.
#[derive(Clone, PartialEq, Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(message, optional, tag = "2")]
    pub packet: Option<MeshPacket>,
    #[prost(message, optional, tag = "3")]
    pub my_info: Option<MyNodeInfo>,
    #[prost(message, optional, tag = "4")]
    pub node_info: Option<NodeInfo>,
    #[prost(message, optional, tag = "5")]
    pub config: Option<Config>,
    #[prost(message, optional, tag = "6")]
    pub log_record: Option<LogRecord>,
    #[prost(uint32, tag = "7")]
    pub config_complete_id: u32,
    #[prost(bool, tag = "8")]
    pub rebooted: bool,
    #[prost(message, optional, tag = "9")]
    pub module_config: Option<ModuleConfig>,
    #[prost(message, optional, tag = "10")]
    pub channel: Option<Channel>,
    #[prost(message, optional, tag = "11")]
    pub queue_status: Option<QueueStatus>,
    #[prost(message, optional, tag = "13")]
    pub metadata: Option<DeviceMetadata>,
    #[prost(message, optional, tag = "15")]
    pub file_info: Option<FileInfo>,
}

/// Records sent by the host towards the device.
#[derive(Clone, PartialEq, Message)]
pub struct ToRadio {
    #[prost(message, optional, tag = "1")]
    pub packet: Option<MeshPacket>,
    #[prost(uint32, tag = "3")]
    pub want_config_id: u32,
    #[prost(bool, tag = "4")]
    pub disconnect: bool,
    #[prost(message, optional, tag = "7")]
    pub heartbeat: Option<Heartbeat>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Heartbeat {}

#[derive(Clone, PartialEq, Message)]
pub struct MeshPacket {
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(message, optional, tag = "4")]
    pub decoded: Option<Data>,
    #[prost(bytes = "vec", tag = "5")]
    pub encrypted: Vec<u8>,
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
    #[prost(bool, tag = "10")]
    pub want_ack: bool,
    #[prost(int32, tag = "11")]
    pub priority: i32,
    #[prost(int32, tag = "12")]
    pub rx_rssi: i32,
    #[prost(bool, tag = "14")]
    pub via_mqtt: bool,
    #[prost(uint32, tag = "15")]
    pub hop_start: u32,
    #[prost(bytes = "vec", tag = "16")]
    pub public_key: Vec<u8>,
    #[prost(bool, tag = "17")]
    pub pki_encrypted: bool,
    #[prost(uint32, tag = "19")]
    pub relay_node: u32,
}

/// Reliable delivery priority for packets that carry a want-ack.
pub const PRIORITY_RELIABLE: i32 = 70;

impl MeshPacket {
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.to == ferrite::BROADCAST_ADDR
    }

    /// Portnum of the decoded payload, if the packet carries one the schema
    /// knows about.
    #[inline]
    pub fn portnum(&self) -> Option<PortNum> {
        self.decoded
            .as_ref()
            .and_then(|data| PortNum::try_from(data.portnum).ok())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
    #[prost(fixed32, tag = "8")]
    pub emoji: u32,
    #[prost(uint32, optional, tag = "9")]
    pub bitfield: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    TextMessageApp = 1,
    RemoteHardwareApp = 2,
    PositionApp = 3,
    NodeinfoApp = 4,
    RoutingApp = 5,
    AdminApp = 6,
    WaypointApp = 8,
    DetectionSensorApp = 10,
    AlertApp = 11,
    ReplyApp = 32,
    StoreForwardApp = 65,
    RangeTestApp = 66,
    TelemetryApp = 67,
    TracerouteApp = 70,
    NeighborinfoApp = 71,
    MapReportApp = 73,
}

#[derive(Clone, PartialEq, Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
    #[prost(uint32, tag = "8")]
    pub reboot_count: u32,
    #[prost(uint32, tag = "11")]
    pub min_app_version: u32,
    #[prost(bytes = "vec", tag = "12")]
    pub device_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(uint32, tag = "1")]
    pub num: u32,
    #[prost(message, optional, tag = "2")]
    pub user: Option<User>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Position>,
    #[prost(float, tag = "4")]
    pub snr: f32,
    #[prost(fixed32, tag = "5")]
    pub last_heard: u32,
    #[prost(message, optional, tag = "6")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(uint32, tag = "7")]
    pub channel: u32,
    #[prost(bool, tag = "8")]
    pub via_mqtt: bool,
    #[prost(uint32, optional, tag = "9")]
    pub hops_away: Option<u32>,
    #[prost(bool, tag = "10")]
    pub is_favorite: bool,
    #[prost(bool, tag = "11")]
    pub is_ignored: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub long_name: String,
    #[prost(string, tag = "3")]
    pub short_name: String,
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    #[prost(bool, tag = "6")]
    pub is_licensed: bool,
    #[prost(enumeration = "Role", tag = "7")]
    pub role: i32,
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum Role {
    Client = 0,
    ClientMute = 1,
    Router = 2,
    RouterClient = 3,
    Repeater = 4,
    Tracker = 5,
    Sensor = 6,
    Tak = 7,
    ClientHidden = 8,
    LostAndFound = 9,
    TakTracker = 10,
    RouterLate = 11,
}

#[derive(Clone, PartialEq, Message)]
pub struct Position {
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: Option<i32>,
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub altitude: Option<i32>,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
    #[prost(fixed32, tag = "7")]
    pub timestamp: u32,
    #[prost(uint32, tag = "12")]
    pub hdop: u32,
    #[prost(uint32, tag = "14")]
    pub gps_accuracy: u32,
    #[prost(uint32, optional, tag = "15")]
    pub ground_speed: Option<u32>,
    #[prost(uint32, optional, tag = "16")]
    pub ground_track: Option<u32>,
    #[prost(uint32, tag = "19")]
    pub sats_in_view: u32,
    #[prost(uint32, optional, tag = "23")]
    pub precision_bits: Option<u32>,
}

impl Position {
    /// Latitude in decimal degrees, if the fix carries one.
    #[inline]
    pub fn latitude(&self) -> Option<f64> {
        self.latitude_i.map(|lat| f64::from(lat) * COORD_SCALE)
    }

    /// Longitude in decimal degrees, if the fix carries one.
    #[inline]
    pub fn longitude(&self) -> Option<f64> {
        self.longitude_i.map(|lon| f64::from(lon) * COORD_SCALE)
    }

    /// Builds a fix from decimal degrees.
    pub fn from_degrees(latitude: f64, longitude: f64, altitude: Option<i32>) -> Position {
        Position {
            latitude_i: Some((latitude / COORD_SCALE) as i32),
            longitude_i: Some((longitude / COORD_SCALE) as i32),
            altitude,
            ..Position::default()
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Channel {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(message, optional, tag = "2")]
    pub settings: Option<ChannelSettings>,
    #[prost(enumeration = "ChannelRole", tag = "3")]
    pub role: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChannelSettings {
    #[prost(bytes = "vec", tag = "2")]
    pub psk: Vec<u8>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(fixed32, tag = "4")]
    pub id: u32,
    #[prost(bool, tag = "5")]
    pub uplink_enabled: bool,
    #[prost(bool, tag = "6")]
    pub downlink_enabled: bool,
    #[prost(message, optional, tag = "7")]
    pub module_settings: Option<ModuleSettings>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModuleSettings {
    #[prost(uint32, tag = "1")]
    pub position_precision: u32,
    #[prost(bool, tag = "2")]
    pub is_client_muted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ChannelRole {
    Disabled = 0,
    Primary = 1,
    Secondary = 2,
}

/// A shareable channel inventory, the payload of channel-set URLs.
#[derive(Clone, PartialEq, Message)]
pub struct ChannelSet {
    #[prost(message, repeated, tag = "1")]
    pub settings: Vec<ChannelSettings>,
    #[prost(message, optional, tag = "2")]
    pub lora_config: Option<LoRaConfig>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Config {
    #[prost(message, optional, tag = "1")]
    pub device: Option<DeviceConfig>,
    #[prost(message, optional, tag = "6")]
    pub lora: Option<LoRaConfig>,
    #[prost(message, optional, tag = "8")]
    pub security: Option<SecurityConfig>,
    #[prost(message, optional, tag = "9")]
    pub sessionkey: Option<SessionkeyConfig>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceConfig {
    #[prost(enumeration = "Role", tag = "1")]
    pub role: i32,
    #[prost(uint32, tag = "7")]
    pub node_info_broadcast_secs: u32,
    #[prost(bool, tag = "9")]
    pub is_managed: bool,
    #[prost(string, tag = "11")]
    pub tzdef: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LoRaConfig {
    #[prost(bool, tag = "1")]
    pub use_preset: bool,
    #[prost(int32, tag = "2")]
    pub modem_preset: i32,
    #[prost(uint32, tag = "3")]
    pub bandwidth: u32,
    #[prost(uint32, tag = "4")]
    pub spread_factor: u32,
    #[prost(uint32, tag = "5")]
    pub coding_rate: u32,
    #[prost(float, tag = "6")]
    pub frequency_offset: f32,
    #[prost(int32, tag = "7")]
    pub region: i32,
    #[prost(uint32, tag = "8")]
    pub hop_limit: u32,
    #[prost(bool, tag = "9")]
    pub tx_enabled: bool,
    #[prost(int32, tag = "10")]
    pub tx_power: i32,
    #[prost(uint32, tag = "11")]
    pub channel_num: u32,
    #[prost(bool, tag = "104")]
    pub ignore_mqtt: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct SecurityConfig {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub admin_key: Vec<Vec<u8>>,
    #[prost(bool, tag = "4")]
    pub is_managed: bool,
    #[prost(bool, tag = "7")]
    pub admin_channel_enabled: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct SessionkeyConfig {}

#[derive(Clone, PartialEq, Message)]
pub struct ModuleConfig {
    #[prost(message, optional, tag = "6")]
    pub telemetry: Option<TelemetryModuleConfig>,
    #[prost(message, optional, tag = "10")]
    pub neighbor_info: Option<NeighborInfoModuleConfig>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TelemetryModuleConfig {
    #[prost(uint32, tag = "1")]
    pub device_update_interval: u32,
    #[prost(uint32, tag = "2")]
    pub environment_update_interval: u32,
    #[prost(bool, tag = "3")]
    pub environment_measurement_enabled: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct NeighborInfoModuleConfig {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(uint32, tag = "2")]
    pub update_interval: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueueStatus {
    #[prost(int32, tag = "1")]
    pub res: i32,
    #[prost(uint32, tag = "2")]
    pub free: u32,
    #[prost(uint32, tag = "3")]
    pub maxlen: u32,
    #[prost(uint32, tag = "4")]
    pub mesh_packet_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct LogRecord {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(fixed32, tag = "2")]
    pub time: u32,
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(int32, tag = "4")]
    pub level: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub file_name: String,
    #[prost(uint32, tag = "2")]
    pub size_bytes: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetadata {
    #[prost(string, tag = "1")]
    pub firmware_version: String,
    #[prost(uint32, tag = "2")]
    pub device_state_version: u32,
    #[prost(bool, tag = "3")]
    pub can_shutdown: bool,
    #[prost(bool, tag = "4")]
    pub has_wifi: bool,
    #[prost(bool, tag = "5")]
    pub has_bluetooth: bool,
    #[prost(bool, tag = "6")]
    pub has_ethernet: bool,
    #[prost(enumeration = "Role", tag = "7")]
    pub role: i32,
    #[prost(uint32, tag = "8")]
    pub position_flags: u32,
    #[prost(int32, tag = "9")]
    pub hw_model: i32,
    #[prost(bool, tag = "10")]
    pub has_remote_hardware: bool,
    #[prost(bool, tag = "11")]
    pub has_pkc: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Routing {
    #[prost(message, optional, tag = "1")]
    pub route_request: Option<RouteDiscovery>,
    #[prost(message, optional, tag = "2")]
    pub route_reply: Option<RouteDiscovery>,
    #[prost(enumeration = "RoutingError", optional, tag = "3")]
    pub error_reason: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RouteDiscovery {
    #[prost(fixed32, repeated, tag = "1")]
    pub route: Vec<u32>,
    #[prost(int32, repeated, tag = "2")]
    pub snr_towards: Vec<i32>,
    #[prost(fixed32, repeated, tag = "3")]
    pub route_back: Vec<u32>,
    #[prost(int32, repeated, tag = "4")]
    pub snr_back: Vec<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum RoutingError {
    None = 0,
    NoRoute = 1,
    GotNak = 2,
    Timeout = 3,
    NoInterface = 4,
    MaxRetransmit = 5,
    NoChannel = 6,
    TooLarge = 7,
    NoResponse = 8,
    DutyCycleLimit = 9,
    BadRequest = 32,
    NotAuthorized = 33,
    PkiFailed = 34,
    PkiUnknownPubkey = 35,
    AdminBadSessionKey = 36,
    AdminPublicKeyUnauthorized = 37,
    RateLimitExceeded = 38,
}

impl RoutingError {
    /// True for refusals that a fresh admin passkey can clear.
    #[inline]
    pub fn is_admin_denial(self) -> bool {
        matches!(
            self,
            RoutingError::AdminBadSessionKey | RoutingError::NotAuthorized
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct NeighborInfo {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(uint32, tag = "2")]
    pub last_sent_by_id: u32,
    #[prost(uint32, tag = "3")]
    pub node_broadcast_interval_secs: u32,
    #[prost(message, repeated, tag = "4")]
    pub neighbors: Vec<Neighbor>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Neighbor {
    #[prost(uint32, tag = "1")]
    pub node_id: u32,
    #[prost(float, tag = "2")]
    pub snr: f32,
}

impl ToRadio {
    /// The handshake record that starts configuration capture.
    #[inline]
    pub fn want_config(config_id: u32) -> ToRadio {
        ToRadio {
            want_config_id: config_id,
            ..ToRadio::default()
        }
    }

    #[inline]
    pub fn heartbeat() -> ToRadio {
        ToRadio {
            heartbeat: Some(Heartbeat {}),
            ..ToRadio::default()
        }
    }

    #[inline]
    pub fn mesh_packet(packet: MeshPacket) -> ToRadio {
        ToRadio {
            packet: Some(packet),
            ..ToRadio::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_want_config_roundtrip() {
        let encoded = ToRadio::want_config(0xDEAD_BEEF).encode_to_vec();
        let decoded = ToRadio::decode(&encoded[..]).unwrap();

        assert_eq!(decoded.want_config_id, 0xDEAD_BEEF);
        assert!(decoded.packet.is_none());
    }

    #[test]
    fn test_unknown_fields_skipped() {
        // A FromRadio with a field the schema does not declare (tag 12,
        // varint 1) followed by config_complete_id.
        let mut raw = vec![0x60, 0x01];
        raw.extend_from_slice(
            &FromRadio {
                config_complete_id: 42,
                ..FromRadio::default()
            }
            .encode_to_vec(),
        );

        let decoded = FromRadio::decode(&raw[..]).unwrap();

        assert_eq!(decoded.config_complete_id, 42);
    }

    #[test]
    fn test_position_degrees() {
        let pos = Position::from_degrees(47.5, 19.04, Some(150));

        assert!((pos.latitude().unwrap() - 47.5).abs() < 1e-6);
        assert!((pos.longitude().unwrap() - 19.04).abs() < 1e-6);
        assert_eq!(pos.altitude, Some(150));

        let empty = Position::default();
        assert_eq!(empty.latitude(), None);
        assert_eq!(empty.longitude(), None);
    }

    #[test]
    fn test_precision_zero_distinct_from_absent() {
        let explicit = Position {
            precision_bits: Some(0),
            ..Position::default()
        };
        let encoded = explicit.encode_to_vec();
        let decoded = Position::decode(&encoded[..]).unwrap();

        assert_eq!(decoded.precision_bits, Some(0));
        assert_eq!(Position::default().precision_bits, None);
    }

    #[test]
    fn test_packet_portnum() {
        let packet = MeshPacket {
            decoded: Some(Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: b"hi".to_vec(),
                ..Data::default()
            }),
            ..MeshPacket::default()
        };

        assert_eq!(packet.portnum(), Some(PortNum::TextMessageApp));
        assert_eq!(MeshPacket::default().portnum(), None);
    }
}
