use prost::Message;

/// Telemetry envelope carried on the telemetry portnum.
#[derive(Clone, PartialEq, Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(message, optional, tag = "2")]
    pub device_metrics: Option<DeviceMetrics>,
    #[prost(message, optional, tag = "3")]
    pub environment_metrics: Option<EnvironmentMetrics>,
    #[prost(message, optional, tag = "6")]
    pub local_stats: Option<LocalStats>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceMetrics {
    #[prost(uint32, optional, tag = "1")]
    pub battery_level: Option<u32>,
    #[prost(float, optional, tag = "2")]
    pub voltage: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub channel_utilization: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub air_util_tx: Option<f32>,
    #[prost(uint32, optional, tag = "5")]
    pub uptime_seconds: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EnvironmentMetrics {
    #[prost(float, optional, tag = "1")]
    pub temperature: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub relative_humidity: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub barometric_pressure: Option<f32>,
}

/// Aggregate radio statistics reported by the local node.
#[derive(Clone, PartialEq, Message)]
pub struct LocalStats {
    #[prost(uint32, tag = "1")]
    pub uptime_seconds: u32,
    #[prost(float, tag = "2")]
    pub channel_utilization: f32,
    #[prost(float, tag = "3")]
    pub air_util_tx: f32,
    #[prost(uint32, tag = "4")]
    pub num_packets_tx: u32,
    #[prost(uint32, tag = "5")]
    pub num_packets_rx: u32,
    #[prost(uint32, tag = "6")]
    pub num_packets_rx_bad: u32,
    #[prost(uint32, tag = "7")]
    pub num_online_nodes: u32,
    #[prost(uint32, tag = "8")]
    pub num_total_nodes: u32,
    #[prost(uint32, tag = "9")]
    pub num_rx_dupe: u32,
    #[prost(uint32, tag = "10")]
    pub num_tx_relay: u32,
    #[prost(uint32, tag = "11")]
    pub num_tx_relay_canceled: u32,
    #[prost(uint32, tag = "14")]
    pub num_tx_dropped: u32,
}
