//! Telemetry samples, traceroutes, route segments and neighbor info.

use ferrite::NodeNum;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub node_id: String,
    pub node_num: NodeNum,
    pub telemetry_type: String,
    /// Sample time, unix milliseconds.
    pub timestamp: u64,
    pub value: f64,
    pub unit: Option<String>,
    pub packet_id: Option<u32>,
    pub channel: Option<u32>,
    pub precision_bits: Option<u32>,
    pub gps_accuracy: Option<u32>,
}

/// At most one sample per `(node, type, timestamp)` triple.
///
/// Persisted as a flat sample list; the key map is rebuilt on load.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TelemetrySample>", into = "Vec<TelemetrySample>")]
pub struct TelemetryLog {
    samples: HashMap<(NodeNum, String, u64), TelemetrySample>,
}

impl From<Vec<TelemetrySample>> for TelemetryLog {
    fn from(samples: Vec<TelemetrySample>) -> TelemetryLog {
        let mut log = TelemetryLog::new();

        for sample in samples {
            log.insert(sample);
        }

        log
    }
}

impl From<TelemetryLog> for Vec<TelemetrySample> {
    fn from(log: TelemetryLog) -> Vec<TelemetrySample> {
        log.samples.into_values().collect()
    }
}

impl TelemetryLog {
    pub fn new() -> TelemetryLog {
        TelemetryLog {
            samples: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Idempotent insert keyed by the uniqueness triple.
    pub fn insert(&mut self, sample: TelemetrySample) -> bool {
        let key = (
            sample.node_num,
            sample.telemetry_type.clone(),
            sample.timestamp,
        );

        if self.samples.contains_key(&key) {
            return false;
        }

        self.samples.insert(key, sample);
        true
    }

    /// Samples of one type for one node, oldest first.
    pub fn series(&self, node_num: NodeNum, telemetry_type: &str) -> Vec<&TelemetrySample> {
        let mut series: Vec<&TelemetrySample> = self
            .samples
            .values()
            .filter(|s| s.node_num == node_num && s.telemetry_type == telemetry_type)
            .collect();

        series.sort_by_key(|s| s.timestamp);
        series
    }

    pub fn latest(&self, node_num: NodeNum, telemetry_type: &str) -> Option<&TelemetrySample> {
        self.samples
            .values()
            .filter(|s| s.node_num == node_num && s.telemetry_type == telemetry_type)
            .max_by_key(|s| s.timestamp)
    }

    /// Removes samples older than the cutoff; favorited nodes get the
    /// extended cutoff. Returns the number removed.
    pub fn sweep(&mut self, cutoff_ms: u64, favorite_cutoff_ms: u64, is_favorite: &dyn Fn(NodeNum) -> bool) -> usize {
        let before = self.samples.len();

        self.samples.retain(|_, sample| {
            let cutoff = if is_favorite(sample.node_num) {
                favorite_cutoff_ms
            } else {
                cutoff_ms
            };

            sample.timestamp >= cutoff
        });

        before - self.samples.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.samples.values()
    }
}

/// Hop count recorded when a traceroute payload cannot be parsed.
pub const HOPS_UNPARSEABLE: u32 = 999;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Traceroute {
    pub id: u64,
    pub from_num: NodeNum,
    pub to_num: NodeNum,
    /// Unix milliseconds.
    pub timestamp: u64,
    /// The route as a JSON array of node numbers.
    pub route: String,
    pub hop_count: u32,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TracerouteLog {
    next_id: u64,
    entries: Vec<Traceroute>,
}

impl TracerouteLog {
    pub fn new() -> TracerouteLog {
        TracerouteLog {
            next_id: 1,
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Records a completed traceroute; the hop count derives from the route
    /// length, or the unparseable sentinel.
    pub fn record(&mut self, from_num: NodeNum, to_num: NodeNum, route: &[NodeNum], now_ms: u64) -> &Traceroute {
        let entry = Traceroute {
            id: self.next_id,
            from_num,
            to_num,
            timestamp: now_ms,
            route: serde_json::to_string(route).unwrap_or_else(|_| "[]".into()),
            hop_count: route.len() as u32,
        };

        self.next_id += 1;
        self.entries.push(entry);
        self.entries.last().expect("Entry just pushed")
    }

    /// Records a traceroute whose reply payload could not be decoded.
    pub fn record_unparseable(&mut self, from_num: NodeNum, to_num: NodeNum, now_ms: u64) {
        let entry = Traceroute {
            id: self.next_id,
            from_num,
            to_num,
            timestamp: now_ms,
            route: "[]".into(),
            hop_count: HOPS_UNPARSEABLE,
        };

        self.next_id += 1;
        self.entries.push(entry);
    }

    pub fn latest_for(&self, to_num: NodeNum) -> Option<&Traceroute> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.to_num == to_num)
    }

    pub fn sweep(&mut self, cutoff_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp >= cutoff_ms);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Traceroute> {
        self.entries.iter()
    }
}

/// Directed link observed inside a route, for operational display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteSegment {
    pub from_num: NodeNum,
    pub to_num: NodeNum,
    /// Unix milliseconds.
    pub last_seen: u64,
    pub hops_observed: u32,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<RouteSegment>", into = "Vec<RouteSegment>")]
pub struct RouteSegmentLog {
    segments: HashMap<(NodeNum, NodeNum), RouteSegment>,
}

impl From<Vec<RouteSegment>> for RouteSegmentLog {
    fn from(segments: Vec<RouteSegment>) -> RouteSegmentLog {
        let mut log = RouteSegmentLog::new();

        for segment in segments {
            log.segments
                .insert((segment.from_num, segment.to_num), segment);
        }

        log
    }
}

impl From<RouteSegmentLog> for Vec<RouteSegment> {
    fn from(log: RouteSegmentLog) -> Vec<RouteSegment> {
        log.segments.into_values().collect()
    }
}

impl RouteSegmentLog {
    pub fn new() -> RouteSegmentLog {
        RouteSegmentLog {
            segments: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Walks a route and refreshes every adjacent pair.
    pub fn observe_route(&mut self, endpoints: (NodeNum, NodeNum), route: &[NodeNum], now_ms: u64) {
        let mut chain = Vec::with_capacity(route.len() + 2);
        chain.push(endpoints.0);
        chain.extend_from_slice(route);
        chain.push(endpoints.1);

        let hops = chain.len().saturating_sub(1) as u32;

        for pair in chain.windows(2) {
            if pair[0] == pair[1] {
                continue;
            }

            let entry = self
                .segments
                .entry((pair[0], pair[1]))
                .or_insert(RouteSegment {
                    from_num: pair[0],
                    to_num: pair[1],
                    last_seen: now_ms,
                    hops_observed: hops,
                });

            entry.last_seen = now_ms;
            entry.hops_observed = entry.hops_observed.max(hops);
        }
    }

    /// Active segments seen since the horizon, longest observed route
    /// first.
    pub fn longest_active(&self, horizon_ms: u64) -> Vec<&RouteSegment> {
        let mut active: Vec<&RouteSegment> = self
            .segments
            .values()
            .filter(|s| s.last_seen >= horizon_ms)
            .collect();

        active.sort_by(|a, b| b.hops_observed.cmp(&a.hops_observed));
        active
    }

    /// The all-time record holder by observed hops.
    pub fn record_holder(&self) -> Option<&RouteSegment> {
        self.segments.values().max_by_key(|s| s.hops_observed)
    }

    pub fn sweep(&mut self, cutoff_ms: u64) -> usize {
        let before = self.segments.len();
        self.segments.retain(|_, s| s.last_seen >= cutoff_ms);
        before - self.segments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteSegment> {
        self.segments.values()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub node_num: NodeNum,
    pub neighbor_num: NodeNum,
    pub snr: f32,
    /// Unix milliseconds.
    pub last_heard: u64,
}

/// Only the latest sample per unordered pair is kept.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<NeighborEntry>", into = "Vec<NeighborEntry>")]
pub struct NeighborLog {
    entries: HashMap<(NodeNum, NodeNum), NeighborEntry>,
}

impl From<Vec<NeighborEntry>> for NeighborLog {
    fn from(entries: Vec<NeighborEntry>) -> NeighborLog {
        let mut log = NeighborLog::new();

        for entry in entries {
            log.observe(entry.node_num, entry.neighbor_num, entry.snr, entry.last_heard);
        }

        log
    }
}

impl From<NeighborLog> for Vec<NeighborEntry> {
    fn from(log: NeighborLog) -> Vec<NeighborEntry> {
        log.entries.into_values().collect()
    }
}

impl NeighborLog {
    pub fn new() -> NeighborLog {
        NeighborLog {
            entries: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn observe(&mut self, node_num: NodeNum, neighbor_num: NodeNum, snr: f32, now_ms: u64) {
        let key = (node_num.min(neighbor_num), node_num.max(neighbor_num));

        self.entries.insert(
            key,
            NeighborEntry {
                node_num,
                neighbor_num,
                snr,
                last_heard: now_ms,
            },
        );
    }

    pub fn neighbors_of(&self, node_num: NodeNum) -> Vec<&NeighborEntry> {
        self.entries
            .values()
            .filter(|e| e.node_num == node_num || e.neighbor_num == node_num)
            .collect()
    }

    pub fn sweep(&mut self, cutoff_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_heard >= cutoff_ms);
        before - self.entries.len()
    }

    /// Drops every edge touching the given node.
    pub fn purge_node(&mut self, node_num: NodeNum) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.node_num != node_num && e.neighbor_num != node_num);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(node: NodeNum, kind: &str, timestamp: u64, value: f64) -> TelemetrySample {
        TelemetrySample {
            node_id: ferrite::node_id(node),
            node_num: node,
            telemetry_type: kind.into(),
            timestamp,
            value,
            unit: None,
            packet_id: None,
            channel: None,
            precision_bits: None,
            gps_accuracy: None,
        }
    }

    #[test]
    fn test_telemetry_unique_triple() {
        let mut log = TelemetryLog::new();

        assert!(log.insert(sample(1, "battery", 100, 80.0)));
        assert!(!log.insert(sample(1, "battery", 100, 75.0)));
        assert!(log.insert(sample(1, "battery", 200, 75.0)));
        assert!(log.insert(sample(1, "voltage", 100, 3.7)));

        assert_eq!(log.len(), 3);
        // First insert wins on conflict.
        assert_eq!(log.latest(1, "battery").unwrap().timestamp, 200);
        assert_eq!(log.series(1, "battery")[0].value, 80.0);
    }

    #[test]
    fn test_telemetry_sweep_extends_favorites() {
        let mut log = TelemetryLog::new();

        log.insert(sample(1, "battery", 100, 80.0));
        log.insert(sample(2, "battery", 100, 60.0));
        log.insert(sample(2, "battery", 900, 55.0));

        let removed = log.sweep(500, 50, &|num| num == 1);

        assert_eq!(removed, 1);
        assert_eq!(log.latest(1, "battery").unwrap().timestamp, 100);
        assert_eq!(log.latest(2, "battery").unwrap().timestamp, 900);
    }

    #[test]
    fn test_traceroute_hop_count() {
        let mut log = TracerouteLog::new();

        let entry = log.record(1, 4, &[2, 3], 1000);
        assert_eq!(entry.hop_count, 2);
        assert_eq!(entry.route, "[2,3]");

        log.record_unparseable(1, 5, 2000);
        assert_eq!(log.latest_for(5).unwrap().hop_count, HOPS_UNPARSEABLE);
    }

    #[test]
    fn test_traceroute_ids_increment() {
        let mut log = TracerouteLog::new();

        let first = log.record(1, 2, &[], 100).id;
        let second = log.record(1, 3, &[], 200).id;

        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_route_segments_observe_chain() {
        let mut log = RouteSegmentLog::new();

        log.observe_route((1, 4), &[2, 3], 1000);

        // 1-2, 2-3, 3-4
        assert_eq!(log.len(), 3);
        assert_eq!(log.record_holder().unwrap().hops_observed, 3);

        log.observe_route((1, 2), &[], 2000);
        let refreshed = log.longest_active(1500);
        assert_eq!(refreshed.len(), 1);
        assert_eq!(
            (refreshed[0].from_num, refreshed[0].to_num),
            (1, 2)
        );
        // hops_observed keeps the record for the pair.
        assert_eq!(refreshed[0].hops_observed, 3);
    }

    #[test]
    fn test_neighbor_latest_per_unordered_pair() {
        let mut log = NeighborLog::new();

        log.observe(1, 2, 5.0, 100);
        log.observe(2, 1, 7.5, 200);

        assert_eq!(log.len(), 1);
        let entry = log.neighbors_of(1)[0];
        assert_eq!(entry.snr, 7.5);
        assert_eq!(entry.last_heard, 200);
    }
}
