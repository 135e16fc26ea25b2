//! Node records and the arbitration rules that guard their mutation.

use ferrite::NodeNum;
use serde_derive::{Deserialize, Serialize};

/// Positions older than this lose their precision privilege: a lower
/// precision fix may then overwrite a higher precision one.
pub const POSITION_PRECISION_MAX_AGE_MS: u64 = 12 * 3600 * 1000;

// Movement beyond roughly 50 m between observed fixes marks a node mobile.
const MOBILITY_THRESHOLD_DEG: f64 = 0.0005;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    /// `Some(0)` is a valid minimum precision, distinct from absent.
    pub precision_bits: Option<u32>,
    pub gps_accuracy: Option<u32>,
    pub hdop: Option<u32>,
    pub channel: Option<u32>,
    /// Fix timestamp in unix milliseconds.
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionOverride {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    /// Private overrides are hidden from unprivileged reads at the external
    /// boundary; the store only tags them.
    pub private: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Node {
    pub num: NodeNum,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<i32>,
    pub role: Option<i32>,
    /// Unix seconds the node was last heard.
    pub last_heard: Option<u64>,
    pub hops_away: Option<u32>,
    pub snr: Option<f32>,
    pub public_key: Vec<u8>,
    pub is_favorite: bool,
    pub is_ignored: bool,
    pub firmware_version: Option<String>,
    pub reboot_count: Option<u32>,
    /// Channel index the node was last heard on.
    pub channel: Option<u32>,
    pub position: Option<NodePosition>,
    pub position_override: Option<PositionOverride>,
    pub position_override_enabled: bool,
    pub is_mobile: bool,
    pub key_is_low_entropy: bool,
    pub duplicate_key_detected: bool,
    /// Co-offending node numbers for a duplicate-key finding.
    pub key_security_issue_details: Option<Vec<NodeNum>>,
    /// Remote-admin capability verdict; `None` until probed.
    pub has_remote_admin: Option<bool>,
    /// Unix seconds of the last remote-admin probe, for negative-result
    /// expiry.
    pub remote_admin_checked_at: Option<u64>,
    pub welcomed: bool,
    pub is_local: bool,
}

impl Node {
    pub fn new(num: NodeNum) -> Node {
        Node {
            num,
            ..Node::default()
        }
    }

    /// Canonical `!`-prefixed hex id.
    #[inline]
    pub fn node_id(&self) -> String {
        ferrite::node_id(self.num)
    }

    /// Per-contact encryption is available iff the node published a public
    /// key or is the local node.
    #[inline]
    pub fn has_pkc(&self) -> bool {
        !self.public_key.is_empty() || self.is_local
    }

    /// The effective position: the override when enabled, else the last
    /// observed fix.
    pub fn effective_position(&self) -> Option<NodePosition> {
        if self.position_override_enabled {
            if let Some(ov) = &self.position_override {
                return Some(NodePosition {
                    latitude: ov.latitude,
                    longitude: ov.longitude,
                    altitude: ov.altitude,
                    precision_bits: None,
                    gps_accuracy: None,
                    hdop: None,
                    channel: None,
                    timestamp: None,
                });
            }
        }

        self.position.clone()
    }

    /// Applies a new observed fix under the precision arbitration law,
    /// returning whether it was accepted.
    pub fn apply_position(&mut self, incoming: NodePosition, now_ms: u64) -> bool {
        if !accept_position(self.position.as_ref(), incoming.precision_bits, now_ms) {
            return false;
        }

        if let Some(old) = &self.position {
            if (old.latitude - incoming.latitude).abs() > MOBILITY_THRESHOLD_DEG
                || (old.longitude - incoming.longitude).abs() > MOBILITY_THRESHOLD_DEG
            {
                self.is_mobile = true;
            }
        }

        self.position = Some(incoming);
        true
    }
}

/// The precision arbitration law: accept iff
/// `newPrec >= oldPrec || age >= 12h`, where a missing side of the
/// comparison always accepts and a missing old timestamp counts as
/// infinitely aged.
pub fn accept_position(
    existing: Option<&NodePosition>,
    new_precision: Option<u32>,
    now_ms: u64,
) -> bool {
    let old = match existing {
        Some(old) => old,
        None => return true,
    };

    let old_precision = match old.precision_bits {
        Some(precision) => precision,
        None => return true,
    };

    let new_precision = match new_precision {
        Some(precision) => precision,
        None => return true,
    };

    let age = match old.timestamp {
        Some(timestamp) => now_ms.saturating_sub(timestamp),
        None => return true,
    };

    // Strict inequality: at exactly 12 h the aged fix is overwritten.
    !(new_precision < old_precision && age < POSITION_PRECISION_MAX_AGE_MS)
}
