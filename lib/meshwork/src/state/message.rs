//! De-duplicated, ordered message log.

use crate::proto::PortNum;
use crate::DM_CHANNEL;
use ferrite::NodeNum;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};

pub const PAGE_LIMIT_MAX: usize = 500;
pub const PAGE_OFFSET_MAX: usize = 50_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Stringified 32-bit packet id; the primary key.
    pub id: String,
    pub from_num: NodeNum,
    pub to_num: NodeNum,
    pub from_id: String,
    pub to_id: String,
    pub text: Option<String>,
    /// Transport channel, or `-1` for a direct message.
    pub channel: i32,
    pub portnum: i32,
    pub request_id: Option<u32>,
    /// Sender-reported timestamp, unix milliseconds.
    pub timestamp: Option<u64>,
    /// Local receive time, unix milliseconds.
    pub rx_time: Option<u64>,
    pub hop_start: Option<u32>,
    pub hop_limit: Option<u32>,
    pub relay_node: Option<u32>,
    pub reply_id: Option<u32>,
    pub emoji: bool,
    pub via_mqtt: bool,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub ack_failed: bool,
    pub routing_error_received: bool,
    pub delivery_state: DeliveryState,
    pub want_ack: bool,
    pub ack_from_node: Option<NodeNum>,
    pub created_at: u64,
    pub decrypted_by: Option<String>,
}

/// How an acknowledgement reached us: from the destination itself, from a
/// relaying node, or as a routing failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    Explicit,
    Implicit,
    RoutingError,
}

impl StoredMessage {
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.channel == DM_CHANNEL
    }

    /// Delivery-state transition table. Explicit acks confirm; implicit
    /// acks only lift channel messages to delivered; routing errors fail
    /// either. Confirmed is terminal for acks.
    pub fn apply_ack(&mut self, kind: AckKind, ack_from: NodeNum) {
        match kind {
            AckKind::Explicit => {
                self.delivery_state = DeliveryState::Confirmed;
                self.ack_from_node = Some(ack_from);
            }
            AckKind::Implicit => {
                if !self.is_direct() && self.delivery_state == DeliveryState::Pending {
                    self.delivery_state = DeliveryState::Delivered;
                    self.ack_from_node = Some(ack_from);
                }
            }
            AckKind::RoutingError => {
                self.delivery_state = DeliveryState::Failed;
                self.ack_failed = true;
                self.routing_error_received = true;
            }
        }
    }

    /// Retrieval-order key: receive time when known, else the sender
    /// timestamp.
    #[inline]
    pub fn order_key(&self) -> u64 {
        self.rx_time.or(self.timestamp).unwrap_or(0)
    }
}

/// A paginated query result; `has_more` reflects the limit+1 probe.
#[derive(Debug)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MessageLog {
    by_id: HashMap<String, StoredMessage>,
}

impl MessageLog {
    pub fn new() -> MessageLog {
        MessageLog {
            by_id: HashMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Idempotent insert: an existing row with the same id wins.
    pub fn insert(&mut self, message: StoredMessage) -> bool {
        if self.by_id.contains_key(&message.id) {
            return false;
        }

        self.by_id.insert(message.id.clone(), message);
        true
    }

    #[inline]
    pub fn get(&self, id: &str) -> Option<&StoredMessage> {
        self.by_id.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut StoredMessage> {
        self.by_id.get_mut(id)
    }

    pub fn find_by_request_id(&self, request_id: u32) -> Option<&StoredMessage> {
        self.by_id
            .values()
            .find(|msg| msg.request_id == Some(request_id))
    }

    pub fn find_by_request_id_mut(&mut self, request_id: u32) -> Option<&mut StoredMessage> {
        self.by_id
            .values_mut()
            .find(|msg| msg.request_id == Some(request_id))
    }

    /// Messages on a channel, newest first.
    pub fn by_channel(&self, channel: i32, limit: usize, offset: usize) -> MessagePage {
        self.page(|msg| msg.channel == channel, limit, offset)
    }

    /// Direct text messages between two nodes in either direction, newest
    /// first.
    pub fn direct(&self, a: NodeNum, b: NodeNum, limit: usize, offset: usize) -> MessagePage {
        self.page(
            |msg| {
                msg.portnum == PortNum::TextMessageApp as i32
                    && msg.is_direct()
                    && ((msg.from_num == a && msg.to_num == b)
                        || (msg.from_num == b && msg.to_num == a))
            },
            limit,
            offset,
        )
    }

    fn page<F: Fn(&StoredMessage) -> bool>(
        &self,
        filter: F,
        limit: usize,
        offset: usize,
    ) -> MessagePage {
        let limit = limit.max(1).min(PAGE_LIMIT_MAX);
        let offset = offset.min(PAGE_OFFSET_MAX);

        let mut matched: Vec<&StoredMessage> = self.by_id.values().filter(|m| filter(m)).collect();

        // Newest first; ties broken by id for a stable order.
        matched.sort_by(|a, b| {
            b.order_key()
                .cmp(&a.order_key())
                .then_with(|| b.id.cmp(&a.id))
        });

        let probe: Vec<StoredMessage> = matched
            .into_iter()
            .skip(offset)
            .take(limit + 1)
            .cloned()
            .collect();

        let has_more = probe.len() > limit;
        let mut messages = probe;
        messages.truncate(limit);

        MessagePage { messages, has_more }
    }

    /// Drops messages whose order key falls before the cutoff. Returns the
    /// removed ids for mirror deletion.
    pub fn retain_since(&mut self, cutoff_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .by_id
            .values()
            .filter(|msg| msg.order_key().max(msg.created_at) < cutoff_ms)
            .map(|msg| msg.id.clone())
            .collect();

        for id in &expired {
            self.by_id.remove(id);
        }

        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredMessage> {
        self.by_id.values()
    }
}
