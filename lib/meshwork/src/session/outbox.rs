//! Send queue with per-destination ack gating.
//!
//! The gateway holds a very small transmit queue, so the session keeps at
//! most one in-flight want-ack record per destination; further reliable
//! records to the same node wait until the outstanding one is acked,
//! failed or timed out. Fire-and-forget records bypass the gate.

use crate::net::link::LinkHandle;
use ferrite::logging;
use ferrite::NodeNum;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

struct Lane {
    in_flight: Option<u32>,
    queue: VecDeque<(u32, Vec<u8>)>,
}

pub struct Outbox {
    link: LinkHandle,
    lanes: Mutex<HashMap<NodeNum, Lane>>,
    log: logging::Logger,
}

impl Outbox {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(link: LinkHandle, log: L) -> Outbox {
        let outbox_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Outbox {
            link,
            lanes: Mutex::new(HashMap::new()),
            log: outbox_log,
        }
    }

    /// Sends a record immediately, without gating.
    pub fn send_unreliable(&self, payload: Vec<u8>) {
        self.link.send_record(payload);
    }

    /// Queues a want-ack record for a destination. It is written now if the
    /// lane is clear, else after the outstanding record completes.
    pub fn send_reliable(&self, dest: NodeNum, request_id: u32, payload: Vec<u8>) {
        let mut lanes = self.lanes.lock().expect("Poisoned outbox lock");
        let lane = lanes.entry(dest).or_insert_with(|| Lane {
            in_flight: None,
            queue: VecDeque::new(),
        });

        if lane.in_flight.is_none() {
            lane.in_flight = Some(request_id);
            self.link.send_record(payload);
        } else {
            logging::debug!(self.log, "record queued behind in-flight ack";
                            "context" => "send_reliable",
                            "dest" => dest,
                            "request_id" => request_id,
                            "queued" => lane.queue.len() + 1);
            lane.queue.push_back((request_id, payload));
        }
    }

    /// Releases the lane after the in-flight record completed (ack,
    /// routing error or timeout) and writes the next queued record.
    pub fn complete(&self, request_id: u32) {
        let mut lanes = self.lanes.lock().expect("Poisoned outbox lock");

        for lane in lanes.values_mut() {
            if lane.in_flight == Some(request_id) {
                match lane.queue.pop_front() {
                    Some((next_id, payload)) => {
                        lane.in_flight = Some(next_id);
                        self.link.send_record(payload);
                    }
                    None => lane.in_flight = None,
                }

                return;
            }
        }
    }

    /// Drops all gating state; queued records are discarded on disconnect.
    pub fn reset(&self) {
        let mut lanes = self.lanes.lock().expect("Poisoned outbox lock");
        let dropped: usize = lanes.values().map(|lane| lane.queue.len()).sum();

        if dropped > 0 {
            logging::debug!(self.log, "outbox reset dropped queued records";
                            "context" => "reset",
                            "dropped" => dropped);
        }

        lanes.clear();
    }

    /// The request id currently holding the lane to a destination.
    pub fn in_flight_for(&self, dest: NodeNum) -> Option<u32> {
        self.lanes
            .lock()
            .expect("Poisoned outbox lock")
            .get(&dest)
            .and_then(|lane| lane.in_flight)
    }
}
