//! Request/response correlation.
//!
//! Every outbound record that expects a reply carries a 31-bit nonzero
//! request id. The table maps ids to response slots; the inbound path
//! resolves by id where the reply carries one, else by `(kind, from)`
//! heuristics. Each outstanding request observes its resolving record
//! exactly once.

use crate::error::{Error, RequestKind, Result};
use crate::proto;
use ferrite::NodeNum;
use hashbrown::HashMap;
use rand::Rng;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Upper bound (exclusive) for request ids: they must fit in 31 bits.
pub const REQUEST_ID_BOUND: u32 = 1 << 31;

impl RequestKind {
    /// Per-kind awaiter deadline.
    pub fn timeout(self) -> Duration {
        match self {
            RequestKind::Config
            | RequestKind::ModuleConfig
            | RequestKind::ChannelInfo
            | RequestKind::AdminResponse
            | RequestKind::DeviceMetadata => Duration::from_secs(15),
            RequestKind::SessionKey => Duration::from_secs(45),
            RequestKind::Traceroute => Duration::from_secs(120),
            RequestKind::NodeInfo | RequestKind::Position | RequestKind::Ack => {
                Duration::from_secs(60)
            }
        }
    }
}

/// The record that resolves a request.
#[derive(Debug, Clone)]
pub enum Response {
    /// Acknowledgement; `explicit` when it came from the destination
    /// itself.
    Ack { from: NodeNum, explicit: bool },
    /// The mesh reported a routing failure for the request.
    RoutingFailure {
        from: NodeNum,
        reason: proto::RoutingError,
    },
    Admin(Box<proto::AdminMessage>),
    Traceroute { from: NodeNum, route: Vec<NodeNum> },
    NodeInfo(Box<proto::NodeInfo>),
    Position(Box<proto::Position>),
    Metadata(Box<proto::DeviceMetadata>),
}

struct Slot {
    outcome: Mutex<Option<Result<Response>>>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Arc<Slot> {
        Arc::new(Slot {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn fill(&self, outcome: Result<Response>) {
        let mut slot = self.outcome.lock().expect("Poisoned slot lock");

        // Exactly-once: the first resolution wins.
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    fn wait(&self, deadline: Duration) -> Option<Result<Response>> {
        let mut slot = self.outcome.lock().expect("Poisoned slot lock");
        let start = Instant::now();

        while slot.is_none() {
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(remaining) => remaining,
                None => return None,
            };

            let (guard, result) = self
                .cond
                .wait_timeout(slot, remaining)
                .expect("Poisoned slot lock");
            slot = guard;

            if result.timed_out() && slot.is_none() {
                return None;
            }
        }

        slot.take()
    }
}

struct Pending {
    kind: RequestKind,
    target: Option<NodeNum>,
    created: Instant,
    slot: Arc<Slot>,
}

/// Blocking awaiter handed to the caller of a request.
pub struct Waiter {
    table: Arc<RequestTable>,
    request_id: u32,
    kind: RequestKind,
    slot: Arc<Slot>,
}

impl Waiter {
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Blocks until the response arrives or the per-kind deadline passes.
    /// On timeout the entry is deregistered; state already applied by a
    /// late reply is not rolled back.
    pub fn wait(self) -> Result<Response> {
        let deadline = self.kind.timeout();
        self.wait_for(deadline)
    }

    pub fn wait_for(self, deadline: Duration) -> Result<Response> {
        match self.slot.wait(deadline) {
            Some(outcome) => outcome,
            None => {
                self.table.remove(self.request_id);
                Err(Error::Timeout(self.kind))
            }
        }
    }
}

/// The mutex-protected promise table.
pub struct RequestTable {
    pending: Mutex<HashMap<u32, Pending>>,
}

impl RequestTable {
    pub fn new() -> Arc<RequestTable> {
        Arc::new(RequestTable {
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("Poisoned request table").len()
    }

    /// Picks a fresh random id in `[1, 2^31)` that is not outstanding.
    pub fn next_request_id(&self) -> u32 {
        let pending = self.pending.lock().expect("Poisoned request table");
        let mut rng = rand::thread_rng();

        loop {
            let id = rng.gen_range(1..REQUEST_ID_BOUND);

            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers an awaiter under a fresh request id.
    pub fn register(
        self: &Arc<Self>,
        kind: RequestKind,
        target: Option<NodeNum>,
    ) -> Waiter {
        let request_id = self.next_request_id();
        self.register_with_id(request_id, kind, target)
    }

    /// Registers an awaiter under a caller-chosen id (the mesh packet id
    /// doubles as the ack request id).
    pub fn register_with_id(
        self: &Arc<Self>,
        request_id: u32,
        kind: RequestKind,
        target: Option<NodeNum>,
    ) -> Waiter {
        let slot = Slot::new();

        self.pending.lock().expect("Poisoned request table").insert(
            request_id,
            Pending {
                kind,
                target,
                created: Instant::now(),
                slot: slot.clone(),
            },
        );

        Waiter {
            table: self.clone(),
            request_id,
            kind,
            slot,
        }
    }

    /// Resolves the request with the given id. Returns false when nothing
    /// was outstanding under it.
    pub fn resolve(&self, request_id: u32, response: Response) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("Poisoned request table")
            .remove(&request_id);

        match entry {
            Some(pending) => {
                pending.slot.fill(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Heuristic match for replies without ids: the newest outstanding
    /// request of this kind aimed at the replying node.
    pub fn resolve_by_kind(&self, kind: RequestKind, from: NodeNum, response: Response) -> bool {
        let mut pending = self.pending.lock().expect("Poisoned request table");

        let candidate = pending
            .iter()
            .filter(|(_, p)| p.kind == kind && p.target == Some(from))
            .max_by_key(|(_, p)| p.created)
            .map(|(&id, _)| id);

        match candidate {
            Some(id) => {
                let entry = pending.remove(&id).expect("Candidate must exist");
                entry.slot.fill(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fails one outstanding request.
    pub fn fail(&self, request_id: u32, error: Error) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("Poisoned request table")
            .remove(&request_id);

        match entry {
            Some(pending) => {
                pending.slot.fill(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding request; used on disconnect.
    pub fn fail_all_cancelled(&self) -> usize {
        let mut pending = self.pending.lock().expect("Poisoned request table");
        let count = pending.len();

        for (_, entry) in pending.drain() {
            entry.slot.fill(Err(Error::Cancelled));
        }

        count
    }

    /// Drops entries whose kind deadline has long passed. Covers requests
    /// whose waiter was never awaited.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock().expect("Poisoned request table");

        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.created) > p.kind.timeout())
            .map(|(&id, _)| id)
            .collect();

        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                entry.slot.fill(Err(Error::Timeout(entry.kind)));
            }
        }

        expired.len()
    }

    fn remove(&self, request_id: u32) {
        self.pending
            .lock()
            .expect("Poisoned request table")
            .remove(&request_id);
    }

    /// The destination the given outstanding request was aimed at.
    pub fn target_of(&self, request_id: u32) -> Option<NodeNum> {
        self.pending
            .lock()
            .expect("Poisoned request table")
            .get(&request_id)
            .and_then(|p| p.target)
    }
}
