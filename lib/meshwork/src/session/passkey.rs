//! Admin session passkey cache.
//!
//! Remote admin commands must carry a short-lived passkey obtained through
//! a get-config(SESSIONKEY) round trip. The cache is per remote node;
//! concurrent misses coalesce onto one in-flight fetch instead of issuing
//! duplicates. The wire carries no expiry, so entries live for a fixed TTL
//! stamped at receipt and refreshed on successful use.

use crate::error::{Error, RequestKind, Result};
use ferrite::NodeNum;
use hashbrown::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const PASSKEY_TTL: Duration = Duration::from_secs(300);

/// Shared completion cell for one in-flight fetch.
pub struct FetchShared {
    outcome: Mutex<Option<Result<Vec<u8>>>>,
    cond: Condvar,
}

impl FetchShared {
    fn new() -> Arc<FetchShared> {
        Arc::new(FetchShared {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn fill(&self, outcome: Result<Vec<u8>>) {
        let mut slot = self.outcome.lock().expect("Poisoned fetch lock");

        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Blocks a coalesced caller until the owning fetch completes.
    pub fn wait(&self, deadline: Duration) -> Result<Vec<u8>> {
        let mut slot = self.outcome.lock().expect("Poisoned fetch lock");
        let start = Instant::now();

        while slot.is_none() {
            let remaining = deadline
                .checked_sub(start.elapsed())
                .ok_or(Error::Timeout(RequestKind::SessionKey))?;

            let (guard, result) = self
                .cond
                .wait_timeout(slot, remaining)
                .expect("Poisoned fetch lock");
            slot = guard;

            if result.timed_out() && slot.is_none() {
                return Err(Error::Timeout(RequestKind::SessionKey));
            }
        }

        match slot.as_ref().expect("Outcome just observed") {
            Ok(passkey) => Ok(passkey.clone()),
            Err(_) => Err(Error::AdminDenied(0)),
        }
    }
}

enum Entry {
    Ready { passkey: Vec<u8>, expires_at: Instant },
    Fetching(Arc<FetchShared>),
}

/// What a caller holds after claiming the cache for a remote node.
pub enum Claim {
    /// A fresh cached passkey.
    Cached(Vec<u8>),
    /// This caller owns the fetch and must call `complete` or `abort`.
    Fetch,
    /// Another caller's fetch is in flight; wait on it.
    Wait(Arc<FetchShared>),
}

pub struct PasskeyCache {
    entries: Mutex<HashMap<NodeNum, Entry>>,
}

impl PasskeyCache {
    pub fn new() -> PasskeyCache {
        PasskeyCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claims the cache slot for a remote node.
    pub fn claim(&self, remote: NodeNum, now: Instant) -> Claim {
        let mut entries = self.entries.lock().expect("Poisoned passkey lock");

        match entries.get(&remote) {
            Some(Entry::Ready { passkey, expires_at }) if *expires_at > now => {
                return Claim::Cached(passkey.clone());
            }
            Some(Entry::Fetching(shared)) => {
                return Claim::Wait(shared.clone());
            }
            _ => {}
        }

        entries.insert(remote, Entry::Fetching(FetchShared::new()));
        Claim::Fetch
    }

    /// Completes the fetch this caller owned, releasing coalesced waiters.
    pub fn complete(&self, remote: NodeNum, passkey: Vec<u8>, now: Instant) {
        let mut entries = self.entries.lock().expect("Poisoned passkey lock");

        if let Some(Entry::Fetching(shared)) = entries.get(&remote) {
            shared.fill(Ok(passkey.clone()));
        }

        entries.insert(
            remote,
            Entry::Ready {
                passkey,
                expires_at: now + PASSKEY_TTL,
            },
        );
    }

    /// Aborts the fetch this caller owned; waiters observe the failure.
    pub fn abort(&self, remote: NodeNum, error: Error) {
        let mut entries = self.entries.lock().expect("Poisoned passkey lock");

        if let Some(Entry::Fetching(shared)) = entries.remove(&remote) {
            shared.fill(Err(error));
        }
    }

    /// Refreshes the TTL after a successful use.
    pub fn touch(&self, remote: NodeNum, now: Instant) {
        let mut entries = self.entries.lock().expect("Poisoned passkey lock");

        if let Some(Entry::Ready { expires_at, .. }) = entries.get_mut(&remote) {
            *expires_at = now + PASSKEY_TTL;
        }
    }

    /// Drops a passkey the remote refused.
    pub fn invalidate(&self, remote: NodeNum) {
        let mut entries = self.entries.lock().expect("Poisoned passkey lock");

        if let Some(Entry::Ready { .. }) = entries.get(&remote) {
            entries.remove(&remote);
        }
    }

    /// Installs an expired-looking entry; test hook for the retry path.
    #[cfg(test)]
    pub fn install_expired(&self, remote: NodeNum, passkey: Vec<u8>, now: Instant) {
        self.entries.lock().expect("Poisoned passkey lock").insert(
            remote,
            Entry::Ready {
                passkey,
                expires_at: now - Duration::from_secs(1),
            },
        );
    }
}
