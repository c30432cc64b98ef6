//! Process-wide gang tracking: the gang state map and the reservation
//! sentinel set. Both are initialized before any worker starts and shared
//! behind locks, since plugin code on any worker may touch them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::time::Instant;
use uuid::Uuid;

/// Assembly phase a gang is observed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GangPhase {
    /// Fewer than `min_count` members pending.
    Gathering,
    /// Enough members pending; the next arrival can satisfy the permit gate.
    Ready,
    /// `min_count` members cleared Permit.
    Admitted,
}

#[derive(Debug)]
pub struct GangState {
    pub namespace: String,
    pub group: String,
    pub min_count: u32,
    pub member_uids: HashSet<Uuid>,
    /// Members currently parked in the permit waiting room, insertion order.
    pub waiting: Vec<Uuid>,
    pub first_arrival: Instant,
    /// Members that have cleared Permit.
    pub admitted: u32,
}

impl GangState {
    pub fn phase(&self) -> GangPhase {
        if self.admitted >= self.min_count {
            GangPhase::Admitted
        } else if self.member_uids.len() as u32 >= self.min_count {
            GangPhase::Ready
        } else {
            GangPhase::Gathering
        }
    }
}

/// Thread-safe map from `namespace/groupName` to assembly state.
#[derive(Default)]
pub struct GangDirectory {
    inner: RwLock<HashMap<String, GangState>>,
}

pub type SharedGangDirectory = Arc<GangDirectory>;

impl GangDirectory {
    pub fn new() -> SharedGangDirectory {
        Arc::new(GangDirectory::default())
    }

    /// Register a member arrival, creating the gang entry on first sight.
    pub fn observe_member(
        &self,
        gang_key: &str,
        namespace: &str,
        group: &str,
        min_count: u32,
        uid: Uuid,
    ) {
        let mut inner = self.inner.write().unwrap();
        let state = inner.entry(gang_key.to_string()).or_insert_with(|| GangState {
            namespace: namespace.to_string(),
            group: group.to_string(),
            min_count,
            member_uids: HashSet::new(),
            waiting: Vec::new(),
            first_arrival: Instant::now(),
            admitted: 0,
        });
        state.min_count = min_count;
        state.member_uids.insert(uid);
    }

    pub fn record_waiting(&self, gang_key: &str, uid: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.get_mut(gang_key)
            && !state.waiting.contains(&uid)
        {
            state.waiting.push(uid);
        }
    }

    /// Drain the waiting set in insertion order; used when the gate opens.
    pub fn take_waiters(&self, gang_key: &str) -> Vec<Uuid> {
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(gang_key) {
            Some(state) => std::mem::take(&mut state.waiting),
            None => Vec::new(),
        }
    }

    /// Drop a single waiter, e.g. after its permit timer fired.
    pub fn remove_waiter(&self, gang_key: &str, uid: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.get_mut(gang_key) {
            state.waiting.retain(|w| *w != uid);
        }
    }

    pub fn waiting_count(&self, gang_key: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(gang_key)
            .map(|s| s.waiting.len())
            .unwrap_or(0)
    }

    pub fn record_admitted(&self, gang_key: &str, count: u32) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.get_mut(gang_key) {
            state.admitted += count;
        }
    }

    pub fn phase(&self, gang_key: &str) -> Option<GangPhase> {
        self.inner.read().unwrap().get(gang_key).map(|s| s.phase())
    }

    pub fn min_count(&self, gang_key: &str) -> Option<u32> {
        self.inner.read().unwrap().get(gang_key).map(|s| s.min_count)
    }

    /// Forget a completed or abandoned gang.
    pub fn retire(&self, gang_key: &str) {
        self.inner.write().unwrap().remove(gang_key);
    }
}

/// Once-per-lifetime markers for reservation creation, insert-or-claim
/// semantics. A claim stays `pending` until the store write is confirmed;
/// a cleared sentinel re-arms creation.
#[derive(Default)]
pub struct ReservationSentinels {
    claimed: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
}

pub type SharedSentinels = Arc<ReservationSentinels>;

impl ReservationSentinels {
    pub fn new() -> SharedSentinels {
        Arc::new(ReservationSentinels::default())
    }

    /// Claim the sentinel. Returns true exactly once until cleared.
    pub fn try_claim(&self, gang_key: &str) -> bool {
        let newly = self.claimed.lock().unwrap().insert(gang_key.to_string());
        if newly {
            self.pending.lock().unwrap().insert(gang_key.to_string());
        }
        newly
    }

    pub fn is_claimed(&self, gang_key: &str) -> bool {
        self.claimed.lock().unwrap().contains(gang_key)
    }

    /// True while the claimed create has not been confirmed yet.
    pub fn is_pending(&self, gang_key: &str) -> bool {
        self.pending.lock().unwrap().contains(gang_key)
    }

    /// Confirm the claimed create reached the store.
    pub fn mark_created(&self, gang_key: &str) {
        self.pending.lock().unwrap().remove(gang_key);
    }

    pub fn clear(&self, gang_key: &str) {
        self.claimed.lock().unwrap().remove(gang_key);
        self.pending.lock().unwrap().remove(gang_key);
    }
}
