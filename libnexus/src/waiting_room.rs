//! Permit waiting room: one parked entry and one release channel per
//! suspended unit. At most one verdict is ever delivered per unit, and
//! releases within a gang happen in insertion order.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::metrics;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermitVerdict {
    Allow,
    Reject(String),
}

struct Waiter {
    uid: Uuid,
    namespace: String,
    pod_group: String,
    tx: oneshot::Sender<PermitVerdict>,
}

#[derive(Default)]
pub struct WaitingRoom {
    inner: Mutex<Vec<Waiter>>,
}

pub type SharedWaitingRoom = Arc<WaitingRoom>;

impl WaitingRoom {
    pub fn new() -> SharedWaitingRoom {
        Arc::new(WaitingRoom::default())
    }

    /// Park a unit. The returned receiver yields the verdict exactly once;
    /// the caller owns the timeout.
    pub fn park(
        &self,
        uid: Uuid,
        namespace: &str,
        pod_group: &str,
    ) -> oneshot::Receiver<PermitVerdict> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().push(Waiter {
            uid,
            namespace: namespace.to_string(),
            pod_group: pod_group.to_string(),
            tx,
        });
        metrics::WAITING_PODS
            .with_label_values(&[namespace, pod_group])
            .inc();
        rx
    }

    fn release_where<F>(&self, mut pred: F, verdict: &PermitVerdict) -> usize
    where
        F: FnMut(&Waiter) -> bool,
    {
        let mut released = 0;
        let mut inner = self.inner.lock().unwrap();
        let mut remaining = Vec::with_capacity(inner.len());
        for waiter in inner.drain(..) {
            if pred(&waiter) {
                metrics::WAITING_PODS
                    .with_label_values(&[&waiter.namespace, &waiter.pod_group])
                    .dec();
                // The receiver may already be gone (timed out); that is fine.
                let _ = waiter.tx.send(verdict.clone());
                released += 1;
            } else {
                remaining.push(waiter);
            }
        }
        *inner = remaining;
        released
    }

    pub fn allow(&self, uid: Uuid) -> bool {
        self.release_where(|w| w.uid == uid, &PermitVerdict::Allow) > 0
    }

    pub fn reject(&self, uid: Uuid, message: &str) -> bool {
        self.release_where(
            |w| w.uid == uid,
            &PermitVerdict::Reject(message.to_string()),
        ) > 0
    }

    /// Allow every waiter of a gang, in insertion order.
    pub fn allow_group(&self, namespace: &str, pod_group: &str) -> usize {
        self.release_where(
            |w| w.namespace == namespace && w.pod_group == pod_group,
            &PermitVerdict::Allow,
        )
    }

    /// Drop a waiter without a verdict delivery; used when its timer fired
    /// and the cycle already resolved the outcome.
    pub fn forget(&self, uid: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.iter().position(|w| w.uid == uid) {
            let waiter = inner.remove(pos);
            metrics::WAITING_PODS
                .with_label_values(&[&waiter.namespace, &waiter.pod_group])
                .dec();
        }
    }

    /// Shutdown path: reject everyone so Unreserve runs on each cycle.
    pub fn reject_all(&self, message: &str) -> usize {
        self.release_where(|_| true, &PermitVerdict::Reject(message.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
