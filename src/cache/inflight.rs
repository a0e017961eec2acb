//! Per-fingerprint in-flight registry
//!
//! The first caller for a key becomes the leader and publishes its result on a
//! watch channel; later callers park on a receiver. Dropping a leader without
//! publishing (cancellation) closes the channel and frees the slot, so a
//! parked follower can claim leadership.

use crate::cache::{CacheEntry, Fingerprint};
use crate::error::DomainError;
use ahash::AHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub(crate) type SharedResult = Result<Arc<CacheEntry>, DomainError>;
type Slot = watch::Receiver<Option<SharedResult>>;
type SlotKey = (u64, Fingerprint);

pub(crate) enum Claim {
    Leader(LeaderGuard),
    Follower(Slot),
}

#[derive(Default)]
pub(crate) struct InflightRegistry {
    slots: Arc<Mutex<AHashMap<SlotKey, (u64, Slot)>>>,
    next_id: AtomicU64,
}

impl InflightRegistry {
    /// Join the computation for `key` or start one
    pub(crate) fn claim(&self, epoch: u64, fingerprint: Fingerprint) -> Result<Claim, DomainError> {
        let key = (epoch, fingerprint);
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| DomainError::CacheUnavailable("in-flight registry poisoned".to_string()))?;

        if let Some((_, rx)) = slots.get(&key) {
            return Ok(Claim::Follower(rx.clone()));
        }

        let (tx, rx) = watch::channel(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slots.insert(key, (id, rx));

        Ok(Claim::Leader(LeaderGuard {
            key,
            id,
            tx,
            slots: Arc::clone(&self.slots),
        }))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Leadership of one in-flight computation
pub(crate) struct LeaderGuard {
    key: SlotKey,
    id: u64,
    tx: watch::Sender<Option<SharedResult>>,
    slots: Arc<Mutex<AHashMap<SlotKey, (u64, Slot)>>>,
}

impl LeaderGuard {
    /// Deliver the result to every parked follower and release the slot
    pub(crate) fn publish(self, result: SharedResult) {
        // send_replace stores the value even with no receiver left
        self.tx.send_replace(Some(result));
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(&self.key).is_some_and(|(id, _)| *id == self.id) {
                slots.remove(&self.key);
            }
        }
    }
}

/// Wait for the leader's result; `None` when the leader went away
pub(crate) async fn wait_for_leader(mut rx: Slot) -> Option<SharedResult> {
    let result = match rx.wait_for(|value| value.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    result
}
