//! Per-key single-flight slots.
//!
//! A [`SingleFlight`] hands out at most one [`FlightGuard`] per key at a time.
//! Later callers for the same key wait until the guard is dropped, whatever
//! the exit path of its holder: success, error, timeout or cancellation.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Map of per-key async slots.
#[derive(Debug, Default)]
pub struct SingleFlight {
    slots: Slots,
}

/// Occupies a key of a [`SingleFlight`] until dropped.
#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    slot: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl SingleFlight {
    /// Waits for the slot of `key` to be free and occupies it.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.to_owned()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;

        FlightGuard {
            key: key.to_owned(),
            slot,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Whether the slot of `key` is currently occupied.
    pub fn is_pending(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys with an occupied or awaited slot.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is occupied or awaited.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut slots = self.slots.lock();
        // Only the map and this guard still reference the slot: nobody waits on it
        if Arc::strong_count(&self.slot) == 2
            && slots
                .get(&self.key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.slot))
        {
            slots.remove(&self.key);
        }
    }
}
