//! Per-ordering-key delivery lanes.
//!
//! Deliveries that share an ordering key run one at a time, in submission
//! order: the next one starts only after the previous handler call returned.
//! Deliveries with different keys (or none) run concurrently.
//!
//! Pull loops must call [`OrderedLanes::submit`] in the order messages came
//! off the transport; the lane keeps that order from there on.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::error;

/// One queued delivery.
pub(crate) type Delivery = BoxFuture<'static, ()>;

type Lanes = HashMap<String, VecDeque<Delivery>>;

/// Keyed FIFO of pending deliveries.
#[derive(Clone, Default)]
pub(crate) struct OrderedLanes {
    lanes: Arc<Mutex<Lanes>>,
}

impl OrderedLanes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `delivery` behind earlier deliveries for `key`.
    ///
    /// Starts a drain task when the key has no active lane.
    pub(crate) fn submit(&self, key: Option<String>, delivery: Delivery) {
        let Some(key) = key else {
            tokio::spawn(delivery);
            return;
        };

        let mut lanes = self.lock();
        if let Some(pending) = lanes.get_mut(&key) {
            pending.push_back(delivery);
            return;
        }
        lanes.insert(key.clone(), VecDeque::new());
        drop(lanes);

        tokio::spawn(self.clone().drain(key, delivery));
    }

    /// Number of keys with a delivery in flight.
    pub(crate) fn active(&self) -> usize {
        self.lock().len()
    }

    async fn drain(self, key: String, first: Delivery) {
        let mut next = Some(first);
        while let Some(delivery) = next {
            // A panicking handler must not leave the lane stuck.
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                error!(ordering_key = %key, "Delivery panicked");
            }

            next = {
                let mut lanes = self.lock();
                let queued = lanes.get_mut(&key).and_then(VecDeque::pop_front);
                if queued.is_none() {
                    lanes.remove(&key);
                }
                queued
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lanes> {
        // No code path panics while holding the lock; recover the map regardless.
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
