//! Per-key single-flight write queue.
//!
//! Every write takes a [`Ticket`] for its key at the moment it is issued.
//! Writes for one key run one at a time in issue order. A write whose ticket
//! has been superseded by a newer one while it waited is skipped, so only the
//! latest queued value reaches the store.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Result of running a ticketed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightOutcome<T> {
    /// A newer ticket was issued before this one reached the front.
    Superseded,
    /// The write ran and produced this value.
    Completed(T),
}

#[derive(Debug, Default)]
struct Lane {
    generation: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

/// Keyed lanes of serialized writes.
#[derive(Debug)]
pub struct SingleFlight<K> {
    lanes: Mutex<HashMap<K, Arc<Lane>>>,
}

impl<K> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> SingleFlight<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next ticket for `key`. Issue order is run order.
    pub fn issue(&self, key: K) -> Ticket {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(lanes.entry(key).or_default())
        };
        let generation = lane.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        Ticket { lane, generation }
    }
}

/// Permission to perform one write on one key.
#[derive(Debug)]
pub struct Ticket {
    lane: Arc<Lane>,
    generation: u64,
}

impl Ticket {
    /// Monotonic per-key generation of this ticket.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// No newer ticket has been issued for this key.
    pub fn is_current(&self) -> bool {
        self.lane.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Wait for the lane, then run `write` unless superseded.
    pub async fn run<F, Fut, T>(self, write: F) -> FlightOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _turn = self.lane.gate.lock().await;
        if !self.is_current() {
            return FlightOutcome::Superseded;
        }
        FlightOutcome::Completed(write().await)
    }
}
