//! Correlation table for in-flight calls.
//!
//! The id counter and the pending map live behind one lock so that
//! "allocate an id, then register its consumer" is observed as a single step
//! by concurrent callers and the reader loop.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;

/// What a consumer receives: the call's result or the reason it failed.
pub type Outcome = std::result::Result<Value, ClientError>;

/// Completion callback for an asynchronous call.
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// The party waiting on one call.
pub enum Consumer {
    /// Single-slot handoff awaited by the caller.
    Slot(oneshot::Sender<Outcome>),
    /// Invoked once on a blocking-pool thread, never on the reader's task.
    Callback(Callback),
}

impl Consumer {
    /// Create a slot consumer and the receiver the caller awaits.
    pub fn slot() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Consumer::Slot(tx), rx)
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        Consumer::Callback(Box::new(f))
    }

    /// Hand the outcome over. Consumes the consumer, so delivery happens once.
    pub fn deliver(self, outcome: Outcome) {
        match self {
            Consumer::Slot(tx) => {
                // Receiver gone means the caller timed out or was dropped
                let _ = tx.send(outcome);
            }
            Consumer::Callback(callback) => {
                tokio::task::spawn_blocking(move || callback(outcome));
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consumer::Slot(_) => f.write_str("Consumer::Slot"),
            Consumer::Callback(_) => f.write_str("Consumer::Callback"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    /// Next id to hand out. Ids start at 1 and never repeat.
    next_id: u64,
    pending: HashMap<u64, Consumer>,
    /// Set by `drain_all`; no registrations are accepted afterwards.
    closed: bool,
}

/// Table of outstanding calls for one connection.
#[derive(Debug)]
pub struct CallRegistry {
    inner: Mutex<Inner>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id.
    pub fn next_id(&self) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Register `consumer` under a previously allocated `id`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionClosed` once the registry has been
    /// drained; the consumer is dropped without being invoked.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn register(&self, id: u64, consumer: Consumer) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::ConnectionClosed);
        }
        assert!(id < inner.next_id, "call id {} was not issued by this registry", id);
        let prev = inner.pending.insert(id, consumer);
        assert!(prev.is_none(), "call id {} registered twice", id);
        debug!(id, pending = inner.pending.len(), "registered pending call");
        Ok(())
    }

    /// Allocate an id and register `consumer` under it in one step.
    pub fn register_next(&self, consumer: Consumer) -> Result<u64, ClientError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(ClientError::ConnectionClosed);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.insert(id, consumer);
        debug!(id, pending = inner.pending.len(), "registered pending call");
        Ok(id)
    }

    /// Deliver `outcome` to the consumer waiting on `id`.
    ///
    /// Returns `false` if no call with that id is outstanding; the caller
    /// reports that as a protocol anomaly.
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        // Deliver outside the lock
        let consumer = self.lock().pending.remove(&id);
        match consumer {
            Some(consumer) => {
                consumer.deliver(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without delivering anything.
    ///
    /// Used when the request never made it onto the wire or its caller gave up.
    pub fn cancel(&self, id: u64) -> Option<Consumer> {
        self.lock().pending.remove(&id)
    }

    /// Empty the table, failing every outstanding call with
    /// `ClientError::ConnectionClosed`. Returns the number of calls failed.
    ///
    /// After this the registry refuses new registrations.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<(u64, Consumer)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (id, consumer) in drained {
            debug!(id, "failing pending call: connection closed");
            consumer.deliver(Err(ClientError::ConnectionClosed));
        }
        count
    }

    /// Ids of outstanding calls, sorted (for diagnostics).
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
