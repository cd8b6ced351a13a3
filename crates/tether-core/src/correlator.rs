//! Request/answer correlation.
//!
//! Each outbound request registers a one-shot waiter under a fresh sequence
//! number. Whoever removes the entry from the pending table owns the outcome:
//! the dispatcher removes it before delivering an answer, the requester
//! removes it before reporting a timeout. An entry is therefore removed
//! exactly once and exactly one outcome reaches the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::frame::{Origin, RequestId};
use crate::metrics::REQUEST_TIMEOUTS_TOTAL;
use crate::registry::Registry;

/// Waiter half returned by [`Correlator::register`].
pub struct Waiter {
    id: RequestId,
    rx: oneshot::Receiver<Bytes>,
}

impl Waiter {
    /// Id to put on the outbound frame.
    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// Pending-request table for one id space.
pub struct Correlator {
    origin: Origin,
    next_seq: AtomicU64,
    pending: Registry<u64, oneshot::Sender<Bytes>>,
}

impl Correlator {
    /// Table allocating ids of the given origin.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            next_seq: AtomicU64::new(0),
            pending: Registry::new(),
        }
    }

    /// Allocate an id and register its waiter.
    pub fn register(&self) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let id = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if let Some(id) = RequestId::new(self.origin, seq) {
                break id;
            }
            // Wrapped past i64::MAX; restart the sequence.
            self.next_seq.store(0, Ordering::Relaxed);
        };
        let _ = self.pending.set(id.seq(), tx);
        Waiter { id, rx }
    }

    /// Deliver an answer. Returns `false` if nobody is waiting for `id`
    /// (already timed out, or never issued by this side).
    pub fn resolve(&self, id: RequestId, payload: Bytes) -> bool {
        if id.origin() != self.origin {
            return false;
        }
        match self.pending.delete(&id.seq()) {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(request_id = %id, "answer without waiter dropped");
                false
            }
        }
    }

    /// Drop a waiter without an outcome (used when the send itself failed).
    pub fn cancel(&self, waiter: &Waiter) {
        let _ = self.pending.delete(&waiter.id.seq());
    }

    /// Wait for the answer to `waiter` for at most `timeout`.
    pub async fn wait(&self, waiter: Waiter, command: &str, timeout: Duration) -> Result<Bytes> {
        let Waiter { id, mut rx } = waiter;
        let timed_out = || Error::RequestTimeout {
            command: command.to_owned(),
            timeout,
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(timed_out()),
            Err(_) => {
                if self.pending.delete(&id.seq()).is_some() {
                    let origin = match self.origin {
                        Origin::Broker => "broker",
                        Origin::Client => "client",
                    };
                    metrics::counter!(REQUEST_TIMEOUTS_TOTAL, "origin" => origin).increment(1);
                    debug!(request_id = %id, command, "request timed out");
                    return Err(timed_out());
                }
                // The dispatcher won the race and removed the entry first;
                // its answer is already in the channel or about to be.
                rx.await.map_err(|_| timed_out())
            }
        }
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
