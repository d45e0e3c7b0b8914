/// Pending-call registry.
///
/// Tracks in-flight calls keyed by correlation id and fulfills each at
/// most once: resolution, rejection, expiry and cancellation all vacate
/// the slot, and whichever happens first is authoritative. Replies are
/// matched purely by id — out-of-order delivery is expected.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::types::{CorrelationId, PeerId};

/// Maximum number of in-flight calls (DoS protection).
const MAX_PENDING: usize = 10_000;

struct PendingEntry {
    peer: PeerId,
    deadline: Instant,
    tx: oneshot::Sender<Result<Envelope, ProtocolError>>,
}

/// The caller's half of a registered call. Await it to get the reply.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<Envelope, ProtocolError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the reply. A vacated slot (cancellation won the race)
    /// surfaces as `Cancelled`.
    pub async fn wait(self) -> Result<Envelope, ProtocolError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::Cancelled(self.correlation_id)),
        }
    }
}

/// In-flight call table for one session. Interior mutability so the
/// inbound-message handler and callers can share it behind an `Arc`.
pub struct PendingCalls {
    inner: Mutex<HashMap<CorrelationId, PendingEntry>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a call. The timeout is mandatory — there is no
    /// unbounded-wait default.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        peer: PeerId,
        timeout: Duration,
    ) -> Result<PendingReply, ProtocolError> {
        let mut table = self.inner.lock().expect("pending-call lock poisoned");

        if table.contains_key(&correlation_id) {
            return Err(ProtocolError::DuplicateCorrelationId(correlation_id));
        }
        if table.len() >= MAX_PENDING {
            Self::sweep(&mut table, Instant::now());
            if table.len() >= MAX_PENDING {
                return Err(ProtocolError::PendingTableFull);
            }
        }

        let (tx, rx) = oneshot::channel();
        table.insert(
            correlation_id.clone(),
            PendingEntry {
                peer,
                deadline: Instant::now() + timeout,
                tx,
            },
        );

        Ok(PendingReply { correlation_id, rx })
    }

    /// Fulfill the call matching `promise_id` with a reply envelope.
    ///
    /// Returns `false` for a late or unknown reply, which is dropped and
    /// logged — the originating caller already received its timeout.
    pub fn resolve(&self, promise_id: &CorrelationId, envelope: Envelope) -> bool {
        match self.take(promise_id) {
            Some(entry) => {
                let _ = entry.tx.send(Ok(envelope));
                true
            }
            None => {
                tracing::debug!("dropping late or unknown reply for {promise_id}");
                false
            }
        }
    }

    /// Fulfill the call matching `promise_id` with a failure outcome.
    pub fn reject(&self, promise_id: &CorrelationId, error: ProtocolError) -> bool {
        match self.take(promise_id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(error));
                true
            }
            None => {
                tracing::debug!("dropping late or unknown error reply for {promise_id}");
                false
            }
        }
    }

    /// Caller-side cancellation. Idempotent against a racing
    /// resolution — whichever wins first is authoritative.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.take(correlation_id).is_some()
    }

    /// Fulfill every entry past its deadline with `Timeout` and vacate
    /// the slot. Returns how many expired.
    pub fn expire(&self) -> usize {
        let mut table = self.inner.lock().expect("pending-call lock poisoned");
        Self::sweep(&mut table, Instant::now())
    }

    /// Reject every pending call addressed to `peer` with
    /// `ConnectionLost` (disconnect cascade).
    pub fn reject_peer(&self, peer: &PeerId) -> usize {
        let mut table = self.inner.lock().expect("pending-call lock poisoned");
        let lost: Vec<CorrelationId> = table
            .iter()
            .filter(|(_, entry)| &entry.peer == peer)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            if let Some(entry) = table.remove(id) {
                let _ = entry.tx.send(Err(ProtocolError::ConnectionLost(peer.clone())));
            }
        }
        lost.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending-call lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn take(&self, correlation_id: &CorrelationId) -> Option<PendingEntry> {
        self.inner
            .lock()
            .expect("pending-call lock poisoned")
            .remove(correlation_id)
    }

    fn sweep(table: &mut HashMap<CorrelationId, PendingEntry>, now: Instant) -> usize {
        let expired: Vec<CorrelationId> = table
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = table.remove(id) {
                let _ = entry.tx.send(Err(ProtocolError::Timeout(id.clone())));
            }
        }
        expired.len()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
