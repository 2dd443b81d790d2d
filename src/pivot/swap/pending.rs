use std::{fmt, time::Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::pivot::swap::{SwapError, protocol::RequestId, stream::DuplexStream};

pub type SwapResult = Result<DuplexStream, SwapError>;

struct PendingEntry {
    tx: oneshot::Sender<SwapResult>,
    created_at: Instant,
}

/// In-flight swaps keyed by request id.
///
/// The map removal is the linearization point: whichever of `fulfil` and
/// `expire` removes the entry resolves its future, the loser is a no-op.
/// Entries are inserted by the awaiting side and removed exactly once.
pub struct PendingSwaps {
    entries: DashMap<RequestId, PendingEntry>,
}

impl fmt::Debug for PendingSwaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSwaps")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingSnapshot {
    pub id: String,
    pub age_ms: u64,
}

impl PendingSwaps {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Inserts a fresh entry and hands back the future exactly one resolver
    /// will complete. Ids are random 128-bit values, so a collision means a
    /// bug upstream; it is still refused rather than clobbered.
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<SwapResult>, SwapError> {
        let (tx, rx) = oneshot::channel();
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(SwapError::DuplicateId),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    tx,
                    created_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Atomically removes and resolves the entry with `stream`. If the id is
    /// absent (expired, already fulfilled, or never registered) — or the
    /// awaiting side is already gone — the stream is handed back untouched so
    /// the caller can close it.
    pub fn fulfil(&self, id: &RequestId, stream: DuplexStream) -> Result<(), DuplexStream> {
        let Some((_id, entry)) = self.entries.remove(id) else {
            return Err(stream);
        };
        match entry.tx.send(Ok(stream)) {
            Ok(()) => Ok(()),
            Err(Ok(stream)) => Err(stream),
            Err(Err(_)) => unreachable!("fulfil only ever sends a stream"),
        }
    }

    /// Timeout path: removes the entry if still present and resolves its
    /// future with [`SwapError::Timeout`]. Returns false when `fulfil` (or
    /// `cancel`) already won the removal.
    pub fn expire(&self, id: &RequestId) -> bool {
        let Some((_id, entry)) = self.entries.remove(id) else {
            return false;
        };
        let _ = entry.tx.send(Err(SwapError::Timeout));
        true
    }

    /// Awaiting-side cleanup; idempotent, no-op once the entry is gone.
    pub fn cancel(&self, id: &RequestId) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let mut out = Vec::with_capacity(self.entries.len());
        for e in self.entries.iter() {
            out.push(PendingSnapshot {
                id: e.key().to_string(),
                age_ms: e.value().created_at.elapsed().as_millis() as u64,
            });
        }
        out.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        out
    }
}
