//! Per-request completion slots.
//!
//! The gateway registers a one-shot slot under its [`RequestId`] before
//! publishing and waits on it; the coordinator completes the slot with the
//! request's [`CompletionSignal`]. Dropping a [`PendingSlot`] (timeout,
//! client disconnect, publish failure) releases it, after which a late signal
//! for that id finds no slot and is discarded.

use std::sync::Arc;

use dashmap::DashMap;
use ffm_core::RequestId;
use tokio::sync::oneshot;

use super::error::CompletionSignal;

/// Concurrent map of open completion slots.
#[derive(Debug, Default)]
pub struct PendingCompletions {
    slots: DashMap<RequestId, oneshot::Sender<CompletionSignal>>,
}

impl PendingCompletions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `request_id`.
    #[must_use]
    pub fn register(self: &Arc<Self>, request_id: RequestId) -> PendingSlot {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(request_id, tx);
        PendingSlot {
            request_id,
            rx,
            owner: Arc::clone(self),
        }
    }

    /// Deliver `signal` to its waiting caller.
    ///
    /// Returns `false` when no caller is waiting any more.
    pub fn complete(&self, signal: CompletionSignal) -> bool {
        match self.slots.remove(&signal.request_id) {
            Some((_, tx)) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Receiving end of one completion slot. Releases the slot when dropped.
#[derive(Debug)]
pub struct PendingSlot {
    request_id: RequestId,
    rx: oneshot::Receiver<CompletionSignal>,
    owner: Arc<PendingCompletions>,
}

impl PendingSlot {
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the signal. `None` if the slot was closed without one.
    pub async fn wait(mut self) -> Option<CompletionSignal> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.owner.slots.remove(&self.request_id);
    }
}
