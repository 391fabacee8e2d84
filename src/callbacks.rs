// =============================================================================
// PENDING-CALLBACK REGISTRY
// =============================================================================
// Bridges the provider webhook (asynchronous, inbound) to the HTTP request
// that initiated the payment and is suspended waiting for it.
//
// One waiter per merchant reference. Resolution (webhook) and expiry
// (timeout) race for the same entry; removing it from the map is the single
// point of mutation, so whichever side removes it first wins and the other
// becomes a no-op:
// - resolver wins: the payload is delivered, even if the timeout fires
//   while it is in flight
// - timeout wins: a late resolve finds nothing and returns false
//
// LEARNING NOTE:
// A waiter is registered *before* the provider is contacted, so a webhook
// that arrives faster than the provider's HTTP response is not missed; the
// oneshot channel buffers the payload until `wait` polls it.
// =============================================================================

use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{AppError, AppResult};

struct Waiter<T> {
    /// Distinguishes successive waiters on the same reference
    id: u64,
    sender: oneshot::Sender<T>,
}

/// Told the number of waiters after every registration and removal
type SizeObserver = Box<dyn Fn(usize) + Send + Sync>;

pub struct CallbackRegistry<T> {
    waiters: DashMap<String, Waiter<T>>,
    next_id: AtomicU64,
    on_size_change: Option<SizeObserver>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self {
            waiters: DashMap::new(),
            next_id: AtomicU64::new(1),
            on_size_change: None,
        }
    }
}

impl<T: Send + 'static> CallbackRegistry<T> {
    /// Registry that reports its size on every change (the pending gauge).
    pub fn observed(observer: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self {
            on_size_change: Some(Box::new(observer)),
            ..Self::default()
        }
    }

    fn size_changed(&self) {
        if let Some(observer) = &self.on_size_change {
            observer(self.waiters.len());
        }
    }

    /// Register the single waiter for `reference`.
    ///
    /// # Errors
    /// `DuplicateWaiter` if another waiter already holds the reference;
    /// callers generate a fresh reference per attempt.
    pub fn register(self: &Arc<Self>, reference: &str) -> AppResult<PendingCallback<T>> {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match self.waiters.entry(reference.to_string()) {
            Entry::Occupied(_) => return Err(AppError::DuplicateWaiter(reference.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Waiter { id, sender });
            }
        }
        self.size_changed();

        tracing::debug!(reference, "Waiter registered");

        Ok(PendingCallback {
            reference: reference.to_string(),
            id,
            receiver,
            registry: Arc::clone(self),
        })
    }

    /// Register and wait in one call.
    pub async fn await_callback(self: &Arc<Self>, reference: &str, timeout: Duration) -> AppResult<T> {
        self.register(reference)?.wait(timeout).await
    }

    /// Hand `payload` to the waiter of `reference`, if there is one.
    ///
    /// Returns `false` when nobody is waiting (timed out, never registered,
    /// or already resolved).
    pub fn resolve(&self, reference: &str, payload: T) -> bool {
        match self.waiters.remove(reference) {
            Some((_, waiter)) => {
                self.size_changed();
                waiter.sender.send(payload).is_ok()
            }
            None => false,
        }
    }

    /// Number of suspended callers
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    #[cfg(test)]
    pub fn references(&self) -> Vec<String> {
        self.waiters.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove the entry only if it still belongs to waiter `id`.
    fn remove_own(&self, reference: &str, id: u64) -> bool {
        let removed = self
            .waiters
            .remove_if(reference, |_, waiter| waiter.id == id)
            .is_some();
        if removed {
            self.size_changed();
        }
        removed
    }
}

// -----------------------------------------------------------------------------
// PENDING CALLBACK HANDLE
// -----------------------------------------------------------------------------
/// A registered waiter. Dropping it (e.g. the client disconnected and the
/// request future was cancelled) removes its registry entry.
pub struct PendingCallback<T: Send + 'static> {
    reference: String,
    id: u64,
    receiver: oneshot::Receiver<T>,
    registry: Arc<CallbackRegistry<T>>,
}

impl<T: Send + 'static> PendingCallback<T> {
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Suspend until resolved or until `timeout` elapses.
    ///
    /// # Errors
    /// `CallbackTimeout` carrying the reference, so the caller can poll later.
    pub async fn wait(mut self, timeout: Duration) -> AppResult<T> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(AppError::Internal(format!(
                "Waiter for {} was dropped without a payload",
                self.reference
            ))),
            Err(_) => {
                if self.registry.remove_own(&self.reference, self.id) {
                    tracing::warn!(reference = %self.reference, "Waiter timed out");
                    return Err(AppError::CallbackTimeout {
                        reference: self.reference.clone(),
                    });
                }

                // The resolver removed the entry first: its send is done or
                // about to be, so this await is bounded.
                (&mut self.receiver)
                    .await
                    .map_err(|_| AppError::CallbackTimeout {
                        reference: self.reference.clone(),
                    })
            }
        }
    }
}

impl<T: Send + 'static> Drop for PendingCallback<T> {
    fn drop(&mut self) {
        self.registry.remove_own(&self.reference, self.id);
    }
}
