//! Correlation of outgoing requests with their eventual response, by request
//! handle. One [`ServiceOperation`] is registered per
//! in-flight request; the background receiver settles it exactly once,
//! whichever comes first — a matching response, the caller's own timeout, or
//! the channel faulting out from under it.
//!
//! Grounded on the real async-opcua client's `SecureChannelState`, which
//! keeps a `HashMap<u32, Request>` of oneshot senders awaiting completion.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, ServiceResultException, StatusCode};

/// A single in-flight request's completion slot. `settle` is safe to call
/// more than once; only the first call has any effect, mirroring a oneshot
/// channel's own at-most-once delivery.
pub struct ServiceOperation {
    reply: Mutex<Option<oneshot::Sender<Result<Vec<u8>>>>>,
}

impl ServiceOperation {
    fn new(reply: oneshot::Sender<Result<Vec<u8>>>) -> Self {
        Self { reply: Mutex::new(Some(reply)) }
    }

    pub fn settle(&self, result: Result<Vec<u8>>) {
        if let Some(reply) = self.reply.lock().take() {
            let _ = reply.send(result);
        }
    }
}

/// Table of requests awaiting a response, keyed by request handle.
#[derive(Default)]
pub struct PendingCompletions {
    operations: Mutex<HashMap<u32, ServiceOperation>>,
}

impl PendingCompletions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle and returns the receiver half the caller awaits.
    pub fn register(&self, handle: u32) -> oneshot::Receiver<Result<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        self.operations.lock().insert(handle, ServiceOperation::new(tx));
        rx
    }

    /// Settles and removes the operation registered under `handle`, if any.
    /// Silently does nothing for an unknown handle — the response either
    /// arrived twice (duplicate delivery) or after the caller already gave
    /// up, neither of which is an error at this layer.
    pub fn complete(&self, handle: u32, result: Result<Vec<u8>>) {
        if let Some(op) = self.operations.lock().remove(&handle) {
            op.settle(result);
        }
    }

    /// Removes and returns whether `handle` was still pending, without
    /// settling it — used when the caller's own future is dropped or timed
    /// out, so a later duplicate response doesn't try to satisfy a sender
    /// that's already gone.
    pub fn forget(&self, handle: u32) {
        self.operations.lock().remove(&handle);
    }

    /// Settles every pending operation with `error`, used when the channel
    /// faults or closes out from under in-flight requests.
    pub fn fail_all(&self, error: ServiceResultException) {
        let operations: Vec<ServiceOperation> = self.operations.lock().drain().map(|(_, op)| op).collect();
        for op in operations {
            op.settle(Err(error.clone()));
        }
    }

    /// Routes a response carrying request handle 0 — the fallback for
    /// servers that echo an all-zero handle instead of the one the client
    /// sent (spec.md §9's resolved open question). Only unambiguous when
    /// exactly one request is outstanding; returns `false` (and settles
    /// nothing) otherwise, since guessing wrong would deliver the wrong
    /// response to the wrong waiter.
    pub fn complete_handle_zero_fallback(&self, result: Result<Vec<u8>>) -> bool {
        let mut operations = self.operations.lock();
        if operations.len() != 1 {
            return false;
        }
        let handle = *operations.keys().next().expect("checked len == 1 above");
        let op = operations.remove(&handle).expect("just read this key from the map");
        drop(operations);
        op.settle(result);
        true
    }

    pub fn len(&self) -> usize {
        self.operations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `BadRequestTimeout` for a request handle that outlived its timeout hint.
pub fn timeout_error(handle: u32) -> ServiceResultException {
    ServiceResultException::new(StatusCode::BadRequestTimeout, format!("request {handle} timed out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_delivers_result_to_registered_receiver() {
        let pending = PendingCompletions::new();
        let rx = pending.register(7);
        pending.complete(7, Ok(vec![1, 2, 3]));
        assert_eq!(rx.await.unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn complete_on_unknown_handle_is_a_no_op() {
        let pending = PendingCompletions::new();
        pending.complete(42, Ok(vec![]));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fail_all_settles_every_pending_operation() {
        let pending = PendingCompletions::new();
        let rx1 = pending.register(1);
        let rx2 = pending.register(2);
        pending.fail_all(ServiceResultException::new(StatusCode::BadSecureChannelClosed, "closed"));
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn forget_drops_registration_without_settling() {
        let pending = PendingCompletions::new();
        let _rx = pending.register(9);
        pending.forget(9);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let pending = PendingCompletions::new();
        let rx = pending.register(3);
        pending.complete(3, Ok(vec![9]));
        // Second completion for the same (now-removed) handle is a no-op.
        pending.complete(3, Ok(vec![255]));
        assert_eq!(rx.await.unwrap().unwrap(), vec![9]);
    }
}
