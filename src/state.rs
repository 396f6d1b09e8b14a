//! The communication-object lifecycle shared by transport, channel and
//! session.
//!
//! A tempting design tracks a per-hook "base was called" boolean to catch
//! derived types that forget to chain up, but that leaves skipping the base
//! sequence one missed override away. This is avoided by construction:
//! `Lifecycle::open`/`close`/`abort`/`fault` are the only entry points, they
//! are not overridable, and they call the narrow `on_*` hooks in a fixed
//! order — there is no separate base step to forget.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ServiceResultException;

/// Lifecycle state of a transport connection, secure channel, or session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommunicationState::Closed)
    }
}

/// Narrow hook points a communication object implements. `StateMachine`
/// drives these in a fixed order; none of them are reachable except through
/// `StateMachine::open`/`close`/`abort`/`fault`.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn on_opening(&self) -> Result<(), ServiceResultException> {
        Ok(())
    }
    async fn on_open(&self) -> Result<(), ServiceResultException>;
    async fn on_opened(&self) {}

    async fn on_closing(&self) {}
    async fn on_close(&self) {}
    async fn on_closed(&self) {}

    async fn on_abort(&self) {}
    async fn on_faulted(&self, _error: &ServiceResultException) {}
}

/// Thread-safe state holder plus the transition engine. One instance is
/// shared by whichever component owns the lifecycle (transport, channel, or
/// session).
pub struct StateMachine {
    state: Mutex<CommunicationState>,
    publisher: watch::Sender<CommunicationState>,
    pending_fault: Mutex<Option<ServiceResultException>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(CommunicationState::Created);
        Self {
            state: Mutex::new(CommunicationState::Created),
            publisher,
            pending_fault: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CommunicationState {
        self.state.lock().clone()
    }

    /// Subscribes to state changes. New subscribers immediately observe the
    /// current state (last-value caching), then every subsequent change,
    /// with duplicates collapsed by `watch`'s change-detection.
    pub fn subscribe(&self) -> watch::Receiver<CommunicationState> {
        self.publisher.subscribe()
    }

    fn set(&self, next: CommunicationState) {
        *self.state.lock() = next.clone();
        let _ = self.publisher.send(next);
    }

    /// Returns and clears any exception queued by a prior `fault()`: the
    /// next user-facing call surfaces the fault.
    pub fn take_pending_fault(&self) -> Option<ServiceResultException> {
        self.pending_fault.lock().take()
    }

    pub async fn open(&self, object: &dyn Lifecycle) -> Result<(), ServiceResultException> {
        {
            let mut state = self.state.lock();
            if *state != CommunicationState::Created {
                return Err(ServiceResultException::new(
                    crate::error::StatusCode::BadServerNotConnected,
                    format!("open() requires Created, found {:?}", *state),
                ));
            }
            *state = CommunicationState::Opening;
        }
        self.set(CommunicationState::Opening);

        let result = async {
            object.on_opening().await?;
            object.on_open().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set(CommunicationState::Opened);
                object.on_opened().await;
                Ok(())
            }
            Err(err) => {
                self.fault_with(object, err.clone()).await;
                Err(err)
            }
        }
    }

    pub async fn close(&self, object: &dyn Lifecycle) {
        let current = self.state();
        match current {
            CommunicationState::Opened => {
                self.set(CommunicationState::Closing);
                object.on_closing().await;
                object.on_close().await;
                self.set(CommunicationState::Closed);
                object.on_closed().await;
            }
            CommunicationState::Created | CommunicationState::Opening | CommunicationState::Faulted => {
                self.abort(object).await;
            }
            CommunicationState::Closing | CommunicationState::Closed => {
                debug!("close() on already-{:?} state is a no-op", current);
            }
        }
    }

    pub async fn abort(&self, object: &dyn Lifecycle) {
        self.set(CommunicationState::Closing);
        object.on_closing().await;
        object.on_abort().await;
        self.set(CommunicationState::Closed);
        object.on_closed().await;
    }

    pub async fn fault(&self, object: &dyn Lifecycle, error: ServiceResultException) {
        self.fault_with(object, error).await;
    }

    async fn fault_with(&self, object: &dyn Lifecycle, error: ServiceResultException) {
        warn!(code = %error.code, reason = %error.reason, "communication object faulted");
        *self.pending_fault.lock() = Some(error.clone());
        self.set(CommunicationState::Faulted);
        object.on_faulted(&error).await;
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
