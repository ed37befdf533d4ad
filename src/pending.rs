//! Routes the answers of a callback-based billing backend to the session waiting
//! for them.
//!
//! A session registers the request it is about to issue under its handle and awaits
//! the returned receiver. The backend's listeners answer later, from their own threads,
//! by handle only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::billing::{BillingResponseCode, BillingResult, SkuDetailsResponse};

/// Identifies one backend session on both sides of the bridge.
pub(crate) type Handle = i64;

/// The answer a session is waiting for. A session has at most one request in
/// flight, since its stages run one after the other.
enum Pending {
    Setup(oneshot::Sender<BillingResult>),
    SkuDetails(oneshot::Sender<SkuDetailsResponse>),
    Launch(oneshot::Sender<BillingResult>),
}

/// What became of a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    /// The waiting request got its answer.
    Answered,
    /// The session waits for a different answer, and keeps waiting.
    Mismatched,
    /// Nobody waits on this handle anymore.
    Finished,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    waiting: Mutex<HashMap<Handle, Pending>>,
}

impl PendingRequests {
    fn waiting(&self) -> MutexGuard<'_, HashMap<Handle, Pending>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn expect_setup(&self, handle: Handle) -> oneshot::Receiver<BillingResult> {
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(handle, Pending::Setup(tx));
        rx
    }

    pub(crate) fn expect_sku_details(
        &self,
        handle: Handle,
    ) -> oneshot::Receiver<SkuDetailsResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(handle, Pending::SkuDetails(tx));
        rx
    }

    pub(crate) fn expect_launch(&self, handle: Handle) -> oneshot::Receiver<BillingResult> {
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(handle, Pending::Launch(tx));
        rx
    }

    /// Drops whatever `handle` waits for. Its receiver sees the channel close.
    pub(crate) fn forget(&self, handle: Handle) {
        self.waiting().remove(&handle);
    }

    pub(crate) fn setup_finished(&self, handle: Handle, result: BillingResult) -> Routed {
        self.answer(handle, "onBillingSetupFinished", |pending| match pending {
            Pending::Setup(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            other => Err(other),
        })
    }

    pub(crate) fn sku_details_received(
        &self,
        handle: Handle,
        response: SkuDetailsResponse,
    ) -> Routed {
        self.answer(handle, "onSkuDetailsResponse", |pending| match pending {
            Pending::SkuDetails(tx) => {
                let _ = tx.send(response);
                Ok(())
            }
            other => Err(other),
        })
    }

    pub(crate) fn flow_launched(&self, handle: Handle, result: BillingResult) -> Routed {
        self.answer(handle, "onBillingFlowLaunched", |pending| match pending {
            Pending::Launch(tx) => {
                let _ = tx.send(result);
                Ok(())
            }
            other => Err(other),
        })
    }

    /// The backend dropped the connection on its own: whatever the session waits
    /// for won't come, so it gets `SERVICE_DISCONNECTED` instead.
    pub(crate) fn disconnected(&self, handle: Handle) -> Routed {
        let disconnected = || {
            BillingResult::new(
                BillingResponseCode::ServiceDisconnected,
                "billing service disconnected",
            )
        };

        self.answer(handle, "onBillingServiceDisconnected", |pending| {
            match pending {
                Pending::Setup(tx) | Pending::Launch(tx) => {
                    let _ = tx.send(disconnected());
                }
                Pending::SkuDetails(tx) => {
                    let _ = tx.send(SkuDetailsResponse {
                        result: disconnected(),
                        details: None,
                    });
                }
            }
            Ok(())
        })
    }

    fn answer<F>(&self, handle: Handle, callback: &str, deliver: F) -> Routed
    where
        F: FnOnce(Pending) -> Result<(), Pending>,
    {
        let mut waiting = self.waiting();
        let Some(pending) = waiting.remove(&handle) else {
            log::debug!("{} for finished session {}", callback, handle);
            return Routed::Finished;
        };

        match deliver(pending) {
            Ok(()) => Routed::Answered,
            Err(other) => {
                log::error!(
                    "{} does not answer the request pending on session {}",
                    callback,
                    handle
                );
                waiting.insert(handle, other);
                Routed::Mismatched
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.waiting().len()
    }
}
