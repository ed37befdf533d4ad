use std::time::Duration;

use thiserror::Error;

use crate::billing::BillingResult;
use crate::reconciler::Stage;

/// Everything that can end a reconciliation attempt without a result.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller handed over a catalog that breaks the bridge's input contract.
    ///
    /// These are returned before the billing backend is touched.
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// The backend answered with a transient or service-level failure.
    #[error("billing backend unavailable during {stage}: {result}")]
    Unavailable { stage: Stage, result: BillingResult },

    /// The backend answered with a code that should never occur for this flow.
    #[error("unexpected billing response during {stage}: {result}")]
    Unexpected { stage: Stage, result: BillingResult },

    #[error("billing backend did not answer during {stage} within {timeout:?}")]
    TimedOut { stage: Stage, timeout: Duration },

    #[error("expected {expected} offer(s) for the purchase but the backend returned {found}")]
    UnexpectedOfferCount { expected: usize, found: usize },

    #[error("a purchase is already in progress")]
    PurchaseInProgress,

    #[error("failed to serialize the platform catalog: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if issuing the same call again later may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Contract(_) | Error::Serialization(_))
    }
}

/// Programming errors on the caller's side of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("catalog argument could not be read: {0}")]
    Unreadable(String),

    #[error("catalog does not match the expected shape: {0}")]
    Malformed(String),

    #[error("product at index {index} has an empty id")]
    EmptyProductId { index: usize },

    #[error("a purchase needs exactly one product, got {count}")]
    PurchaseCatalogSize { count: usize },
}
