//! The billing backend seen from the bridge: response codes, SKU records and the
//! session traits a platform implements.

use std::fmt;
use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// Note: Keep these in sync with `BillingClient.BillingResponseCode`.
/// Response codes reported by the billing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingResponseCode {
    ServiceTimeout,
    FeatureNotSupported,
    ServiceDisconnected,
    Ok,
    UserCanceled,
    ServiceUnavailable,
    BillingUnavailable,
    ItemUnavailable,
    DeveloperError,
    Error,
    ItemAlreadyOwned,
    ItemNotOwned,
    /// A code this crate does not know about yet.
    Unknown(i32),
}

impl BillingResponseCode {
    pub fn code(self) -> i32 {
        match self {
            Self::ServiceTimeout => -3,
            Self::FeatureNotSupported => -2,
            Self::ServiceDisconnected => -1,
            Self::Ok => 0,
            Self::UserCanceled => 1,
            Self::ServiceUnavailable => 2,
            Self::BillingUnavailable => 3,
            Self::ItemUnavailable => 4,
            Self::DeveloperError => 5,
            Self::Error => 6,
            Self::ItemAlreadyOwned => 7,
            Self::ItemNotOwned => 8,
            Self::Unknown(code) => code,
        }
    }

    /// Classifies the code for the lookup and purchase-initiation flows.
    pub fn disposition(self) -> Disposition {
        match self {
            Self::Ok => Disposition::Success,
            Self::UserCanceled
            | Self::FeatureNotSupported
            | Self::ItemAlreadyOwned
            | Self::ItemNotOwned => Disposition::Unexpected,
            Self::ServiceTimeout
            | Self::ServiceDisconnected
            | Self::ServiceUnavailable
            | Self::BillingUnavailable
            | Self::ItemUnavailable
            | Self::DeveloperError
            | Self::Error
            | Self::Unknown(_) => Disposition::Transient,
        }
    }
}

impl From<i32> for BillingResponseCode {
    fn from(code: i32) -> Self {
        match code {
            -3 => Self::ServiceTimeout,
            -2 => Self::FeatureNotSupported,
            -1 => Self::ServiceDisconnected,
            0 => Self::Ok,
            1 => Self::UserCanceled,
            2 => Self::ServiceUnavailable,
            3 => Self::BillingUnavailable,
            4 => Self::ItemUnavailable,
            5 => Self::DeveloperError,
            6 => Self::Error,
            7 => Self::ItemAlreadyOwned,
            8 => Self::ItemNotOwned,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for BillingResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServiceTimeout => "SERVICE_TIMEOUT",
            Self::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            Self::ServiceDisconnected => "SERVICE_DISCONNECTED",
            Self::Ok => "OK",
            Self::UserCanceled => "USER_CANCELED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::BillingUnavailable => "BILLING_UNAVAILABLE",
            Self::ItemUnavailable => "ITEM_UNAVAILABLE",
            Self::DeveloperError => "DEVELOPER_ERROR",
            Self::Error => "ERROR",
            Self::ItemAlreadyOwned => "ITEM_ALREADY_OWNED",
            Self::ItemNotOwned => "ITEM_NOT_OWNED",
            Self::Unknown(code) => return write!(f, "UNKNOWN({code})"),
        };
        f.write_str(name)
    }
}

/// How the reconciler treats a backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    /// The service is unreachable or refused the request. The attempt is abandoned.
    Transient,
    /// A code that makes no sense for a lookup or a fresh purchase. The attempt is
    /// abandoned the same way, but the occurrence points at a bug somewhere.
    Unexpected,
}

/// A response code together with the backend's debug message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingResult {
    pub code: BillingResponseCode,
    pub debug_message: String,
}

impl BillingResult {
    pub fn new(code: impl Into<BillingResponseCode>, debug_message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            debug_message: debug_message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(BillingResponseCode::Ok, "")
    }

    pub fn disposition(&self) -> Disposition {
        self.code.disposition()
    }
}

impl fmt::Display for BillingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.code.code())?;
        if !self.debug_message.is_empty() {
            write!(f, " {}", self.debug_message)?;
        }
        Ok(())
    }
}

/// The kind of SKU a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkuType {
    Subs,
    InApp,
}

impl SkuType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subs => "subs",
            Self::InApp => "inapp",
        }
    }
}

/// The backend's record for one SKU.
///
/// This follows the JSON the Play Billing library exposes as `SkuDetails.originalJson`.
/// Only the fields that end up in a [`PlatformOffer`](crate::catalog::PlatformOffer) are
/// required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuDetails {
    #[serde(rename = "productId", alias = "sku")]
    pub sku: String,
    #[serde(rename = "type", default)]
    pub sku_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: String,
    #[serde(default)]
    pub price_amount_micros: i64,
    pub price_currency_code: String,
    #[serde(rename = "subscriptionPeriod", default)]
    pub subscription_period: String,
}

/// The answer to a SKU query. `details` is `None` when the backend handed back no list
/// at all, which it may do even for an `OK` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkuDetailsResponse {
    pub result: BillingResult,
    pub details: Option<Vec<SkuDetails>>,
}

impl SkuDetailsResponse {
    /// Builds a response from the JSON array of `originalJson` records a backend hands
    /// over, or `None` if it had no list.
    ///
    /// A payload that doesn't decode turns the response into an `ERROR`, whatever
    /// the backend reported.
    pub fn from_json(result: BillingResult, details_json: Option<&str>) -> Self {
        let Some(json) = details_json else {
            return Self {
                result,
                details: None,
            };
        };

        match serde_json::from_str::<Vec<SkuDetails>>(json) {
            Ok(details) => Self {
                result,
                details: Some(details),
            },
            Err(e) => {
                log::error!("malformed sku details from the billing backend: {}", e);
                Self {
                    result: BillingResult::new(
                        BillingResponseCode::Error,
                        format!("malformed sku details: {}", e),
                    ),
                    details: None,
                }
            }
        }
    }
}

/// Creates one [`BillingSession`] per reconciliation attempt.
pub trait BillingBackend: Send + Sync {
    type Session: BillingSession;

    /// Builds a fresh, not yet connected session.
    fn new_session(&self) -> Self::Session;
}

/// One connection to the billing backend.
///
/// Every method completes when the backend has answered, which may happen on a
/// thread owned by the backend.
#[async_trait]
pub trait BillingSession: Send {
    /// Whatever the backend needs to show its purchase UI on top of, such as an
    /// Android `Activity`.
    type Presentation: Sync + ?Sized;

    async fn start_connection(&mut self) -> BillingResult;

    async fn query_sku_details(
        &mut self,
        skus: Vec<String>,
        sku_type: SkuType,
    ) -> SkuDetailsResponse;

    async fn launch_billing_flow(
        &mut self,
        details: &SkuDetails,
        presentation: &Self::Presentation,
    ) -> BillingResult;

    /// Releases the connection. Must be safe to call on a session whose setup failed.
    fn end_connection(&mut self);
}

/// Owns a session and ends its connection when dropped, whichever way the attempt
/// finishes.
pub struct SessionGuard<S: BillingSession> {
    session: S,
}

impl<S: BillingSession> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }
}

impl<S: BillingSession> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S: BillingSession> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: BillingSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        log::debug!("ending billing connection");
        self.session.end_connection();
    }
}
