//! Reconciles a canonical catalog with the billing backend.
//!
//! Each call to [`Reconciler::lookup_offers`] or [`Reconciler::purchase`] is one
//! attempt: a short sequence of backend stages (connect, query, and for purchases,
//! launch) that moves an [`Attempt`] through its [`State`]s. Attempts own all of
//! their data, so concurrent calls never see each other's partial catalogs.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::billing::{
    BillingBackend, BillingResult, BillingSession, Disposition, SessionGuard, SkuDetails, SkuType,
};
use crate::catalog::{CanonicalCatalog, PlatformCatalog, PlatformOffer};
use crate::error::Error;

/// How long a single backend stage may take before the attempt is abandoned.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// The presentation context a [`Reconciler`] over `B` needs for purchases.
pub type Presentation<B> = <<B as BillingBackend>::Session as BillingSession>::Presentation;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub stage_timeout: Duration,
    /// The SKU type every lookup asks for.
    pub sku_type: SkuType,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            sku_type: SkuType::Subs,
        }
    }
}

/// The consumer of reconciled catalogs, on the other side of the bridge.
pub trait CatalogSink: Send + Sync {
    /// Receives the serialized [`PlatformCatalog`] of a successful lookup.
    fn deliver(&self, catalog_json: &str);

    /// Called once for every attempt that ended with an error after its input was accepted.
    fn report_failure(&self, _error: &Error) {}
}

impl<T: CatalogSink + ?Sized> CatalogSink for Arc<T> {
    fn deliver(&self, catalog_json: &str) {
        (**self).deliver(catalog_json)
    }

    fn report_failure(&self, error: &Error) {
        (**self).report_failure(error)
    }
}

/// How an attempt that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A catalog with this many offers was handed to the [`CatalogSink`].
    Delivered { offers: usize },
    /// The backend's purchase flow is now showing this offer.
    PurchaseLaunched(PlatformOffer),
    /// The backend recognized none of the requested products.
    NotFound,
}

/// The backend stage an error happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    QueryOffers,
    LaunchPurchase,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Connect => "billing setup",
            Stage::QueryOffers => "sku details query",
            Stage::LaunchPurchase => "billing flow launch",
        })
    }
}

/// Where an attempt is in its sequence of backend stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    QueryingOffers,
    Purchasing,
    Delivered,
    Launched,
    Abandoned,
}

/// What moves an attempt from one [`State`] to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Begin,
    Connected,
    /// A lookup mapped the backend's records into a catalog.
    OffersMapped,
    /// A purchase found its single offer.
    OfferSelected,
    NothingFound,
    PurchaseLaunched,
    Failed,
}

impl State {
    /// Returns the state `event` leads to, or `None` if it can't happen in this one.
    pub fn on(self, event: Event) -> Option<State> {
        use Event::*;
        use State::*;

        match (self, event) {
            (Idle, Begin) => Some(Connecting),
            (Connecting, Connected) => Some(QueryingOffers),
            (QueryingOffers, OffersMapped) => Some(Delivered),
            (QueryingOffers, OfferSelected) => Some(Purchasing),
            (QueryingOffers, NothingFound) => Some(Abandoned),
            (Purchasing, PurchaseLaunched) => Some(Launched),
            (state, Failed) if !state.is_terminal() => Some(Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Delivered | State::Launched | State::Abandoned)
    }
}

/// The request-scoped data of one reconciliation.
struct Attempt {
    catalog: CanonicalCatalog,
    state: State,
    offers: PlatformCatalog,
}

impl Attempt {
    fn new(catalog: CanonicalCatalog) -> Self {
        Self {
            catalog,
            state: State::Idle,
            offers: PlatformCatalog::default(),
        }
    }

    fn advance(&mut self, event: Event) {
        match self.state.on(event) {
            Some(next) => {
                log::trace!("{:?} --{:?}--> {:?}", self.state, event, next);
                self.state = next;
            }
            None => {
                log::error!("invalid event {:?} in state {:?}", event, self.state);
                self.state = State::Abandoned;
            }
        }
    }

    /// Drops records for products that were never asked for.
    fn retain_requested(&self, details: Vec<SkuDetails>) -> Vec<SkuDetails> {
        details
            .into_iter()
            .filter(|d| {
                let requested = self.catalog.find(&d.sku).is_some();
                if !requested {
                    log::warn!("ignoring unrequested sku from billing backend: {}", d.sku);
                }
                requested
            })
            .collect()
    }
}

/// Clears the purchase flag when the purchase attempt ends.
struct PurchaseInFlight<'a>(&'a AtomicBool);

impl<'a> PurchaseInFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for PurchaseInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves canonical catalogs against a [`BillingBackend`] and hands the results to
/// a [`CatalogSink`].
pub struct Reconciler<B, S> {
    backend: B,
    sink: S,
    config: ReconcilerConfig,
    purchase_in_flight: AtomicBool,
}

impl<B: BillingBackend, S: CatalogSink> Reconciler<B, S> {
    pub fn new(backend: B, sink: S, config: ReconcilerConfig) -> Self {
        Self {
            backend,
            sink,
            config,
            purchase_in_flight: AtomicBool::new(false),
        }
    }

    /// Looks up the offers for every product in `serialized_catalog` and delivers the
    /// serialized [`PlatformCatalog`] to the sink.
    ///
    /// # Errors
    ///
    /// A catalog that does not decode is returned as [`Error::Contract`] before the
    /// backend is contacted. Backend failures abandon the attempt without delivering
    /// anything; there is no retry.
    pub async fn lookup_offers(&self, serialized_catalog: &str) -> Result<Outcome, Error> {
        log_catalog("lookup request", serialized_catalog);
        let catalog = CanonicalCatalog::decode(serialized_catalog)?;
        self.lookup_catalog(catalog).await
    }

    /// Same as [`Reconciler::lookup_offers`], for an already decoded catalog.
    pub async fn lookup_catalog(&self, catalog: CanonicalCatalog) -> Result<Outcome, Error> {
        if catalog.is_empty() {
            log::warn!("no products to look up");
            return Ok(Outcome::NotFound);
        }

        if let Some(featured) = catalog.featured() {
            log::debug!("featured product: {}", featured.id);
        }

        let mut attempt = Attempt::new(catalog);
        let result = self.lookup(&mut attempt).await;
        self.finish(&mut attempt, result)
    }

    /// Starts the backend's purchase flow for the single product in
    /// `serialized_catalog`, shown on top of `presentation`.
    ///
    /// Nothing is delivered to the sink: the purchase itself completes through the
    /// backend's own listeners.
    ///
    /// # Errors
    ///
    /// A catalog that does not decode, or does not hold exactly one product, is
    /// returned as [`Error::Contract`] before the backend is contacted. Only one
    /// purchase may run at a time.
    pub async fn purchase(
        &self,
        serialized_catalog: &str,
        presentation: &Presentation<B>,
    ) -> Result<Outcome, Error> {
        log_catalog("purchase request", serialized_catalog);
        let catalog = CanonicalCatalog::decode(serialized_catalog)?;
        self.purchase_catalog(catalog, presentation).await
    }

    /// Same as [`Reconciler::purchase`], for an already decoded catalog.
    pub async fn purchase_catalog(
        &self,
        catalog: CanonicalCatalog,
        presentation: &Presentation<B>,
    ) -> Result<Outcome, Error> {
        catalog.single()?;

        let _in_flight = match PurchaseInFlight::acquire(&self.purchase_in_flight) {
            Some(guard) => guard,
            None => {
                log::warn!("refusing to start a second purchase");
                let error = Error::PurchaseInProgress;
                self.sink.report_failure(&error);
                return Err(error);
            }
        };

        let mut attempt = Attempt::new(catalog);
        let result = self.buy(&mut attempt, presentation).await;
        self.finish(&mut attempt, result)
    }

    async fn lookup(&self, attempt: &mut Attempt) -> Result<Outcome, Error> {
        let mut session = SessionGuard::new(self.backend.new_session());
        let details = self.fetch_offers(attempt, &mut session).await?;

        attempt
            .offers
            .products
            .extend(details.into_iter().map(PlatformOffer::from));
        if attempt.offers.is_empty() {
            attempt.advance(Event::NothingFound);
            return Ok(Outcome::NotFound);
        }

        let encoded = attempt.offers.encode()?;
        attempt.advance(Event::OffersMapped);

        log_catalog("platform catalog", &encoded);
        self.sink.deliver(&encoded);

        Ok(Outcome::Delivered {
            offers: attempt.offers.len(),
        })
    }

    async fn buy(
        &self,
        attempt: &mut Attempt,
        presentation: &Presentation<B>,
    ) -> Result<Outcome, Error> {
        let mut session = SessionGuard::new(self.backend.new_session());
        let mut details = self.fetch_offers(attempt, &mut session).await?;

        let offer = match details.len() {
            0 => {
                log::warn!("no purchasable offer for {:?}", attempt.catalog.ids());
                attempt.advance(Event::NothingFound);
                return Ok(Outcome::NotFound);
            }
            1 => details.remove(0),
            found => return Err(Error::UnexpectedOfferCount { expected: 1, found }),
        };
        attempt.advance(Event::OfferSelected);

        let launch = self
            .within(
                Stage::LaunchPurchase,
                session.launch_billing_flow(&offer, presentation),
            )
            .await?;
        log::debug!("launchBillingFlow: {}", launch);
        check(Stage::LaunchPurchase, &launch)?;
        attempt.advance(Event::PurchaseLaunched);

        Ok(Outcome::PurchaseLaunched(PlatformOffer::from(offer)))
    }

    /// Connects and queries the backend for every product of the attempt.
    async fn fetch_offers(
        &self,
        attempt: &mut Attempt,
        session: &mut SessionGuard<B::Session>,
    ) -> Result<Vec<SkuDetails>, Error> {
        attempt.advance(Event::Begin);
        let setup = self
            .within(Stage::Connect, session.start_connection())
            .await?;
        check(Stage::Connect, &setup)?;
        attempt.advance(Event::Connected);

        let skus = attempt.catalog.ids();
        log::debug!(
            "querying {} sku(s) of type {}: {:?}",
            skus.len(),
            self.config.sku_type.as_str(),
            skus
        );
        let response = self
            .within(
                Stage::QueryOffers,
                session.query_sku_details(skus, self.config.sku_type),
            )
            .await?;
        check(Stage::QueryOffers, &response.result)?;

        match response.details {
            Some(details) => Ok(attempt.retain_requested(details)),
            None => {
                log::error!("billing backend returned no sku details list");
                Ok(Vec::new())
            }
        }
    }

    async fn within<T>(&self, stage: Stage, future: impl Future<Output = T>) -> Result<T, Error> {
        let timeout = self.config.stage_timeout;
        tokio::time::timeout(timeout, future).await.map_err(|_| {
            log::error!("{} timed out after {:?}", stage, timeout);
            Error::TimedOut { stage, timeout }
        })
    }

    fn finish(
        &self,
        attempt: &mut Attempt,
        result: Result<Outcome, Error>,
    ) -> Result<Outcome, Error> {
        if let Err(error) = &result {
            if !attempt.state.is_terminal() {
                attempt.advance(Event::Failed);
            }
            self.sink.report_failure(error);
        }

        log::debug!("reconciliation finished in state {:?}", attempt.state);
        result
    }
}

/// Turns a backend response into an error unless it reports success.
fn check(stage: Stage, result: &BillingResult) -> Result<(), Error> {
    match result.disposition() {
        Disposition::Success => Ok(()),
        Disposition::Transient => {
            log::error!("{}: {}", stage, result);
            Err(Error::Unavailable {
                stage,
                result: result.clone(),
            })
        }
        Disposition::Unexpected => {
            // These response codes are not expected here at all.
            log::error!("{}: unexpected response {}", stage, result);
            Err(Error::Unexpected {
                stage,
                result: result.clone(),
            })
        }
    }
}

// Log a serialized catalog so that a user's situation can be reconstructed when debugging.
fn log_catalog(_what: &str, _json: &str) {
    #[cfg(feature = "catalog-logging")]
    log::debug!("{}: {}", _what, _json);
}
