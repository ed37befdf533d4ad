//! End-to-end reconciliation scenarios against a scripted billing backend.
//!
//! Every scenario runs the public [`Reconciler`] API with a fresh backend and sink,
//! then checks what was delivered and that the backend connection was released.
//! The same list of scenarios runs on a device through the `ffi-testing` runner,
//! which lets us check the bridge under the Android runtime's threading as well.

use std::sync::Arc;
use std::time::Duration;

use super::{error_kind, sku, FakeBackend, RecordingSink, Script};
use crate::billing::{BillingResponseCode, BillingResult, SkuDetailsResponse};
use crate::catalog::{CanonicalCatalog, PlatformCatalog, PlatformOffer};
use crate::reconciler::{Outcome, Reconciler, ReconcilerConfig, Stage};

macro_rules! scenario_test_cases {
    { $( $name:ident => $scenario:expr ),+ , } => {
        $(
            pub(super) fn $name() {
                run_scenario($scenario);
            }
        )+

        #[cfg(test)]
        mod tests {
            $(
                #[test]
                pub fn $name() {
                    super::$name()
                }
            )+
        }

        #[cfg(feature = "ffi-testing")]
        pub static ALL_TEST_CASES: &'static [fn()] = &[
            $($name),+
        ];
    };
}

#[derive(Debug, Clone, Copy)]
enum Flow {
    Lookup,
    Purchase,
}

struct Scenario<'a> {
    /// The serialized canonical catalog handed to the bridge.
    pub input: &'a str,

    pub flow: Flow,

    /// How the fake backend answers.
    pub script: Script,

    pub stage_timeout: Duration,

    /// The outcome, or the kind of error (see [`error_kind`]) the call must end with.
    pub expected_result: Result<Outcome, &'static str>,

    /// The serialized platform catalog the sink must have received, if any.
    pub expected_delivery: Option<&'a str>,
}

const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

// Short enough to keep the suite fast, since a stalled stage runs in real time on devices.
const STALL_TIMEOUT: Duration = Duration::from_millis(20);

const PRESENTATION: &str = "scenario-activity";

const MONTHLY: &str =
    r#"{"products":[{"featured_product":true,"type":"subscription","id":"org.example.monthly"}]}"#;

const MONTHLY_AND_YEARLY: &str = r#"{"products":[{"featured_product":false,"type":"subscription","id":"org.example.monthly"},{"featured_product":true,"type":"subscription","id":"org.example.yearly"}]}"#;

const MONTHLY_OFFER: &str = r#"{"products":[{"sku":"org.example.monthly","description":"Monthly","price":"$4.99","priceCurrencyCode":"USD"}]}"#;

fn run_scenario(scenario: Scenario) {
    let backend = FakeBackend::new(scenario.script);
    let sink = Arc::new(RecordingSink::default());
    let reconciler = Reconciler::new(
        backend.clone(),
        sink.clone(),
        ReconcilerConfig {
            stage_timeout: scenario.stage_timeout,
            ..ReconcilerConfig::default()
        },
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let result = runtime.block_on(async {
        match scenario.flow {
            Flow::Lookup => reconciler.lookup_offers(scenario.input).await,
            Flow::Purchase => reconciler.purchase(scenario.input, PRESENTATION).await,
        }
    });

    let result = result.map_err(|e| error_kind(&e));
    assert_eq!(result, scenario.expected_result);

    let delivered = sink.delivered();
    assert_eq!(
        delivered.first().map(String::as_str),
        scenario.expected_delivery
    );
    assert!(delivered.len() <= 1, "delivered more than once");

    // Whatever was delivered only holds products that were asked for.
    if let Some(json) = delivered.first() {
        let input = CanonicalCatalog::decode(scenario.input).unwrap();
        let output = PlatformCatalog::decode(json).unwrap();
        assert!(output.len() <= input.len());
        for offer in &output.products {
            assert!(input.find(&offer.sku).is_some(), "unrequested {}", offer.sku);
        }
    }

    // Failed attempts are reported. Contract violations only go back to the caller.
    let reported = matches!(result, Err(kind) if kind != "contract");
    assert_eq!(sink.failures().len(), usize::from(reported));

    let log = backend.log();
    assert_eq!(log.opened, log.closed, "billing connection leaked");
    assert!(log.opened <= 1);
}

fn monthly_offer() -> PlatformOffer {
    PlatformOffer {
        sku: "org.example.monthly".into(),
        description: "Monthly".into(),
        display_price: "$4.99".into(),
        currency_code: "USD".into(),
    }
}

fn failing_query(code: BillingResponseCode) -> Script {
    Script {
        query: SkuDetailsResponse {
            result: BillingResult::new(code, "scripted failure"),
            details: None,
        },
        ..Script::answering(Vec::new())
    }
}

scenario_test_cases! {
    lookup_single_subscription => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::Delivered { offers: 1 }),
        expected_delivery: Some(MONTHLY_OFFER),
    },
    lookup_keeps_only_recognized_products => Scenario {
        input: MONTHLY_AND_YEARLY,
        flow: Flow::Lookup,
        script: Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::Delivered { offers: 1 }),
        expected_delivery: Some(MONTHLY_OFFER),
    },
    lookup_follows_backend_order => Scenario {
        input: MONTHLY_AND_YEARLY,
        flow: Flow::Lookup,
        script: Script::answering(vec![
            sku("org.example.yearly", "Yearly", "$39.99", "USD"),
            sku("org.example.monthly", "Monthly", "$4.99", "USD"),
        ]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::Delivered { offers: 2 }),
        expected_delivery: Some(r#"{"products":[{"sku":"org.example.yearly","description":"Yearly","price":"$39.99","priceCurrencyCode":"USD"},{"sku":"org.example.monthly","description":"Monthly","price":"$4.99","priceCurrencyCode":"USD"}]}"#),
    },
    lookup_drops_unrequested_records => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: Script::answering(vec![
            sku("org.example.weekly", "Weekly", "$1.99", "USD"),
            sku("org.example.monthly", "Monthly", "$4.99", "USD"),
        ]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::Delivered { offers: 1 }),
        expected_delivery: Some(MONTHLY_OFFER),
    },
    lookup_without_matches_delivers_nothing => Scenario {
        input: MONTHLY_AND_YEARLY,
        flow: Flow::Lookup,
        script: Script::answering(Vec::new()),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::NotFound),
        expected_delivery: None,
    },
    lookup_with_malformed_catalog => Scenario {
        input: r#"{"products":[{"id":"org.example.monthly"}]}"#,
        flow: Flow::Lookup,
        script: Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("contract"),
        expected_delivery: None,
    },
    lookup_when_billing_unavailable => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: Script {
            setup: BillingResult::new(
                BillingResponseCode::BillingUnavailable,
                "Billing service unavailable on device.",
            ),
            ..Script::answering(Vec::new())
        },
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unavailable"),
        expected_delivery: None,
    },
    lookup_when_service_disconnects => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: failing_query(BillingResponseCode::ServiceDisconnected),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unavailable"),
        expected_delivery: None,
    },
    lookup_with_developer_error => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: failing_query(BillingResponseCode::DeveloperError),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unavailable"),
        expected_delivery: None,
    },
    lookup_with_unexpected_cancel => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: failing_query(BillingResponseCode::UserCanceled),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unexpected"),
        expected_delivery: None,
    },
    lookup_with_unexpected_ownership => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: failing_query(BillingResponseCode::ItemNotOwned),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unexpected"),
        expected_delivery: None,
    },
    lookup_with_corrupt_details => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: Script {
            // An OK answer whose records can't be read is still a failed query.
            query: SkuDetailsResponse::from_json(
                BillingResult::ok(),
                Some(r#"[{"productId":"org.example.monthly"}]"#),
            ),
            ..Script::answering(Vec::new())
        },
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("unavailable"),
        expected_delivery: None,
    },
    lookup_with_stalled_setup => Scenario {
        input: MONTHLY,
        flow: Flow::Lookup,
        script: Script {
            hang_on: Some(Stage::Connect),
            ..Script::answering(Vec::new())
        },
        stage_timeout: STALL_TIMEOUT,
        expected_result: Err("timed out"),
        expected_delivery: None,
    },
    purchase_single_subscription => Scenario {
        input: MONTHLY,
        flow: Flow::Purchase,
        script: Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::PurchaseLaunched(monthly_offer())),
        expected_delivery: None,
    },
    purchase_with_two_products => Scenario {
        input: MONTHLY_AND_YEARLY,
        flow: Flow::Purchase,
        script: Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")]),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("contract"),
        expected_delivery: None,
    },
    purchase_with_empty_catalog => Scenario {
        input: r#"{"products":[]}"#,
        flow: Flow::Purchase,
        script: Script::answering(Vec::new()),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Err("contract"),
        expected_delivery: None,
    },
    purchase_without_offer => Scenario {
        input: MONTHLY,
        flow: Flow::Purchase,
        script: Script::answering(Vec::new()),
        stage_timeout: STAGE_TIMEOUT,
        expected_result: Ok(Outcome::NotFound),
        expected_delivery: None,
    },
    purchase_with_stalled_launch => Scenario {
        input: MONTHLY,
        flow: Flow::Purchase,
        script: Script {
            hang_on: Some(Stage::LaunchPurchase),
            ..Script::answering(vec![sku("org.example.monthly", "Monthly", "$4.99", "USD")])
        },
        stage_timeout: STALL_TIMEOUT,
        expected_result: Err("timed out"),
        expected_delivery: None,
    },
}
