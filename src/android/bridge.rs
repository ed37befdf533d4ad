//! The JNI surface of `org.catalogbridge.CatalogBridge`: entry points the app calls,
//! and the static callbacks reconciled catalogs are delivered to.

use std::future::Future;

use jni::objects::{JClass, JObject, JString, JValue};
use jni::JNIEnv;
use once_cell::sync::{Lazy, OnceCell};
use tokio::runtime::Runtime;

use super::{with_context, CachedClass, PlayBilling};
use crate::catalog::CanonicalCatalog;
use crate::error::{ContractViolation, Error};
use crate::reconciler::{CatalogSink, Outcome, Reconciler, ReconcilerConfig};

static CATALOG_BRIDGE_CLASS: CachedClass = CachedClass::new("org.catalogbridge.CatalogBridge");

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

static RECONCILER: Lazy<Reconciler<PlayBilling, JvmCatalogSink>> =
    Lazy::new(|| Reconciler::new(PlayBilling, JvmCatalogSink, ReconcilerConfig::default()));

/// Delivers results to the static `CatalogBridge.onSkuDetailsReceived` and
/// `CatalogBridge.onSkuDetailsFailed` methods.
#[derive(Debug, Default, Clone, Copy)]
pub struct JvmCatalogSink;

impl JvmCatalogSink {
    fn call(method: &str, payload: &str) {
        let result = with_context(|cx| {
            let class = CATALOG_BRIDGE_CLASS.get(cx)?;
            let payload = cx.env.new_string(payload)?;
            cx.env
                .call_static_method(
                    class,
                    method,
                    "(Ljava/lang/String;)V",
                    &[JValue::Object(&payload)],
                )?
                .v()?;
            Ok(())
        });

        if let Err(e) = result {
            log::error!("failed to call CatalogBridge.{}: {:?}", method, e);
        }
    }
}

impl CatalogSink for JvmCatalogSink {
    fn deliver(&self, catalog_json: &str) {
        Self::call("onSkuDetailsReceived", catalog_json);
    }

    fn report_failure(&self, error: &Error) {
        Self::call("onSkuDetailsFailed", &error.to_string());
    }
}

fn runtime() -> std::io::Result<&'static Runtime> {
    RUNTIME.get_or_try_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("catalog-bridge")
            .enable_time()
            .build()
    })
}

fn throw(env: &mut JNIEnv, class: &str, message: &str) {
    // An exception that is already pending reaches the caller on its own.
    if env.exception_check().unwrap_or(false) {
        return;
    }

    if let Err(e) = env.throw_new(class, message) {
        log::error!("failed to throw {}: {}", class, e);
    }
}

/// Reads and validates the catalog argument, throwing `IllegalArgumentException` if
/// it is unreadable or breaks the contract.
fn decode_or_throw(env: &mut JNIEnv, catalog: &JString) -> Option<CanonicalCatalog> {
    let argument = env.get_string(catalog).map(String::from);

    match CanonicalCatalog::decode_argument(argument) {
        Ok(catalog) => Some(catalog),
        Err(violation) => {
            throw_contract_violation(env, &violation);
            None
        }
    }
}

fn throw_contract_violation(env: &mut JNIEnv, violation: &ContractViolation) {
    log::error!("rejecting catalog: {}", violation);
    throw(env, "java/lang/IllegalArgumentException", &violation.to_string());
}

fn spawn_or_throw<F>(env: &mut JNIEnv, attempt: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match runtime() {
        Ok(runtime) => {
            runtime.spawn(attempt);
        }
        Err(e) => throw(
            env,
            "java/lang/IllegalStateException",
            &format!("failed to start the catalog-bridge runtime: {}", e),
        ),
    }
}

fn log_outcome(what: &str, result: Result<Outcome, Error>) {
    match result {
        Ok(Outcome::Delivered { offers }) => log::info!("{}: delivered {} offer(s)", what, offers),
        Ok(Outcome::PurchaseLaunched(offer)) => {
            log::info!("{}: billing flow launched for {}", what, offer.sku)
        }
        Ok(Outcome::NotFound) => log::warn!("{}: no matching offers", what),
        Err(e) => log::error!("{} failed: {}", what, e),
    }
}

#[export_name = "Java_org_catalogbridge_CatalogBridge_nativeInit"]
pub extern "C" fn catalog_bridge_native_init(mut env: JNIEnv, _class: JClass, context: JObject) {
    if let Err(e) = super::init_with_env(&mut env, context) {
        log::error!("failed to initialize catalog-bridge: {}", e);
    }
}

#[export_name = "Java_org_catalogbridge_CatalogBridge_lookupProductsInPlayStore"]
pub extern "C" fn catalog_bridge_lookup_products(
    mut env: JNIEnv,
    _class: JClass,
    catalog: JString,
) {
    let Some(catalog) = decode_or_throw(&mut env, &catalog) else {
        return;
    };

    log::debug!("looking up {} product(s)", catalog.len());
    spawn_or_throw(&mut env, async move {
        log_outcome("lookup", RECONCILER.lookup_catalog(catalog).await)
    });
}

#[export_name = "Java_org_catalogbridge_CatalogBridge_purchaseProduct"]
pub extern "C" fn catalog_bridge_purchase_product(
    mut env: JNIEnv,
    _class: JClass,
    catalog: JString,
    activity: JObject,
) {
    let Some(catalog) = decode_or_throw(&mut env, &catalog) else {
        return;
    };
    if let Err(violation) = catalog.single() {
        throw_contract_violation(&mut env, &violation);
        return;
    }

    let activity = match env.new_global_ref(activity) {
        Ok(activity) => activity,
        Err(e) => {
            log::error!("failed to keep a reference to the activity: {}", e);
            return;
        }
    };

    spawn_or_throw(&mut env, async move {
        log_outcome(
            "purchase",
            RECONCILER.purchase_catalog(catalog, &activity).await,
        )
    });
}
