//! Google Play Billing, reached through the `BillingBridge` Kotlin component.
//!
//! Every session gets a handle that the Kotlin side uses to key its `BillingClient`.
//! Requests are fire-and-forget JNI calls; the Play Billing listeners answer on their
//! own threads by calling back into the `onXxx` entry points below, which complete the
//! channel the session is waiting on.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jint, jlong};
use jni::JNIEnv;
use once_cell::sync::Lazy;
use tokio::sync::oneshot;

use super::{with_context, CachedClass, Error};
use crate::billing::{
    BillingBackend, BillingResponseCode, BillingResult, BillingSession, SkuDetails,
    SkuDetailsResponse, SkuType,
};
use crate::pending::{PendingRequests, Routed};

static BILLING_BRIDGE_CLASS: CachedClass = CachedClass::new("org.catalogbridge.BillingBridge");

static STRING_CLASS: CachedClass = CachedClass::new("java.lang.String");

static NEXT_HANDLE: AtomicI64 = AtomicI64::new(1);

static PENDING: Lazy<PendingRequests> = Lazy::new(PendingRequests::default);

/// The Google Play billing backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlayBilling;

impl BillingBackend for PlayBilling {
    type Session = PlaySession;

    fn new_session(&self) -> PlaySession {
        PlaySession {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One `BillingClient` on the Kotlin side.
#[derive(Debug)]
pub struct PlaySession {
    handle: jlong,
}

impl PlaySession {
    /// Waits for the callback registered before a request was issued.
    async fn wait<T>(
        &self,
        call: &str,
        issued: Result<(), Error>,
        answer: oneshot::Receiver<T>,
    ) -> Result<T, BillingResult> {
        if let Err(e) = issued {
            PENDING.forget(self.handle);
            return Err(BillingResult::new(
                BillingResponseCode::DeveloperError,
                format!("failed to call BillingBridge.{}: {:?}", call, e),
            ));
        }

        answer.await.map_err(|_| {
            BillingResult::new(
                BillingResponseCode::Error,
                format!("BillingBridge.{} never answered", call),
            )
        })
    }
}

#[async_trait]
impl BillingSession for PlaySession {
    /// The `Activity` the purchase UI is shown on.
    type Presentation = GlobalRef;

    async fn start_connection(&mut self) -> BillingResult {
        let handle = self.handle;
        let rx = PENDING.expect_setup(handle);

        let issued = with_context(|cx| {
            let class = BILLING_BRIDGE_CLASS.get(cx)?;
            cx.env
                .call_static_method(
                    class,
                    "startConnection",
                    "(Landroid/content/Context;J)V",
                    &[JValue::Object(cx.context.as_obj()), JValue::Long(handle)],
                )?
                .v()?;
            Ok(())
        });

        self.wait("startConnection", issued, rx)
            .await
            .unwrap_or_else(|failure| failure)
    }

    async fn query_sku_details(
        &mut self,
        skus: Vec<String>,
        sku_type: SkuType,
    ) -> SkuDetailsResponse {
        let handle = self.handle;
        let rx = PENDING.expect_sku_details(handle);

        let issued = with_context(|cx| {
            let class = BILLING_BRIDGE_CLASS.get(cx)?;
            let string_class = STRING_CLASS.get(cx)?;

            // We don't provide an initial element so that the array filling can be cleaner.
            let sku_list = {
                let len = jint::try_from(skus.len()).map_err(|_| Error)?;
                let array = cx.env.new_object_array(len, string_class, JObject::null())?;

                for (idx, sku) in skus.iter().enumerate() {
                    let idx = jint::try_from(idx).map_err(|_| Error)?;
                    let sku = cx.env.new_string(sku)?;
                    cx.env.set_object_array_element(&array, idx, sku)?;
                }

                array
            };
            let sku_type = cx.env.new_string(sku_type.as_str())?;

            cx.env
                .call_static_method(
                    class,
                    "querySkuDetails",
                    "(J[Ljava/lang/String;Ljava/lang/String;)V",
                    &[
                        JValue::Long(handle),
                        JValue::Object(&sku_list),
                        JValue::Object(&sku_type),
                    ],
                )?
                .v()?;
            Ok(())
        });

        self.wait("querySkuDetails", issued, rx)
            .await
            .unwrap_or_else(|result| SkuDetailsResponse {
                result,
                details: None,
            })
    }

    async fn launch_billing_flow(
        &mut self,
        details: &SkuDetails,
        activity: &GlobalRef,
    ) -> BillingResult {
        let handle = self.handle;
        let rx = PENDING.expect_launch(handle);

        let issued = with_context(|cx| {
            let class = BILLING_BRIDGE_CLASS.get(cx)?;
            let sku = cx.env.new_string(&details.sku)?;
            cx.env
                .call_static_method(
                    class,
                    "launchBillingFlow",
                    "(JLandroid/app/Activity;Ljava/lang/String;)V",
                    &[
                        JValue::Long(handle),
                        JValue::Object(activity.as_obj()),
                        JValue::Object(&sku),
                    ],
                )?
                .v()?;
            Ok(())
        });

        self.wait("launchBillingFlow", issued, rx)
            .await
            .unwrap_or_else(|failure| failure)
    }

    fn end_connection(&mut self) {
        let handle = self.handle;
        // An answer that arrives from now on has nobody left to receive it.
        PENDING.forget(handle);

        let ended = with_context(|cx| {
            let class = BILLING_BRIDGE_CLASS.get(cx)?;
            cx.env
                .call_static_method(class, "endConnection", "(J)V", &[JValue::Long(handle)])?
                .v()?;
            Ok(())
        });

        if let Err(e) = ended {
            log::error!("failed to end billing connection {}: {:?}", handle, e);
        }
    }
}

fn read_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }

    match env.get_string(value) {
        Ok(value) => Some(value.into()),
        Err(e) => {
            log::error!("failed to read string from BillingBridge: {}", e);
            None
        }
    }
}

#[export_name = "Java_org_catalogbridge_BillingBridge_onBillingSetupFinished"]
pub extern "C" fn catalog_bridge_on_billing_setup_finished(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    code: jint,
    message: JString,
) {
    let result = BillingResult::new(code, read_string(&mut env, &message).unwrap_or_default());

    PENDING.setup_finished(handle, result);
}

#[export_name = "Java_org_catalogbridge_BillingBridge_onBillingServiceDisconnected"]
pub extern "C" fn catalog_bridge_on_billing_service_disconnected(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) {
    // Play Billing reports this on its own, with or without a request in flight.
    if PENDING.disconnected(handle) == Routed::Finished {
        log::info!("billing service disconnected for session {}", handle);
    }
}

#[export_name = "Java_org_catalogbridge_BillingBridge_onSkuDetailsResponse"]
pub extern "C" fn catalog_bridge_on_sku_details_response(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    code: jint,
    message: JString,
    details_json: JString,
) {
    let result = BillingResult::new(code, read_string(&mut env, &message).unwrap_or_default());

    // `null` when Play Billing handed back no list at all. An unreadable list is
    // passed on as garbage so that it fails the query.
    let details_json = (!details_json.is_null())
        .then(|| read_string(&mut env, &details_json).unwrap_or_default());
    let response = SkuDetailsResponse::from_json(result, details_json.as_deref());

    PENDING.sku_details_received(handle, response);
}

#[export_name = "Java_org_catalogbridge_BillingBridge_onBillingFlowLaunched"]
pub extern "C" fn catalog_bridge_on_billing_flow_launched(
    mut env: JNIEnv,
    _class: JClass,
    handle: jlong,
    code: jint,
    message: JString,
) {
    let result = BillingResult::new(code, read_string(&mut env, &message).unwrap_or_default());

    PENDING.flow_launched(handle, result);
}
