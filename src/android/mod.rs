//! On Android, initialization must be done before any catalog is reconciled.
//!
//! <div class="warning">
//! Some manual setup is required outside of cargo to use this crate on Android. The billing
//! backend lives in the JVM, so a small Kotlin component (`org.catalogbridge.BillingBridge` and
//! `org.catalogbridge.CatalogBridge`) must be included in your app's build.
//!
//! See the [crate's Android section][crate#android] for more details.
//! </div>
//!
//! The Kotlin side calls `CatalogBridge.nativeInit(context)` once, which lands in
//! [`init_with_env`]. Apps that already hold a `JNIEnv` can call it themselves.
//!
//! # Examples
//!
//! ```ignore
//! // A typical entrypoint signature for obtaining the necessary pointers
//! pub fn android_init(raw_env: *mut c_void, raw_context: *mut c_void) -> Result<(), jni::errors::Error> {
//!     let mut env = unsafe { JNIEnv::from_raw(raw_env as *mut jni::sys::JNIEnv).unwrap() };
//!     let context = unsafe { JObject::from_raw(raw_context as jni::sys::jobject) };
//!     catalog_bridge::android::init_with_env(&mut env, context)?;
//! }
//! ```

use jni::errors::Error as JNIError;
use jni::objects::{GlobalRef, JClass, JObject, JValue};
use jni::{JNIEnv, JavaVM};
use once_cell::sync::OnceCell;

mod billing;
mod bridge;

pub use billing::{PlayBilling, PlaySession};
pub use bridge::JvmCatalogSink;

static GLOBAL: OnceCell<GlobalStorage> = OnceCell::new();

struct GlobalStorage {
    java_vm: JavaVM,
    /// The Android application [Context](https://developer.android.com/reference/android/app/Application).
    context: GlobalRef,
    loader: GlobalRef,
}

fn global() -> Result<&'static GlobalStorage, Error> {
    GLOBAL.get().ok_or_else(|| {
        log::error!("catalog-bridge was used before `android::init_with_env`");
        Error
    })
}

/// Initialize given a typical Android NDK [`JNIEnv`] and [`JObject`] context.
///
/// This stores the JVM, a global reference to `context` and its class loader. Later
/// calls are no-ops.
pub fn init_with_env(env: &mut JNIEnv, context: JObject) -> Result<(), JNIError> {
    GLOBAL.get_or_try_init(|| -> Result<_, JNIError> {
        let loader = env
            .call_method(&context, "getClassLoader", "()Ljava/lang/ClassLoader;", &[])?
            .l()?;

        Ok(GlobalStorage {
            java_vm: env.get_java_vm()?,
            context: env.new_global_ref(&context)?,
            loader: env.new_global_ref(loader)?,
        })
    })?;
    Ok(())
}

/// Wrapper for JNI errors that will log and clear exceptions
/// It should generally be preferred to `jni::errors::Error`
#[derive(Debug)]
pub(crate) struct Error;

impl From<JNIError> for Error {
    #[track_caller]
    fn from(cause: JNIError) -> Self {
        if let JNIError::JavaException = cause {
            if let Some(global) = GLOBAL.get() {
                if let Ok(mut env) = global.java_vm.get_env() {
                    let _ = env.exception_describe();
                    let _ = env.exception_clear();
                }
            }
        } else {
            log::debug!("JNI call failed: {}", cause);
        }

        Self
    }
}

pub(crate) struct LocalContext<'a, 'env> {
    pub(crate) env: &'a mut JNIEnv<'env>,
    pub(crate) context: &'static GlobalRef,
    loader: &'static GlobalRef,
}

impl<'a, 'env> LocalContext<'a, 'env> {
    /// Load a class from the application class loader
    ///
    /// This should be used instead of `JNIEnv::find_class` to ensure all classes
    /// in the application can be found from threads the JVM didn't start.
    fn load_class(&mut self, name: &str) -> Result<JClass<'env>, Error> {
        let name = self.env.new_string(name)?;
        let class = self
            .env
            .call_method(
                self.loader,
                "loadClass",
                "(Ljava/lang/String;)Ljava/lang/Class;",
                &[JValue::Object(&name)],
            )?
            .l()?;

        Ok(JClass::from(class))
    }
}

/// Borrow the Android application context and execute the closure
/// `with_context`, ensuring locals are properly freed and exceptions
/// are cleared.
pub(crate) fn with_context<F, T>(f: F) -> Result<T, Error>
where
    F: FnOnce(&mut LocalContext) -> Result<T, Error>,
{
    let global = global()?;
    let mut env = global.java_vm.attach_current_thread()?;
    env.with_local_frame(16, |env| {
        let mut context = LocalContext {
            env,
            context: &global.context,
            loader: &global.loader,
        };
        f(&mut context)
    })
}

/// Loads and caches a class on first use
pub(crate) struct CachedClass {
    /// Binary name, as `ClassLoader.loadClass` expects it.
    name: &'static str,
    class: OnceCell<GlobalRef>,
}

impl CachedClass {
    /// Creates a lazily initialized class reference to the class with `name`.
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            class: OnceCell::new(),
        }
    }

    /// Gets the cached class reference, loaded on first use
    pub(crate) fn get(&self, cx: &mut LocalContext) -> Result<&JClass<'static>, Error> {
        let class = self.class.get_or_try_init(|| -> Result<_, Error> {
            let class = cx.load_class(self.name)?;

            Ok(cx.env.new_global_ref(class)?)
        })?;

        Ok(<&JClass>::from(class.as_obj()))
    }
}
