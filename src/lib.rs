#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod billing;
pub mod catalog;
mod error;
// Only the JNI backend routes its callbacks through this.
#[cfg_attr(not(target_os = "android"), allow(dead_code))]
mod pending;
mod reconciler;

pub use catalog::{CanonicalCatalog, CanonicalProduct, PlatformCatalog, PlatformOffer};
pub use error::{ContractViolation, Error};
pub use reconciler::{
    CatalogSink, Event, Outcome, Presentation, Reconciler, ReconcilerConfig, Stage, State,
    DEFAULT_STAGE_TIMEOUT,
};

// Build the Android module when generating docs so that
// the Android-specific functions are included regardless of
// the host.
#[cfg(any(all(doc, docsrs), target_os = "android"))]
#[cfg_attr(docsrs, doc(cfg(target_os = "android")))]
pub mod android;


// Re-export any exported functions that are required for
// tests to run in a platform-native environment.
#[cfg(feature = "ffi-testing")]
#[cfg_attr(feature = "ffi-testing", allow(unused_imports))]
pub use tests::ffi::*;
