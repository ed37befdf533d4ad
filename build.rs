//! Ships the Kotlin half of the Android billing backend.
//!
//! Apps depend on this crate through cargo, but Gradle needs the `BillingBridge` and
//! `CatalogBridge` sources at a path it can name. With `CATALOG_BRIDGE_GEN_ANDROID_SRC`
//! set, the `android/catalog-bridge` component is mirrored into
//! `$TARGET_DIR/catalog-bridge/android`, which a `settings.gradle` can include.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const ANDROID_SRC_GEN: &str = "CATALOG_BRIDGE_GEN_ANDROID_SRC";

fn main() {
    println!("cargo:rerun-if-env-changed={}", ANDROID_SRC_GEN);
    if env::var_os(ANDROID_SRC_GEN).is_none() {
        return;
    }

    let component = Path::new(&env::var("CARGO_MANIFEST_DIR").unwrap())
        .join("android")
        .join("catalog-bridge");
    println!("cargo:rerun-if-changed={}", component.display());

    let dest = target_dir().join("catalog-bridge").join("android");
    fs::create_dir_all(&dest).unwrap();
    mirror(&component, &dest);
}

/// `CARGO_TARGET_DIR` if set, otherwise the outermost `target` above `OUT_DIR`.
fn target_dir() -> PathBuf {
    if let Some(dir) = env::var_os("CARGO_TARGET_DIR") {
        return PathBuf::from(dir);
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    out_dir
        .ancestors()
        .filter(|dir| dir.ends_with("target"))
        .last()
        .map(Path::to_path_buf)
        .expect("OUT_DIR is not inside a target directory")
}

fn mirror(src: &Path, dest: &Path) {
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let from = entry.path();
        let to = dest.join(entry.file_name());

        if entry.file_type().unwrap().is_dir() {
            // Gradle output from a local build of the component.
            if entry.file_name() == "build" {
                continue;
            }
            fs::create_dir_all(&to).unwrap();
            mirror(&from, &to);
        } else {
            fs::copy(&from, &to).unwrap();
        }
    }
}
