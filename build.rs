// build.rs
//! Build script for build metadata and the optional compiled-in interpreter image

use std::path::Path;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    println!("cargo:rustc-check-cfg=cfg(embedded_image)");

    // Git hash for BuildInfo (falls back when building from a tarball)
    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=RUSTC_VERSION={}", rustc_version);

    // Embed an interpreter shared library into the crate if one was named
    println!("cargo:rerun-if-env-changed=DEPLOY_INTERPRETER_IMAGE");
    if let Ok(image) = std::env::var("DEPLOY_INTERPRETER_IMAGE") {
        let path = Path::new(&image);
        if path.is_file() {
            let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            println!("cargo:rustc-cfg=embedded_image");
            println!(
                "cargo:rustc-env=DEPLOY_EMBEDDED_IMAGE_PATH={}",
                absolute.display()
            );
            println!("cargo:rerun-if-changed={}", absolute.display());
        } else {
            println!(
                "cargo:warning=DEPLOY_INTERPRETER_IMAGE={} is not a file; building without an embedded image",
                image
            );
        }
    }
}
