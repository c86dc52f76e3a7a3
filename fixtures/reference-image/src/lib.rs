// fixtures/reference-image/src/lib.rs
//! Loadable interpreter image wrapping the reference runtime
//!
//! Builds a shared library exporting the image entry points, so pools can
//! be loaded from a real image file. The flush hook appends a line to the
//! file named by `DEPLOY_IMAGE_FLUSH_LOG`, letting callers count unloads.

use deploy_engine::runtime::ReferenceInterpreter;
use std::fs::OpenOptions;
use std::io::Write;

pub const FLUSH_LOG_ENV: &str = "DEPLOY_IMAGE_FLUSH_LOG";

pub fn flush_runtime() {
    let Some(path) = std::env::var_os(FLUSH_LOG_ENV) else {
        return;
    };
    // Unload must not fail; a missing log only loses the count
    if let Ok(mut log) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(log, "flushed");
    }
}

deploy_engine::export_interpreter!(ReferenceInterpreter::new(), flush = flush_runtime);
