// tests/image_pool.rs
//! Pools loaded from a real interpreter image
//!
//! Uses the `deploy-reference-image` workspace member, a shared library
//! exporting the reference runtime. When a workspace build already produced
//! it next to this test binary it is used as is; otherwise it is built into
//! a private target directory first.

#![cfg(target_os = "linux")]

use deploy_engine::runtime::{EmbeddedImage, ImageSet};
use deploy_engine::{Arg, InterpreterManager, RuntimeSource, Value};
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const FLUSH_LOG_ENV: &str = "DEPLOY_IMAGE_FLUSH_LOG";

fn image_file_name() -> String {
    format!("{}deploy_reference_image{}", DLL_PREFIX, DLL_SUFFIX)
}

/// Image built alongside this test by a workspace build
fn find_built_image() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let deps = exe.parent()?;
    let found = [Some(deps), deps.parent()]
        .into_iter()
        .flatten()
        .map(|dir| dir.join(image_file_name()))
        .find(|path| path.is_file());
    found
}

fn build_image() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/reference-image/Cargo.toml");
    let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("reference-image");

    let status = Command::new(env!("CARGO"))
        .arg("build")
        .arg("--offline")
        .arg("--manifest-path")
        .arg(&manifest)
        .arg("--target-dir")
        .arg(&target_dir)
        .status()
        .expect("failed to run cargo");
    assert!(status.success(), "building the reference image failed");

    target_dir.join("debug").join(image_file_name())
}

fn reference_image() -> EmbeddedImage {
    let path = find_built_image().unwrap_or_else(build_image);
    EmbeddedImage::from_file(path).unwrap()
}

#[test]
fn test_pool_from_image_stages_tags_and_flushes() {
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    fs::create_dir(&staging).unwrap();
    let flush_log = scratch.path().join("flush.log");
    std::env::set_var(FLUSH_LOG_ENV, &flush_log);

    let source = RuntimeSource::Images {
        images: ImageSet::standard(reference_image()),
        temp_dir: Some(staging.clone()),
        accelerator: Some(false),
    };
    let manager = InterpreterManager::with_source(2, source).unwrap();
    assert_eq!(manager.len(), 2);

    // Staged copies are unlinked once loaded
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);

    for i in 0..2 {
        let session = manager.instance(i).unwrap().acquire_session();
        let tag = session.global("deploy", "interp").unwrap().to_value().unwrap();
        assert_eq!(tag, Value::Int(i as i64));
    }

    manager.register_module_source("math2", "def double(x): return x + x");
    let movable = {
        let session = manager.acquire_one();
        let doubled = session
            .global("math2", "double")
            .unwrap()
            .call(&[Arg::from(21i64)])
            .unwrap();
        assert_eq!(doubled.to_value().unwrap(), Value::Int(42));

        let list = session.from_value(vec![1i64]).unwrap();
        session.create_movable(&list).unwrap()
    };

    // Each loaded image keeps its own copy
    let first = movable.acquire_session(Some(manager.instance(0).unwrap())).unwrap();
    first
        .self_obj()
        .unwrap()
        .attr("append")
        .unwrap()
        .call(&[Arg::from(2i64)])
        .unwrap();
    let second = movable.acquire_session(Some(manager.instance(1).unwrap())).unwrap();
    assert_eq!(
        second.self_obj().unwrap().to_value().unwrap(),
        Value::from(vec![1i64])
    );
    assert_eq!(
        first.self_obj().unwrap().to_value().unwrap(),
        Value::from(vec![1i64, 2])
    );
    drop((first, second));

    drop(movable);
    drop(manager);

    let flushes = fs::read_to_string(&flush_log).unwrap();
    assert_eq!(flushes.lines().count(), 2);
}
