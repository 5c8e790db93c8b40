//! Shared-memory fast path, end to end: a large numeric array crosses in
//! both directions through the filesystem region and every file is
//! unlinked by its reader.

#![allow(missing_docs, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]

mod common;

use janus::{
    client::{Arg, ClientValue},
    codec::ElementKind,
    coerce::{ShmConfig, unpack_f64},
    protocol::{OptionFlags, SessionOptions},
};

fn region_is_empty(region: &std::path::Path) -> bool {
    std::fs::read_dir(region)
        .map(|entries| entries.count() == 0)
        .unwrap_or(false)
}

#[tokio::test]
async fn float_array_round_trips_and_files_are_unlinked() {
    let region = tempfile::tempdir().unwrap();
    let shm = ShmConfig {
        region: region.path().to_path_buf(),
        threshold: 8,
    };
    let h = common::connect_with(
        SessionOptions {
            num_workers: 4,
            flags: OptionFlags::USE_SHM | OptionFlags::CALLBACKS,
        },
        Some(shm),
        |s| s,
    )
    .await;
    let calc = h.client.get_object("calc").await.unwrap();

    let values: Vec<f64> = (0..10).map(f64::from).collect();
    let out = calc
        .call("echoArray", vec![Arg::F64Array(values.clone())])
        .await
        .unwrap();
    let ClientValue::Array { kind, data } = out else {
        panic!("expected an array back");
    };
    assert_eq!(kind, ElementKind::F64);
    assert_eq!(unpack_f64(&data), values);
    assert!(
        region_is_empty(region.path()),
        "both hand-off files were unlinked by their readers"
    );
}

#[tokio::test]
async fn small_arrays_bypass_the_region() {
    let region = tempfile::tempdir().unwrap();
    let shm = ShmConfig {
        region: region.path().to_path_buf(),
        // Nothing in this test reaches the threshold.
        threshold: 1 << 20,
    };
    let h = common::connect_with(
        SessionOptions {
            num_workers: 2,
            flags: OptionFlags::USE_SHM,
        },
        Some(shm),
        |s| s,
    )
    .await;
    let calc = h.client.get_object("calc").await.unwrap();
    let out = calc
        .call("echoArray", vec![Arg::I32Array(vec![1, 2, 3])])
        .await
        .unwrap();
    let ClientValue::Array { kind, .. } = out else {
        panic!("expected an array back");
    };
    assert_eq!(kind, ElementKind::I32);
    assert!(region_is_empty(region.path()), "no files were created");
}
