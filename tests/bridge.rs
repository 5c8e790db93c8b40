//! End-to-end bridge behaviour: handles, fields, by-value isolation,
//! callbacks, futures, and session teardown.

#![allow(missing_docs, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]

mod common;

use std::{collections::HashSet, sync::Arc, time::Duration};

use janus::{
    client::{Arg, ClientValue},
    error::ErrorKind,
    protocol::{OptionFlags, SessionOptions},
};
use tokio::time::timeout;

#[tokio::test]
async fn named_instance_calls_and_state() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    assert_eq!(
        calc.call("add", vec![Arg::I32(2), Arg::I32(3)])
            .await
            .unwrap()
            .as_i64(),
        Some(5)
    );
    assert_eq!(calc.call("total", vec![]).await.unwrap().as_i64(), Some(5));
}

#[tokio::test]
async fn unknown_instance_name_fails() {
    let h = common::connect().await;
    let err = h.client.get_object("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchHandle);
}

#[tokio::test]
async fn fields_read_and_write() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    assert_eq!(calc.get_field("label").await.unwrap().as_str(), Some(""));
    calc.set_field("label", Arg::str("renamed")).await.unwrap();
    assert_eq!(
        calc.get_field("label").await.unwrap().as_str(),
        Some("renamed")
    );
    let err = calc.get_field("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchField);
}

#[tokio::test]
async fn import_of_same_object_reuses_handle_and_shim() {
    let h = common::connect().await;
    let a = h.client.get_object("calc").await.unwrap();
    let b = h.client.get_object("calc").await.unwrap();
    assert_eq!(a.handle(), b.handle());
    assert_eq!(a.type_id(), b.type_id());
    assert_eq!(h.session.handler.live_exports(), 1);
}

#[tokio::test]
async fn dropping_shims_releases_the_export() {
    let h = common::connect().await;
    let a = h.client.get_object("calc").await.unwrap();
    let b = h.client.get_object("calc").await.unwrap();
    assert_eq!(h.session.handler.live_exports(), 1);
    drop(a);
    drop(b);
    // The count-carrying release is fire-and-forget; give it a moment.
    for _ in 0..50 {
        if h.session.handler.live_exports() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.session.handler.live_exports(), 0);
}

#[tokio::test]
async fn by_value_sequences_are_detached_copies() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let original = vec![5i64, 4, 3, 2, 1];
    let args = original.iter().copied().map(Arg::Int).collect::<Vec<_>>();
    let out = calc.call("sort", vec![Arg::List(args)]).await.unwrap();
    let ClientValue::List(items) = out else {
        panic!("expected a list back");
    };
    let sorted: Vec<i64> = items.iter().filter_map(ClientValue::as_i64).collect();
    assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    // The server sorted a detached copy; our container is untouched.
    assert_eq!(original, vec![5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn callback_computes_through_the_bridge() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let out = calc
        .call(
            "apply",
            vec![
                Arg::callback(1, |args| {
                    let v = args.first().and_then(ClientValue::as_i64).unwrap_or(0);
                    Ok(ClientValue::I64(v * 2))
                }),
                Arg::I64(21),
            ],
        )
        .await
        .unwrap();
    assert_eq!(out.as_i64(), Some(42));
}

#[tokio::test]
async fn callback_failure_propagates_as_remote_exception() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let err = calc
        .call(
            "apply",
            vec![
                Arg::callback(1, |_| Err("lambda exploded".to_owned())),
                Arg::I64(1),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteException);
    assert!(
        err.to_string().contains("lambda exploded"),
        "root cause survives the round trip: {err}"
    );
}

#[tokio::test]
async fn callbacks_refused_without_worker_headroom() {
    let h = common::connect_with(
        SessionOptions {
            num_workers: 1,
            flags: OptionFlags::CALLBACKS,
        },
        None,
        |s| s,
    )
    .await;
    let calc = h.client.get_object("calc").await.unwrap();
    let err = calc
        .call(
            "apply",
            vec![
                Arg::callback(1, |_| Ok(ClientValue::Null)),
                Arg::I64(1),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CoercionFailed);
}

#[tokio::test]
async fn cast_checks_the_ancestor_set() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let as_object = calc.cast("Object").await.unwrap();
    assert_eq!(as_object.handle(), calc.handle());
    let err = calc.cast("demo.Transform").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
}

#[tokio::test]
async fn snapshot_returns_a_by_value_copy() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    calc.call("add", vec![Arg::I32(7), Arg::I32(0)]).await.unwrap();
    let snap = calc.snapshot().await.unwrap();
    assert_eq!(snap.as_i64(), Some(7));
}

#[tokio::test]
async fn async_calls_park_until_collected() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let future = h
        .client
        .async_call(&calc, "add", vec![Arg::I32(20), Arg::I32(22)])
        .await
        .unwrap();
    let out = timeout(Duration::from_secs(5), h.client.collect(future))
        .await
        .expect("collect completed")
        .unwrap();
    assert_eq!(out.as_i64(), Some(42));
    // A future is gone once collected.
    let err = h.client.collect(future).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchHandle);
}

#[tokio::test]
async fn allow_list_gates_class_access() {
    let allow: HashSet<String> = [String::from("demo.Transform")].into();
    let h = common::connect_with(SessionOptions::default(), None, move |s| {
        s.with_allow_list(allow)
    })
    .await;
    let err = h.client.get_class("demo.Calculator").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    h.client.get_class("demo.Transform").await.unwrap();
}

#[tokio::test]
async fn inject_source_without_hook_is_refused() {
    let h = common::connect().await;
    let err = h
        .client
        .inject_source("demo.Generated", "fn main() {}")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
}

#[tokio::test]
async fn ping_and_goodbye() {
    let h = common::connect().await;
    h.client.ping().await.unwrap();
    h.client.goodbye().await;
    timeout(Duration::from_secs(5), h.session.closed())
        .await
        .expect("server session observed the goodbye");
    // After teardown the export table is empty.
    assert_eq!(h.session.handler.live_exports(), 0);
    let err = h.client.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[tokio::test]
async fn concurrent_calls_interleave_without_confusion() {
    let h = common::connect().await;
    let calc = Arc::new(h.client.get_object("calc").await.unwrap());
    let mut tasks = Vec::new();
    for i in 0..12i32 {
        let calc = Arc::clone(&calc);
        tasks.push(tokio::spawn(async move {
            calc.call("add", vec![Arg::I32(i), Arg::I32(0)])
                .await
                .unwrap()
                .as_i64()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Some(i64::try_from(i).unwrap()));
    }
}
