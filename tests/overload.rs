//! End-to-end overload resolution over the wire.

#![allow(missing_docs, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]

mod common;

use janus::{client::Arg, error::ErrorKind};

#[tokio::test]
async fn untyped_pair_is_ambiguous() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let err = calc
        .call("f", vec![Arg::Int(1), Arg::Int(1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AmbiguousCall);
    let message = err.to_string();
    assert!(message.contains("f(int,double)"), "message was: {message}");
    assert!(message.contains("f(double,int)"), "message was: {message}");
}

#[tokio::test]
async fn typed_scalars_disambiguate() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let out = calc
        .call("f", vec![Arg::I32(1), Arg::F64(1.0)])
        .await
        .unwrap();
    assert_eq!(out.as_str(), Some("f(int,double)"));
    let out = calc
        .call("f", vec![Arg::F64(1.0), Arg::I32(1)])
        .await
        .unwrap();
    assert_eq!(out.as_str(), Some("f(double,int)"));
}

#[tokio::test]
async fn untyped_ints_widen_into_unambiguous_overloads() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    // 1 and 2 fit to byte on the wire; add(int,int) is the only
    // candidate and the widening is implicit.
    let out = calc
        .call("add", vec![Arg::Int(1), Arg::Int(2)])
        .await
        .unwrap();
    assert_eq!(out.as_i64(), Some(3));
}

#[tokio::test]
async fn unknown_method_and_bad_arity_fail_cleanly() {
    let h = common::connect().await;
    let calc = h.client.get_object("calc").await.unwrap();
    let err = calc.call("g", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchMethod);
    let err = calc.call("add", vec![Arg::Int(1)]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchMethod);
    let err = calc
        .call("add", vec![Arg::str("x"), Arg::str("y")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchMethod);
}

#[tokio::test]
async fn constructor_resolution_follows_the_same_rules() {
    let h = common::connect().await;
    let class = h.client.get_class("demo.Calculator").await.unwrap();
    let fresh = class.construct(vec![]).await.unwrap();
    assert_eq!(
        fresh.call("total", vec![]).await.unwrap().as_i64(),
        Some(0)
    );
    // An untyped 5 widens byte -> long against the one-argument form.
    let seeded = class.construct(vec![Arg::Int(5)]).await.unwrap();
    assert_eq!(
        seeded.call("total", vec![]).await.unwrap().as_i64(),
        Some(5)
    );
}

#[tokio::test]
async fn unknown_class_is_refused() {
    let h = common::connect().await;
    let err = h.client.get_class("demo.Nonexistent").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSuchClass);
}
