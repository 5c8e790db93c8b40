//! Lock-manager behaviour over the wire: deadlock detection, logical
//! thread reentrancy across the process boundary, and depth accounting.

#![allow(missing_docs, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]

mod common;

use std::time::Duration;

use janus::{
    client::{Arg, ClientValue},
    error::ErrorKind,
    lock::LockMode,
};
use tokio::{sync::oneshot, time::timeout};

const TEST_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn crossed_acquisitions_raise_deadlock() {
    let h = common::connect().await;
    let c1 = h.client.clone();
    let c2 = h.client.clone();
    let (holding_b_tx, holding_b_rx) = oneshot::channel();
    let (release_b_tx, release_b_rx) = oneshot::channel::<()>();

    // Logical thread 2: take B, then block on A.
    let lt2 = tokio::spawn(async move {
        c2.with_logical_thread(async {
            c2.acquire_lock("B", LockMode::Exclusive).await.unwrap();
            holding_b_tx.send(()).unwrap();
            // Blocks until LT1 releases A after seeing the deadlock.
            c2.acquire_lock("A", LockMode::Exclusive).await.unwrap();
            c2.release_lock("A").await.unwrap();
            let _ = release_b_rx.await;
            c2.release_lock("B").await.unwrap();
        })
        .await;
    });

    let outcome = timeout(TEST_DEADLINE, async {
        c1.with_logical_thread(async {
            c1.acquire_lock("A", LockMode::Exclusive).await.unwrap();
            holding_b_rx.await.unwrap();
            // Give LT2's acquire of A time to park on the wait queue.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let err = c1.acquire_lock("B", LockMode::Exclusive).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Deadlock);
            // Unwind so LT2 can finish.
            c1.release_lock("A").await.unwrap();
        })
        .await;
        release_b_tx.send(()).unwrap();
        lt2.await.unwrap();
    })
    .await;
    outcome.expect("deadlock scenario completed");
}

#[tokio::test]
async fn callback_reenters_lock_held_by_its_logical_thread() {
    let h = common::connect().await;
    let client = h.client.clone();
    let calc = client.get_object("calc").await.unwrap();

    let outcome = timeout(TEST_DEADLINE, client.with_logical_thread(async {
        client.acquire_lock("L", LockMode::Exclusive).await.unwrap();
        // The server invokes the callback while we hold L; the callback
        // arrives on a different worker but under the same logical
        // thread, so the inner acquire succeeds as a reentry.
        let nested = client.clone();
        let out = calc
            .call(
                "apply",
                vec![
                    Arg::callback_async(1, move |args| {
                        let nested = nested.clone();
                        Box::pin(async move {
                            nested
                                .acquire_lock("L", LockMode::Exclusive)
                                .await
                                .map_err(|e| e.to_string())?;
                            nested.release_lock("L").await.map_err(|e| e.to_string())?;
                            let v = args.first().and_then(ClientValue::as_i64).unwrap_or(0);
                            Ok(ClientValue::I64(v + 1))
                        })
                    }),
                    Arg::I64(41),
                ],
            )
            .await
            .unwrap();
        assert_eq!(out.as_i64(), Some(42));
        client.release_lock("L").await.unwrap();
    }))
    .await;
    outcome.expect("reentrant callback completed");

    // Fully released: another logical thread can take it immediately.
    h.client
        .try_acquire_lock("L", LockMode::Exclusive)
        .await
        .unwrap();
}

#[tokio::test]
async fn exclusive_depth_requires_matching_releases() {
    let h = common::connect().await;
    let client = h.client.clone();
    client
        .with_logical_thread(async {
            for _ in 0..3 {
                client.acquire_lock("D", LockMode::Exclusive).await.unwrap();
            }
        })
        .await;
    // Held at depth 3 by the (now idle) logical thread; others fail.
    let err = h
        .client
        .try_acquire_lock("D", LockMode::Exclusive)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireFailed);
}

#[tokio::test]
async fn try_and_timed_acquires_fail_fast() {
    let h = common::connect().await;
    let client = h.client.clone();
    client
        .with_logical_thread(async {
            client.acquire_lock("T", LockMode::Exclusive).await.unwrap();
        })
        .await;
    let err = h
        .client
        .try_acquire_lock("T", LockMode::Shared)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireFailed);
    let err = h
        .client
        .acquire_lock_timeout("T", LockMode::Exclusive, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireFailed);
}

#[tokio::test]
async fn shared_holders_coexist_across_logical_threads() {
    let h = common::connect().await;
    let c1 = h.client.clone();
    let c2 = h.client.clone();
    c1.with_logical_thread(async {
        c1.acquire_lock("S", LockMode::Shared).await.unwrap();
    })
    .await;
    c2.with_logical_thread(async {
        c2.acquire_lock("S", LockMode::Shared).await.unwrap();
    })
    .await;
    let err = h
        .client
        .try_acquire_lock("S", LockMode::Exclusive)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireFailed);
}

#[tokio::test]
async fn releasing_a_lock_not_held_fails() {
    let h = common::connect().await;
    h.client.get_lock("U").await.unwrap();
    let err = h.client.release_lock("U").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AcquireFailed);
}
