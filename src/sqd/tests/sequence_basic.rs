//! Happy-path behavior of the single-chain dispatcher: dispatch order,
//! invoke-after wiring, the in-flight cap, and the idle-close handshake.

use futures::channel::mpsc;
use futures::StreamExt;
use sqd::{ParentEventKind, ParentHandle, Query, SequenceDispatcher, MAX_SIMULTANEOUS_WAIT};
use sqd_test::{settle, MockTransport, TestCallback};

fn query(n: u64) -> Query {
    Query::new(serde_json::json!({ "n": n }))
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dispatches_in_order_with_invoke_after() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = SequenceDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    let queries: Vec<Query> = (1..=3).map(query).collect();
    let ids: Vec<u64> = queries.iter().map(Query::id).collect();
    for q in queries {
        dispatcher.submit(q, callback.clone()).unwrap();
    }

    let d1 = transport.next().await;
    assert_eq!(d1.id(), ids[0]);
    assert!(d1.invoke_after_ids().is_empty());

    let d2 = transport.next().await;
    assert_eq!(d2.id(), ids[1]);
    assert_eq!(d2.invoke_after_ids(), vec![ids[0]]);

    let d3 = transport.next().await;
    assert_eq!(d3.id(), ids[2]);
    assert_eq!(d3.invoke_after_ids(), vec![ids[1]]);

    // All dispatches of one instance share a session.
    assert_eq!(d1.query.session_rand(), d2.query.session_rand());
    assert_eq!(d2.query.session_rand(), d3.query.session_rand());

    d1.succeed();
    d2.succeed();
    d3.succeed();
    for id in ids {
        assert_eq!(finished.next().await.unwrap().id(), id);
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn in_flight_cap_limits_outstanding_queries() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = SequenceDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    let queries: Vec<Query> = (1..=15).map(query).collect();
    let ids: Vec<u64> = queries.iter().map(Query::id).collect();
    for q in queries {
        dispatcher.submit(q, callback.clone()).unwrap();
    }
    settle().await;

    let mut inflight = Vec::new();
    for expected in &ids[..MAX_SIMULTANEOUS_WAIT] {
        let d = transport.next().await;
        assert_eq!(d.id(), *expected);
        inflight.push(d);
    }
    // The eleventh query stays queued until a slot frees up.
    assert!(transport.try_next().is_none());

    inflight.remove(0).succeed();
    assert_eq!(finished.next().await.unwrap().id(), ids[0]);
    settle().await;

    let d11 = transport.next().await;
    assert_eq!(d11.id(), ids[MAX_SIMULTANEOUS_WAIT]);
    assert_eq!(
        d11.invoke_after_ids(),
        vec![ids[MAX_SIMULTANEOUS_WAIT - 1]]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn idle_close_handshake_fires_after_grace_period() {
    let (parent_tx, mut parent_rx) = mpsc::unbounded();
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = SequenceDispatcher::builder()
        .parent(ParentHandle::new(7, parent_tx))
        .build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    dispatcher.submit(query(1), callback).unwrap();
    transport.next().await.succeed();
    finished.next().await.unwrap();

    let event = parent_rx.next().await.unwrap();
    assert_eq!(event.token, 7);
    assert_eq!(event.kind, ParentEventKind::QueryFinished);

    // Paused time advances once everything is idle, so the five-second grace
    // period elapses here.
    let event = parent_rx.next().await.unwrap();
    assert_eq!(event.token, 7);
    assert_eq!(event.kind, ParentEventKind::ReadyToClose);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn interleaved_submission_cancels_idle_close() {
    let (parent_tx, mut parent_rx) = mpsc::unbounded();
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = SequenceDispatcher::builder()
        .parent(ParentHandle::new(1, parent_tx))
        .build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    dispatcher.submit(query(1), callback.clone()).unwrap();
    transport.next().await.succeed();
    finished.next().await.unwrap();
    settle().await;

    // A new submission before the grace period elapses disarms the timer:
    // the next parent event must be the second finish, not a close request.
    dispatcher.submit(query(2), callback).unwrap();
    transport.next().await.succeed();
    finished.next().await.unwrap();

    let event = parent_rx.next().await.unwrap();
    assert_eq!(event.kind, ParentEventKind::QueryFinished);
    let event = parent_rx.next().await.unwrap();
    assert_eq!(event.kind, ParentEventKind::QueryFinished);
    let event = parent_rx.next().await.unwrap();
    assert_eq!(event.kind, ParentEventKind::ReadyToClose);
}
