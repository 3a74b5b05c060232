//! The multi-chain dispatcher: joins across chains, predecessor wiring,
//! reset-based resends, and teardown.

use futures::StreamExt;
use sqd::{ChainId, Error, MultiChainDispatcher, Query};
use sqd_test::{settle, MockTransport, TestCallback};

fn query(n: u64) -> Query {
    Query::new(serde_json::json!({ "n": n }))
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn join_carries_one_predecessor_per_chain() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    let p1 = query(1);
    let p2 = query(2);
    let t = query(3);
    let (id_p1, id_p2, id_t) = (p1.id(), p2.id(), t.id());

    dispatcher.submit(p1, callback.clone(), &[ChainId(1)]).unwrap();
    dispatcher.submit(p2, callback.clone(), &[ChainId(2)]).unwrap();
    dispatcher
        .submit(t, callback.clone(), &[ChainId(1), ChainId(2)])
        .unwrap();

    let d_p1 = transport.next().await;
    assert_eq!(d_p1.id(), id_p1);
    assert!(d_p1.invoke_after_ids().is_empty());

    let d_p2 = transport.next().await;
    assert_eq!(d_p2.id(), id_p2);
    assert!(d_p2.invoke_after_ids().is_empty());

    // The join is released once it is eligible on both chains and names the
    // live predecessor of each, in chain-declaration order.
    let d_t = transport.next().await;
    assert_eq!(d_t.id(), id_t);
    assert_eq!(d_t.invoke_after_ids(), vec![id_p1, id_p2]);

    d_p1.succeed();
    d_p2.succeed();
    d_t.succeed();
    for _ in 0..3 {
        finished.next().await.unwrap();
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shared_predecessor_is_deduplicated() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, _finished) = TestCallback::auto_finish();
    let p = query(1);
    let t = query(2);
    let id_p = p.id();

    let chains = [ChainId(1), ChainId(2)];
    dispatcher.submit(p, callback.clone(), &chains).unwrap();
    dispatcher.submit(t, callback, &chains).unwrap();

    let _d_p = transport.next().await;
    let d_t = transport.next().await;
    assert_eq!(d_t.invoke_after_ids(), vec![id_p]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn finished_predecessors_are_not_referenced() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    dispatcher.submit(query(1), callback.clone(), &[ChainId(1)]).unwrap();
    transport.next().await.succeed();
    finished.next().await.unwrap();
    settle().await;

    // The predecessor is gone from the chain; no stale reference is sent.
    dispatcher.submit(query(2), callback, &[ChainId(1)]).unwrap();
    let d = transport.next().await;
    assert!(d.invoke_after_ids().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn ordering_failure_resets_the_task_in_place() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    let t1 = query(1);
    let t2 = query(2);
    let (id_t1, id_t2) = (t1.id(), t2.id());
    dispatcher.submit(t1, callback.clone(), &[ChainId(9)]).unwrap();
    dispatcher.submit(t2, callback, &[ChainId(9)]).unwrap();

    let d_t1 = transport.next().await;
    let d_t2 = transport.next().await;
    assert_eq!(d_t2.invoke_after_ids(), vec![id_t1]);

    // Both come back refused; each is reset at its original chain position,
    // so the re-releases keep the original order and wiring.
    d_t1.fail(Error::wait_failed());
    let d_t1b = transport.next().await;
    assert_eq!(d_t1b.id(), id_t1);
    assert!(d_t1b.invoke_after_ids().is_empty());
    assert_eq!(d_t1b.query.resend_count(), 1);

    d_t2.fail(Error::wait_timeout());
    let d_t2b = transport.next().await;
    assert_eq!(d_t2b.id(), id_t2);
    assert_eq!(d_t2b.invoke_after_ids(), vec![id_t1]);

    d_t1b.succeed();
    d_t2b.succeed();
    assert_eq!(finished.next().await.unwrap().id(), id_t1);
    assert_eq!(finished.next().await.unwrap().id(), id_t2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn callback_resend_goes_through_reset() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut requests) = TestCallback::manual();
    dispatcher.submit(query(1), callback.clone(), &[ChainId(4)]).unwrap();
    dispatcher.submit(query(2), callback, &[ChainId(4)]).unwrap();

    let d1 = transport.next().await;
    let d2 = transport.next().await;
    d1.fail(Error::new(500, "backend unavailable"));

    let request = requests.next().await.unwrap();
    let retry = query(3);
    let retry_id = retry.id();
    request.promise.resend(retry);

    // The substituted query takes the failed task's place at the head of the
    // chain; the successor still points at the task, now via the new query.
    let d1b = transport.next().await;
    assert_eq!(d1b.id(), retry_id);

    d2.fail(Error::wait_failed());
    let d2b = transport.next().await;
    assert_eq!(d2b.invoke_after_ids(), vec![retry_id]);

    d1b.succeed();
    d2b.succeed();
    requests.next().await.unwrap().promise.finish();
    requests.next().await.unwrap().promise.finish();
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn tear_down_stops_the_dispatcher() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    let driver = tokio::spawn(driver);

    let (callback, mut requests) = TestCallback::manual();
    dispatcher.submit(query(1), callback.clone(), &[ChainId(1)]).unwrap();
    dispatcher.submit(query(2), callback, &[ChainId(1)]).unwrap();

    let d1 = transport.next().await;
    let _d2 = transport.next().await;
    d1.fail(Error::new(500, "backend unavailable"));
    let pending = requests.next().await.unwrap();

    dispatcher.tear_down().unwrap();
    driver.await.unwrap().unwrap();

    // Fulfilling the promise after teardown goes nowhere, silently.
    pending.promise.resend(query(3));

    // And so do further submissions.
    let (callback, _requests) = TestCallback::manual();
    let error = dispatcher.submit(query(4), callback, &[ChainId(1)]).unwrap_err();
    assert_eq!(error, Error::closed());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn submissions_require_non_zero_chains() {
    let (transport_tx, _transport) = MockTransport::new();
    let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, _requests) = TestCallback::manual();
    assert!(dispatcher.submit(query(1), callback.clone(), &[]).is_err());
    assert!(dispatcher
        .submit(query(2), callback, &[ChainId(1), ChainId(0)])
        .is_err());
}
