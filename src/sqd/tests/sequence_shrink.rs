//! Storage compaction under load: finished prefixes are reclaimed while
//! results for queries still in flight keep resolving to the right nodes.

use std::collections::VecDeque;

use futures::StreamExt;
use sqd::{Query, SequenceDispatcher};
use sqd_test::{MockTransport, TestCallback};

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn compaction_keeps_result_tokens_stable() {
    let (transport_tx, mut transport) = MockTransport::new();
    let (dispatcher, driver) = SequenceDispatcher::builder().build(transport_tx);
    tokio::spawn(driver);

    let (callback, mut finished) = TestCallback::auto_finish();
    let queries: Vec<Query> = (1..=12)
        .map(|n| Query::new(serde_json::json!({ "n": n })))
        .collect();
    let ids: Vec<u64> = queries.iter().map(Query::id).collect();
    for q in queries {
        dispatcher.submit(q, callback.clone()).unwrap();
    }

    // The cap admits the first ten; the rest follow as slots free up.
    let mut inflight = VecDeque::new();
    for expected in &ids[..10] {
        let d = transport.next().await;
        assert_eq!(d.id(), *expected);
        inflight.push_back(d);
    }

    // Finishing the first seven in order pushes the finished prefix past
    // half of the queue, which triggers compaction.
    for k in 0..7 {
        inflight.pop_front().unwrap().succeed();
        assert_eq!(finished.next().await.unwrap().id(), ids[k]);
        if k < 2 {
            inflight.push_back(transport.next().await);
        }
    }

    // The five survivors were dispatched before the shrink; their results
    // must still land on the right queries.
    for k in 7..12 {
        let d = inflight.pop_front().unwrap();
        assert_eq!(d.id(), ids[k]);
        d.succeed();
        assert_eq!(finished.next().await.unwrap().id(), ids[k]);
    }
}
