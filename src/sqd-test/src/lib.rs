//! Shared test support for the sqd workspace: an in-process transport that
//! records dispatches and answers them on demand, plus a scripted callback.

use futures::channel::mpsc;
use futures::StreamExt;
use sqd::{DispatchedQuery, Error, Query, QueryCallback, ResendPromise, TransportTx};

/// The receiving end of a dispatcher's transport channel.
///
/// Tests read dispatched queries in order, inspect their ordering metadata,
/// and answer each one exactly once through the captured reply handle.
pub struct MockTransport {
    rx: mpsc::UnboundedReceiver<DispatchedQuery>,
}

impl MockTransport {
    /// Creates the transport pair: the sender goes into a dispatcher builder,
    /// the `MockTransport` stays with the test.
    pub fn new() -> (TransportTx, MockTransport) {
        let (tx, rx) = mpsc::unbounded();
        (tx, MockTransport { rx })
    }

    /// Waits for the next dispatched query.
    pub async fn next(&mut self) -> InFlight {
        let DispatchedQuery { query, reply } =
            self.rx.next().await.expect("transport channel closed");
        InFlight { query, reply }
    }

    /// Returns a dispatched query if one is already buffered.
    pub fn try_next(&mut self) -> Option<InFlight> {
        match self.rx.try_next() {
            Ok(Some(DispatchedQuery { query, reply })) => Some(InFlight { query, reply }),
            _ => None,
        }
    }
}

/// A query the mock transport has accepted but not yet answered.
pub struct InFlight {
    /// The query as the dispatcher sent it.
    pub query: Query,
    reply: sqd::ResponseHandle,
}

impl InFlight {
    /// The dispatched query's id.
    pub fn id(&self) -> u64 {
        self.query.id()
    }

    /// Ids of the `invoke_after` predecessors attached at dispatch time.
    pub fn invoke_after_ids(&self) -> Vec<u64> {
        self.query
            .invoke_after()
            .iter()
            .map(|predecessor| predecessor.id())
            .collect()
    }

    /// Answers the query with a null success.
    pub fn succeed(self) {
        let InFlight { query, reply } = self;
        query.set_ok(serde_json::Value::Null);
        reply.deliver(query);
    }

    /// Answers the query with `error`.
    pub fn fail(self, error: Error) {
        let InFlight { query, reply } = self;
        query.set_error(error);
        reply.deliver(query);
    }
}

/// A request the engine forwarded to its callback for a resend decision.
pub struct ResendRequest {
    /// The query, result slot filled in.
    pub query: Query,
    /// The pending decision.
    pub promise: ResendPromise,
}

#[derive(Clone)]
enum Mode {
    AutoFinish(mpsc::UnboundedSender<Query>),
    Manual(mpsc::UnboundedSender<ResendRequest>),
}

/// A scripted [`QueryCallback`] for tests.
///
/// In auto-finish mode every delivered query is recorded and immediately
/// declined for resend; in manual mode the test receives the query together
/// with its promise and decides itself.
#[derive(Clone)]
pub struct TestCallback {
    mode: Mode,
}

impl TestCallback {
    /// A callback that declines every resend and records finished queries.
    pub fn auto_finish() -> (TestCallback, mpsc::UnboundedReceiver<Query>) {
        let (tx, rx) = mpsc::unbounded();
        (
            TestCallback {
                mode: Mode::AutoFinish(tx),
            },
            rx,
        )
    }

    /// A callback that forwards every resend decision to the test.
    pub fn manual() -> (TestCallback, mpsc::UnboundedReceiver<ResendRequest>) {
        let (tx, rx) = mpsc::unbounded();
        (
            TestCallback {
                mode: Mode::Manual(tx),
            },
            rx,
        )
    }
}

impl QueryCallback for TestCallback {
    fn on_result(&mut self, query: Query) {
        match &self.mode {
            Mode::AutoFinish(tx) => {
                let _ = tx.unbounded_send(query);
            }
            Mode::Manual(_) => unreachable!("engines deliver through on_result_resendable"),
        }
    }

    fn on_result_resendable(&mut self, query: Query, promise: ResendPromise) {
        match &self.mode {
            Mode::AutoFinish(tx) => {
                let _ = tx.unbounded_send(query);
                promise.finish();
            }
            Mode::Manual(tx) => {
                let _ = tx.unbounded_send(ResendRequest { query, promise });
            }
        }
    }
}

/// Lets every spawned actor drain its mailbox before the test continues.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}
