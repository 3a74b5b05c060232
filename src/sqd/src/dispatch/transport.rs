//! The boundary between a dispatcher and the transport that sends bytes.

use boxfnonce::SendBoxFnOnce;
use futures::channel::mpsc;

use crate::Query;

/// Sending half of a transport: dispatchers push [`DispatchedQuery`]s here and
/// the transport drains them in order.
pub type TransportTx = mpsc::UnboundedSender<DispatchedQuery>;

/// A query handed to the transport, paired with the reply handle that routes
/// the result back to the dispatching engine.
pub struct DispatchedQuery {
    /// The query to send. The transport owns it until the result is known.
    pub query: Query,
    /// Consumed exactly once to deliver the result.
    pub reply: ResponseHandle,
}

impl std::fmt::Debug for DispatchedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedQuery")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// Routes one transport result back into the mailbox of the engine that
/// dispatched the query.
///
/// The handle is bound to the node the query occupied at dispatch time; it
/// stays valid across the engine's internal storage compaction. Delivering to
/// an engine that has already stopped is a silent no-op.
pub struct ResponseHandle {
    deliver: SendBoxFnOnce<'static, (Query,)>,
}

impl ResponseHandle {
    pub(crate) fn new(deliver: impl FnOnce(Query) + Send + 'static) -> Self {
        ResponseHandle {
            deliver: SendBoxFnOnce::new(deliver),
        }
    }

    /// Delivers the query, with its result slot filled in, back to the
    /// dispatching engine.
    pub fn deliver(self, query: Query) {
        self.deliver.call(query);
    }
}
