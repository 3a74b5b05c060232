//! The result-callback contract and the resend promise.

use boxfnonce::SendBoxFnOnce;

use crate::Query;

/// Receives the business-level outcome of a query.
///
/// The dispatching engines never interpret results beyond the ordering and
/// flood-control errors they recover from locally; everything else is handed
/// to the submission's callback, which arbitrates between retrying and
/// finishing via [`ResendPromise`].
pub trait QueryCallback: Send {
    /// Called with a query that reached a terminal state.
    fn on_result(&mut self, query: Query);

    /// Called with a query whose failure the engine is willing to retry.
    ///
    /// The promise must be fulfilled exactly once: with a (possibly rebuilt)
    /// query to retry it, or declined to finish the node. The default
    /// implementation delivers the result and declines.
    ///
    /// The node occupies an in-flight slot until the promise resolves, which
    /// deliberately throttles callbacks that are slow to decide.
    fn on_result_resendable(&mut self, query: Query, promise: ResendPromise) {
        self.on_result(query);
        promise.finish();
    }
}

impl QueryCallback for Box<dyn QueryCallback> {
    fn on_result(&mut self, query: Query) {
        (**self).on_result(query)
    }

    fn on_result_resendable(&mut self, query: Query, promise: ResendPromise) {
        (**self).on_result_resendable(query, promise)
    }
}

/// One-shot resend decision for a query offered back by a dispatching engine.
///
/// Dropping the promise without fulfilling it counts as [`finish`], so a
/// callback that loses interest cannot wedge the engine's in-flight slot.
///
/// [`finish`]: ResendPromise::finish
pub struct ResendPromise {
    fulfil: Option<SendBoxFnOnce<'static, (Option<Query>,)>>,
}

impl ResendPromise {
    pub(crate) fn new(fulfil: impl FnOnce(Option<Query>) + Send + 'static) -> Self {
        ResendPromise {
            fulfil: Some(SendBoxFnOnce::new(fulfil)),
        }
    }

    /// Asks the engine to retry `query` in place of the failed attempt.
    pub fn resend(mut self, query: Query) {
        if let Some(fulfil) = self.fulfil.take() {
            fulfil.call(Some(query));
        }
    }

    /// Declines the retry; the node finishes.
    pub fn finish(mut self) {
        if let Some(fulfil) = self.fulfil.take() {
            fulfil.call(None);
        }
    }
}

impl Drop for ResendPromise {
    fn drop(&mut self) {
        if let Some(fulfil) = self.fulfil.take() {
            tracing::warn!("resend promise dropped without a decision, finishing the query");
            fulfil.call(None);
        }
    }
}
