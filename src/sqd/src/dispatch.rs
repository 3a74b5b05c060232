//! The dispatching engines and their contracts.
//!
//! Three engines share the plumbing in this module:
//!
//! - [`SequenceDispatcher`] serialises one chain of queries, repairing it when
//!   the server reports an ordering failure;
//! - [`MultiChainDispatcher`] schedules queries that belong to several chains
//!   at once, on top of [`ChainScheduler`](crate::ChainScheduler);
//! - [`DispatcherPool`] routes single-chain submissions to per-chain
//!   [`SequenceDispatcher`]s it creates and retires on demand.
//!
//! Every engine is a single-task actor: a handle enqueues messages onto an
//! unbounded mailbox, and a driver future (returned by the builder) processes
//! them one at a time. All waits (the transport round-trip, the callback's
//! resend decision) re-enter the actor as further mailbox messages, so
//! handlers never suspend and per-sender FIFO gives the ordering guarantees
//! documented in [`concepts`](crate::concepts).

use futures::channel::mpsc;

pub(crate) mod callback;
pub(crate) mod multi;
pub(crate) mod pool;
pub(crate) mod sequence;
pub(crate) mod transport;

pub use callback::{QueryCallback, ResendPromise};
pub use multi::{MultiChainDispatcher, MultiChainDispatcherBuilder};
pub use pool::{DispatcherPool, DispatcherPoolBuilder};
pub use sequence::{SequenceDispatcher, SequenceDispatcherBuilder, MAX_SIMULTANEOUS_WAIT};
pub use transport::{DispatchedQuery, ResponseHandle, TransportTx};

/// What a dispatcher reports to the component that owns it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParentEventKind {
    /// One query reached its terminal state.
    QueryFinished,
    /// The dispatcher has had no live work for the idle grace period and may
    /// be released. Advisory: a submission racing the report cancels it.
    ReadyToClose,
}

/// An event sent to a dispatcher's parent.
#[derive(Copy, Clone, Debug)]
pub struct ParentEvent {
    /// The token the parent registered the child under (the pool uses the
    /// chain id).
    pub token: u64,
    /// What happened.
    pub kind: ParentEventKind,
}

/// The parent side of a dispatcher: where lifecycle events are reported.
///
/// A parent hands one of these to each child it creates, all feeding one
/// event channel; the `token` tells the events apart. Events to a parent that
/// is no longer listening are dropped silently.
#[derive(Clone)]
pub struct ParentHandle {
    token: u64,
    tx: mpsc::UnboundedSender<ParentEvent>,
}

impl ParentHandle {
    /// Creates a handle reporting under `token` onto `tx`.
    pub fn new(token: u64, tx: mpsc::UnboundedSender<ParentEvent>) -> Self {
        ParentHandle { token, tx }
    }

    /// Reports one finished query.
    pub fn on_result(&self) {
        let _ = self.tx.unbounded_send(ParentEvent {
            token: self.token,
            kind: ParentEventKind::QueryFinished,
        });
    }

    /// Reports that the child has been idle for the grace period.
    pub fn ready_to_close(&self) {
        let _ = self.tx.unbounded_send(ParentEvent {
            token: self.token,
            kind: ParentEventKind::ReadyToClose,
        });
    }
}
