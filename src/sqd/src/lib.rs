#![deny(missing_docs)]

//! # sqd -- sequenced query dispatch
//!
//! **sqd** coordinates remote procedure calls that must execute in order.
//! Callers tag each query with one or more *chain* ids; for every chain, the
//! server observes the queries in submission order, enforced on the wire by
//! an `invoke_after` attachment naming the predecessors a query may not
//! overtake. When the server refuses a query because a predecessor failed,
//! the dispatcher repairs the chain locally: the dependent tail is resent
//! rather than silently reordered.
//!
//! ## The pieces
//!
//! - [`SequenceDispatcher`] - one chain, dispatched through a state machine
//!   with retry generations, an in-flight cap, flood-timeout propagation and
//!   storage compaction.
//! - [`MultiChainDispatcher`] - queries belonging to several chains at once,
//!   scheduled by the generic [`ChainScheduler`].
//! - [`DispatcherPool`] - routes single-chain submissions to per-chain
//!   [`SequenceDispatcher`]s, created lazily and retired when idle.
//!
//! The transport that actually sends bytes stays outside this crate: engines
//! push [`DispatchedQuery`]s onto a channel, and the transport answers each
//! one through its [`ResponseHandle`]. Business-level outcomes go to the
//! submission's [`QueryCallback`], which arbitrates retry-vs-finish through a
//! [`ResendPromise`].
//!
//! ## Quick start
//!
//! ```no_run
//! use futures::channel::mpsc;
//! use futures::StreamExt;
//! use sqd::{ChainId, DispatchedQuery, MultiChainDispatcher, Query, QueryCallback};
//!
//! struct Printer;
//!
//! impl QueryCallback for Printer {
//!     fn on_result(&mut self, query: Query) {
//!         println!("{query:?} -> {:?}", query.result());
//!     }
//! }
//!
//! # async fn run() -> Result<(), sqd::Error> {
//! let (transport_tx, mut transport_rx) = mpsc::unbounded();
//! let (dispatcher, driver) = MultiChainDispatcher::builder().build(transport_tx);
//! tokio::spawn(driver);
//!
//! dispatcher.submit(
//!     Query::new(serde_json::json!({"method": "ping"})),
//!     Printer,
//!     &[ChainId(1)],
//! )?;
//!
//! // The transport side: execute each dispatched query and answer it.
//! while let Some(dispatched) = transport_rx.next().await {
//!     let DispatchedQuery { query, reply } = dispatched;
//!     query.set_ok(serde_json::Value::Null);
//!     reply.deliver(query);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The [`concepts`] module explains the actor model behind the engines and
//! the exact ordering guarantees.

/// Ordering, concurrency, and lifecycle, explained.
pub mod concepts;
/// The dispatching engines and their contracts.
mod dispatch;
/// The wire-style error value.
mod error;
/// The query handle and its weak reference.
mod query;
/// The generic multi-chain task scheduler.
pub mod scheduler;

pub use dispatch::{
    DispatchedQuery, DispatcherPool, DispatcherPoolBuilder, MultiChainDispatcher,
    MultiChainDispatcherBuilder, ParentEvent, ParentEventKind, ParentHandle, QueryCallback,
    ResendPromise, ResponseHandle, SequenceDispatcher, SequenceDispatcherBuilder, TransportTx,
    MAX_SIMULTANEOUS_WAIT,
};
pub use error::{Error, MSG_WAIT_FAILED, MSG_WAIT_TIMEOUT};
pub use query::{Query, QueryRef, DEFAULT_TOTAL_TIMEOUT_LIMIT};
pub use scheduler::{ChainId, ChainScheduler, StartedTask, TaskId};
