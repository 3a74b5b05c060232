//! Ordering, concurrency, and the shape of the engines.
//!
//! This module documents how the dispatching engines process work and the
//! guarantees you can rely on.
//!
//! # One mailbox, one task
//!
//! Every engine ([`SequenceDispatcher`], [`MultiChainDispatcher`],
//! [`DispatcherPool`]) is a single-task actor. Its handle enqueues messages
//! onto an unbounded mailbox; the driver future returned by the builder
//! processes them strictly one at a time. A handler always runs to
//! completion; there is no lock anywhere, and no handler ever suspends.
//!
//! The two logical waits in the system are modelled as *further messages*
//! rather than in-handler awaits:
//!
//! - between dispatching a query and receiving its transport result (the
//!   [`ResponseHandle`] routes the result back into the mailbox), and
//! - between offering a failed query to its callback and receiving the
//!   resend decision (the [`ResendPromise`] does the same).
//!
//! # Ordering guarantees
//!
//! For two queries A and B submitted on the same chain, A first:
//!
//! - the transport sees A dispatched before B;
//! - B carries A's weak reference as `invoke_after` until A finishes or the
//!   chain restarts;
//! - when a restart is triggered by A's failure, every query sent under the
//!   same generation is re-dispatched in its original order;
//! - a flood timeout observed on A's result defers only queries *behind* A,
//!   never earlier ones.
//!
//! Across chains there is no total order. A query on several chains is
//! released only once it is eligible on all of them.
//!
//! # Lifecycle
//!
//! Engines stop on explicit request: `hangup` drops everything on the floor,
//! `tear_down` fails live queries with [`Error::aborted`] first, and the
//! single-chain `close_silent` drops owned queries without firing callbacks.
//! Dropping all handles does **not** stop an engine, because results may
//! still be in transit from the transport.
//!
//! A [`SequenceDispatcher`] with a parent reports `ready_to_close` after an
//! idle grace period; the report is advisory, and a submission racing it
//! simply cancels the close. The [`DispatcherPool`] uses exactly this
//! handshake to retire per-chain dispatchers.
//!
//! [`SequenceDispatcher`]: crate::SequenceDispatcher
//! [`MultiChainDispatcher`]: crate::MultiChainDispatcher
//! [`DispatcherPool`]: crate::DispatcherPool
//! [`ResponseHandle`]: crate::ResponseHandle
//! [`ResendPromise`]: crate::ResendPromise
//! [`Error::aborted`]: crate::Error::aborted
