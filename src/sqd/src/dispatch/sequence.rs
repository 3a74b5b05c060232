//! The single-chain dispatcher actor.
//!
//! Sends queries with an `invoke_after` reference to the previously sent
//! query, so the server refuses to execute them out of order, and repairs the
//! chain when the server reports such a refusal.
//!
//! Each query walks Start → Wait → Finish, with a transient Dummy state held
//! while a resend decision is pending. `finish_i` points at the first
//! non-Finish node, `next_i` at the next node to send. Every node records the
//! chain *generation* it was sent under: when a sent query fails and its
//! generation still equals the current one, the chain restarts: the
//! generation is incremented and `next_i` moves back to `finish_i`. Nodes
//! dispatched after a restart already carry the new generation, so their
//! failures from the same incident do not restart the chain again.
//! `last_sent_i` tracks the most recently sent node of the current chain.

use std::collections::VecDeque;
use std::future::Future;

use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use tokio::time::{Duration, Instant};

use crate::dispatch::callback::{QueryCallback, ResendPromise};
use crate::dispatch::transport::{DispatchedQuery, ResponseHandle, TransportTx};
use crate::dispatch::ParentHandle;
use crate::{Error, Query, QueryRef};

/// Cap on simultaneously outstanding queries per dispatcher. Bounds both
/// transport load and the number of resend decisions pending at callbacks.
pub const MAX_SIMULTANEOUS_WAIT: usize = 10;

const IDLE_CLOSE_GRACE: Duration = Duration::from_secs(5);
const IDLE_CLOSE_RECHECK: Duration = Duration::from_secs(1);
const SHRINK_MIN_LEN: usize = 5;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum NodeState {
    Start,
    Wait,
    Dummy,
    Finish,
}

struct Node {
    // Empty while the query is at the transport or at the callback.
    query: Option<Query>,
    // Stable across resends within the node; refreshed when the callback
    // substitutes a new query.
    query_ref: QueryRef,
    callback: Box<dyn QueryCallback>,
    generation: u64,
    total_timeout: f64,
    last_timeout: f64,
    state: NodeState,
}

enum SequenceMessage {
    Submit {
        query: Query,
        callback: Box<dyn QueryCallback>,
    },
    Result {
        token: u64,
        query: Query,
    },
    ResendOk {
        token: u64,
        query: Query,
    },
    ResendErr {
        token: u64,
    },
    Hangup,
    TearDown,
    CloseSilent,
}

/// Handle to a running single-chain dispatcher.
///
/// Cheap to clone; all methods enqueue a message for the actor and only fail
/// if the actor has already stopped. The actor keeps running until one of
/// [`hangup`](Self::hangup), [`tear_down`](Self::tear_down) or
/// [`close_silent`](Self::close_silent) is delivered; dropping every handle
/// does not stop it, since results may still be in flight.
#[derive(Clone)]
pub struct SequenceDispatcher {
    tx: mpsc::UnboundedSender<SequenceMessage>,
}

impl SequenceDispatcher {
    /// Starts configuring a dispatcher.
    pub fn builder() -> SequenceDispatcherBuilder {
        SequenceDispatcherBuilder {
            name: None,
            parent: None,
        }
    }

    /// Enqueues a query at the tail of the chain.
    pub fn submit(
        &self,
        query: Query,
        callback: impl QueryCallback + 'static,
    ) -> Result<(), Error> {
        self.submit_boxed(query, Box::new(callback))
    }

    pub(crate) fn submit_boxed(
        &self,
        query: Query,
        callback: Box<dyn QueryCallback>,
    ) -> Result<(), Error> {
        self.send(SequenceMessage::Submit { query, callback })
    }

    /// Stops the dispatcher immediately. Queries in flight are abandoned and
    /// their callbacks never fire.
    pub fn hangup(&self) -> Result<(), Error> {
        self.send(SequenceMessage::Hangup)
    }

    /// Fails every live query with [`Error::aborted`] and stops.
    pub fn tear_down(&self) -> Result<(), Error> {
        self.send(SequenceMessage::TearDown)
    }

    /// Drops every live query without invoking callbacks, then stops. For use
    /// when the caller guarantees a coarser-grained teardown.
    pub fn close_silent(&self) -> Result<(), Error> {
        self.send(SequenceMessage::CloseSilent)
    }

    fn send(&self, message: SequenceMessage) -> Result<(), Error> {
        self.tx.unbounded_send(message).map_err(|_| Error::closed())
    }
}

/// Configures and launches a [`SequenceDispatcher`].
pub struct SequenceDispatcherBuilder {
    name: Option<String>,
    parent: Option<ParentHandle>,
}

impl SequenceDispatcherBuilder {
    /// Names the dispatcher in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registers a parent to receive finish counts and the idle-close
    /// handshake. Without a parent the idle timer is never armed.
    pub fn parent(mut self, parent: ParentHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Builds the handle and the driver future. The driver must be polled
    /// (typically spawned) for the dispatcher to make progress; it resolves
    /// when the dispatcher stops.
    pub fn build(
        self,
        transport: TransportTx,
    ) -> (
        SequenceDispatcher,
        impl Future<Output = Result<(), Error>> + Send,
    ) {
        let (tx, rx) = mpsc::unbounded();
        let state = SequenceState {
            name: self.name,
            data: VecDeque::new(),
            finish_i: 0,
            next_i: 0,
            last_sent_i: None,
            id_offset: 0,
            wait_cnt: 0,
            generation: 0,
            // Retries stay on one server session, which improves the server's
            // chance of honouring invoke_after across them.
            session_rand: uuid::Uuid::new_v4().as_u128() as u32,
            transport,
            parent: self.parent,
            self_tx: tx.clone(),
            idle_deadline: None,
        };
        (SequenceDispatcher { tx }, sequence_actor(state, rx))
    }
}

struct SequenceState {
    name: Option<String>,
    data: VecDeque<Node>,
    // data[0..finish_i) are all Finish; next_i >= finish_i.
    finish_i: usize,
    next_i: usize,
    last_sent_i: Option<usize>,
    id_offset: u64,
    wait_cnt: usize,
    generation: u64,
    session_rand: u32,
    transport: TransportTx,
    parent: Option<ParentHandle>,
    self_tx: mpsc::UnboundedSender<SequenceMessage>,
    idle_deadline: Option<Instant>,
}

async fn sequence_actor(
    mut dispatcher: SequenceState,
    mut mailbox: mpsc::UnboundedReceiver<SequenceMessage>,
) -> Result<(), Error> {
    loop {
        let message = if let Some(deadline) = dispatcher.idle_deadline {
            let sleep = tokio::time::sleep_until(deadline).fuse();
            futures::pin_mut!(sleep);
            futures::select! {
                message = mailbox.next() => message,
                _ = sleep => {
                    dispatcher.idle_deadline = None;
                    dispatcher.timeout_expired();
                    continue;
                }
            }
        } else {
            mailbox.next().await
        };
        let Some(message) = message else { break };
        match message {
            SequenceMessage::Submit { query, callback } => dispatcher.submit(query, callback)?,
            SequenceMessage::Result { token, query } => dispatcher.on_result(token, query)?,
            SequenceMessage::ResendOk { token, query } => dispatcher.on_resend_ok(token, query)?,
            SequenceMessage::ResendErr { token } => dispatcher.on_resend_err(token)?,
            SequenceMessage::Hangup => break,
            SequenceMessage::TearDown => {
                dispatcher.tear_down();
                break;
            }
            SequenceMessage::CloseSilent => {
                dispatcher.close_silent();
                break;
            }
        }
    }
    Ok(())
}

impl SequenceState {
    fn submit(&mut self, query: Query, callback: Box<dyn QueryCallback>) -> Result<(), Error> {
        self.idle_deadline = None;
        tracing::trace!(name = ?self.name, ?query, "sequence_dispatcher: query enqueued");
        let query_ref = query.get_weak();
        self.data.push_back(Node {
            query: Some(query),
            query_ref,
            callback,
            generation: 0,
            total_timeout: 0.0,
            last_timeout: 0.0,
            state: NodeState::Start,
        });
        self.pump()
    }

    fn check_timeout(&mut self, pos: usize) {
        {
            let node = &mut self.data[pos];
            if node.state != NodeState::Start {
                return;
            }
            let query = node.query.as_ref().expect("query owned while in Start");
            query.add_total_timeout(node.total_timeout);
            node.total_timeout = 0.0;
            if query.total_timeout() <= query.total_timeout_limit() {
                return;
            }
            tracing::warn!(
                ?query,
                total_timeout = query.total_timeout(),
                limit = query.total_timeout_limit(),
                "sequence_dispatcher: query exceeded its total timeout limit"
            );
            let retry_after = (node.last_timeout + 0.999) as i32;
            query.set_error(Error::too_many_requests(retry_after));
            node.state = NodeState::Dummy;
        }
        let query = self.data[pos]
            .query
            .take()
            .expect("query owned while in Dummy");
        self.try_resend_query(pos, query);
    }

    fn try_resend_query(&mut self, pos: usize, query: Query) {
        let token = pos as u64 + self.id_offset;
        let tx = self.self_tx.clone();
        let promise = ResendPromise::new(move |query| {
            let message = match query {
                Some(query) => SequenceMessage::ResendOk { token, query },
                None => SequenceMessage::ResendErr { token },
            };
            let _ = tx.unbounded_send(message);
        });
        let node = &mut self.data[pos];
        assert_eq!(node.state, NodeState::Dummy);
        node.state = NodeState::Wait;
        self.wait_cnt += 1;
        node.callback.on_result_resendable(query, promise);
    }

    fn node_from_token(&mut self, token: u64) -> usize {
        assert!(token >= self.id_offset, "result token from before compaction");
        let pos = (token - self.id_offset) as usize;
        assert!(pos < self.data.len(), "result token out of range");
        let node = &mut self.data[pos];
        assert_eq!(node.state, NodeState::Wait, "result for a node not in Wait");
        assert!(self.wait_cnt > 0);
        self.wait_cnt -= 1;
        node.state = NodeState::Dummy;
        pos
    }

    fn on_resend_ok(&mut self, token: u64, query: Query) -> Result<(), Error> {
        let pos = self.node_from_token(token);
        let node = &mut self.data[pos];
        node.query_ref = query.get_weak();
        node.query = Some(query);
        self.do_resend(pos);
        self.pump()
    }

    fn on_resend_err(&mut self, token: u64) -> Result<(), Error> {
        let pos = self.node_from_token(token);
        self.do_finish(pos);
        self.pump()
    }

    fn do_resend(&mut self, pos: usize) {
        let node = &mut self.data[pos];
        assert_eq!(node.state, NodeState::Dummy);
        node.state = NodeState::Start;
        // A failure from the current chain starts a new one; failures of
        // nodes sent before an earlier restart must not restart again.
        if node.generation == self.generation {
            self.next_i = self.finish_i;
            self.generation += 1;
            self.last_sent_i = None;
        }
        self.check_timeout(pos);
    }

    fn do_finish(&mut self, pos: usize) {
        let node = &mut self.data[pos];
        assert_eq!(node.state, NodeState::Dummy);
        node.state = NodeState::Finish;
        if let Some(parent) = &self.parent {
            parent.on_result();
        }
    }

    fn on_result(&mut self, token: u64, query: Query) -> Result<(), Error> {
        let pos = self.node_from_token(token);

        // A flood hint on this result defers every query queued behind it.
        let flood = query.last_timeout();
        if flood != 0.0 {
            for i in pos + 1..self.data.len() {
                self.data[i].total_timeout += flood;
                self.data[i].last_timeout = flood;
                self.check_timeout(i);
            }
        }

        let out_of_order = query.error().is_some_and(|error| error.is_out_of_order());
        if out_of_order {
            tracing::debug!(
                name = ?self.name,
                ?query,
                "sequence_dispatcher: server refused ordering, resending"
            );
            query.resend();
            self.data[pos].query = Some(query);
            self.do_resend(pos);
        } else {
            // TODO: successful results could skip the resend round-trip and
            // be delivered through QueryCallback::on_result directly.
            self.try_resend_query(pos, query);
        }
        self.pump()
    }

    fn pump(&mut self) -> Result<(), Error> {
        while self.finish_i < self.data.len()
            && self.data[self.finish_i].state == NodeState::Finish
        {
            self.finish_i += 1;
        }
        if self.next_i < self.finish_i {
            self.next_i = self.finish_i;
        }
        while self.next_i < self.data.len()
            && self.data[self.next_i].state != NodeState::Wait
            && self.wait_cnt < MAX_SIMULTANEOUS_WAIT
        {
            if self.data[self.next_i].state == NodeState::Finish {
                self.next_i += 1;
                continue;
            }
            let invoke_after = match self.last_sent_i {
                Some(last) if self.data[last].state == NodeState::Wait => {
                    vec![self.data[last].query_ref.clone()]
                }
                _ => Vec::new(),
            };
            let pos = self.next_i;
            let token = pos as u64 + self.id_offset;
            let query = self.data[pos]
                .query
                .take()
                .expect("query owned while in Start");
            query.set_invoke_after(invoke_after);
            query.set_last_timeout(0.0);
            query.set_session_rand(self.session_rand);
            tracing::trace!(
                name = ?self.name,
                ?query,
                token,
                "sequence_dispatcher: dispatching query"
            );
            let tx = self.self_tx.clone();
            let reply = ResponseHandle::new(move |query| {
                let _ = tx.unbounded_send(SequenceMessage::Result { token, query });
            });
            if let Err(send_error) = self.transport.unbounded_send(DispatchedQuery { query, reply }) {
                let DispatchedQuery { query, .. } = send_error.into_inner();
                self.data[pos].query = Some(query);
                tracing::warn!(name = ?self.name, "sequence_dispatcher: transport closed, stopping");
                return Err(Error::closed());
            }
            self.data[pos].state = NodeState::Wait;
            self.wait_cnt += 1;
            self.data[pos].generation = self.generation;
            self.last_sent_i = Some(pos);
            self.next_i += 1;
        }

        self.try_shrink();

        if self.finish_i == self.data.len() && self.parent.is_some() {
            self.idle_deadline = Some(Instant::now() + IDLE_CLOSE_GRACE);
        }
        Ok(())
    }

    fn try_shrink(&mut self) {
        if self.finish_i * 2 > self.data.len() && self.data.len() > SHRINK_MIN_LEN {
            assert!(self.finish_i <= self.next_i);
            self.data.drain(..self.finish_i);
            self.next_i -= self.finish_i;
            self.last_sent_i = match self.last_sent_i {
                Some(last) if last >= self.finish_i => Some(last - self.finish_i),
                _ => None,
            };
            // Keeps pos + id_offset stable for results still in transit.
            self.id_offset += self.finish_i as u64;
            self.finish_i = 0;
        }
    }

    fn timeout_expired(&mut self) {
        if self.finish_i != self.data.len() {
            return;
        }
        let parent = self
            .parent
            .as_ref()
            .expect("idle timer armed only with a parent");
        self.idle_deadline = Some(Instant::now() + IDLE_CLOSE_RECHECK);
        tracing::debug!(name = ?self.name, "sequence_dispatcher: ready to close");
        parent.ready_to_close();
    }

    fn tear_down(&mut self) {
        for pos in 0..self.data.len() {
            if self.data[pos].query.is_none() {
                continue;
            }
            self.data[pos].state = NodeState::Dummy;
            self.data[pos]
                .query
                .as_ref()
                .expect("checked above")
                .set_error(Error::aborted());
            self.do_finish(pos);
        }
    }

    fn close_silent(&mut self) {
        for node in &mut self.data {
            node.query = None;
        }
    }
}
