//! The multi-chain dispatcher actor.
//!
//! A thin façade over [`ChainScheduler`]: every submission becomes a
//! scheduler task tagged with its chain ids, and each released task is sent
//! with an `invoke_after` attachment built from the scheduler's predecessor
//! set. Resends go back through `reset_task`, which reinserts the task at its
//! original chain position so later chain members keep waiting behind it.

use std::future::Future;

use futures::channel::mpsc;
use futures::StreamExt;

use crate::dispatch::callback::{QueryCallback, ResendPromise};
use crate::dispatch::transport::{DispatchedQuery, ResponseHandle, TransportTx};
use crate::scheduler::{ChainId, ChainScheduler, TaskId};
use crate::{Error, Query, QueryRef};

struct MultiNode {
    query_ref: QueryRef,
    // Empty while the query is at the transport or at the callback.
    query: Option<Query>,
    callback: Box<dyn QueryCallback>,
}

enum MultiMessage {
    Submit {
        query: Query,
        callback: Box<dyn QueryCallback>,
        chains: Vec<ChainId>,
    },
    Result {
        task_id: TaskId,
        query: Query,
    },
    ResendOk {
        task_id: TaskId,
        query: Query,
    },
    ResendErr {
        task_id: TaskId,
    },
    Hangup,
    TearDown,
}

/// Handle to a running multi-chain dispatcher.
///
/// Cheap to clone; all methods enqueue a message for the actor and only fail
/// if the actor has already stopped. Like [`SequenceDispatcher`], the actor
/// runs until [`hangup`](Self::hangup) or [`tear_down`](Self::tear_down) is
/// delivered.
///
/// [`SequenceDispatcher`]: crate::SequenceDispatcher
#[derive(Clone)]
pub struct MultiChainDispatcher {
    tx: mpsc::UnboundedSender<MultiMessage>,
}

impl MultiChainDispatcher {
    /// Starts configuring a dispatcher.
    pub fn builder() -> MultiChainDispatcherBuilder {
        MultiChainDispatcherBuilder { name: None }
    }

    /// Submits a query belonging to every chain in `chains`.
    ///
    /// The list must be non-empty and chain id zero is reserved; violating
    /// either returns an error without enqueueing anything. The first chain id
    /// also seeds the query's session affinity, biasing retries to one server
    /// session.
    pub fn submit(
        &self,
        query: Query,
        callback: impl QueryCallback + 'static,
        chains: &[ChainId],
    ) -> Result<(), Error> {
        if chains.is_empty() || chains.iter().any(|chain| chain.0 == 0) {
            return Err(Error::new(
                400,
                "submission requires at least one non-zero chain id",
            ));
        }
        self.send(MultiMessage::Submit {
            query,
            callback: Box::new(callback),
            chains: chains.to_vec(),
        })
    }

    /// Stops the dispatcher immediately.
    pub fn hangup(&self) -> Result<(), Error> {
        self.send(MultiMessage::Hangup)
    }

    /// Fails every live query with [`Error::aborted`] and stops.
    pub fn tear_down(&self) -> Result<(), Error> {
        self.send(MultiMessage::TearDown)
    }

    fn send(&self, message: MultiMessage) -> Result<(), Error> {
        self.tx.unbounded_send(message).map_err(|_| Error::closed())
    }
}

/// Configures and launches a [`MultiChainDispatcher`].
pub struct MultiChainDispatcherBuilder {
    name: Option<String>,
}

impl MultiChainDispatcherBuilder {
    /// Names the dispatcher in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the handle and the driver future; see
    /// [`SequenceDispatcherBuilder::build`](crate::SequenceDispatcherBuilder::build).
    pub fn build(
        self,
        transport: TransportTx,
    ) -> (
        MultiChainDispatcher,
        impl Future<Output = Result<(), Error>> + Send,
    ) {
        let (tx, rx) = mpsc::unbounded();
        let state = MultiState {
            name: self.name,
            scheduler: ChainScheduler::new(),
            transport,
            self_tx: tx.clone(),
        };
        (MultiChainDispatcher { tx }, multi_chain_actor(state, rx))
    }
}

struct MultiState {
    name: Option<String>,
    scheduler: ChainScheduler<MultiNode>,
    transport: TransportTx,
    self_tx: mpsc::UnboundedSender<MultiMessage>,
}

async fn multi_chain_actor(
    mut dispatcher: MultiState,
    mut mailbox: mpsc::UnboundedReceiver<MultiMessage>,
) -> Result<(), Error> {
    while let Some(message) = mailbox.next().await {
        match message {
            MultiMessage::Submit {
                query,
                callback,
                chains,
            } => dispatcher.submit(query, callback, chains)?,
            MultiMessage::Result { task_id, query } => dispatcher.on_result(task_id, query)?,
            MultiMessage::ResendOk { task_id, query } => {
                dispatcher.on_resend(task_id, Some(query))?
            }
            MultiMessage::ResendErr { task_id } => dispatcher.on_resend(task_id, None)?,
            MultiMessage::Hangup => break,
            MultiMessage::TearDown => {
                dispatcher.tear_down();
                break;
            }
        }
    }
    Ok(())
}

impl MultiState {
    fn submit(
        &mut self,
        query: Query,
        callback: Box<dyn QueryCallback>,
        chains: Vec<ChainId>,
    ) -> Result<(), Error> {
        query.set_session_rand((chains[0].0 >> 10) as u32);
        tracing::trace!(name = ?self.name, ?query, ?chains, "multi_chain_dispatcher: query enqueued");
        let query_ref = query.get_weak();
        self.scheduler.create_task(
            &chains,
            MultiNode {
                query_ref,
                query: Some(query),
                callback,
            },
        );
        self.flush_pending_queries()
    }

    fn on_result(&mut self, task_id: TaskId, query: Query) -> Result<(), Error> {
        let out_of_order = query.error().is_some_and(|error| error.is_out_of_order());
        if out_of_order {
            tracing::debug!(
                name = ?self.name,
                ?query,
                "multi_chain_dispatcher: server refused ordering, resending"
            );
            query.resend();
            return self.on_resend(task_id, Some(query));
        }

        let tx = self.self_tx.clone();
        let promise = ResendPromise::new(move |query| {
            let message = match query {
                Some(query) => MultiMessage::ResendOk { task_id, query },
                None => MultiMessage::ResendErr { task_id },
            };
            let _ = tx.unbounded_send(message);
        });
        let node = self
            .scheduler
            .get_extra(task_id)
            .expect("result for a live task");
        node.callback.on_result_resendable(query, promise);
        Ok(())
    }

    fn on_resend(&mut self, task_id: TaskId, query: Option<Query>) -> Result<(), Error> {
        match query {
            Some(query) => {
                let node = self
                    .scheduler
                    .get_extra(task_id)
                    .expect("resend for a live task");
                node.query_ref = query.get_weak();
                node.query = Some(query);
                self.scheduler.reset_task(task_id);
            }
            None => self.scheduler.finish_task(task_id),
        }
        self.flush_pending_queries()
    }

    fn flush_pending_queries(&mut self) -> Result<(), Error> {
        while let Some(started) = self.scheduler.start_next_task() {
            let task_id = started.task_id;
            let query = self
                .scheduler
                .get_extra(task_id)
                .expect("released task is live")
                .query
                .take()
                .expect("pending task owns its query");

            let mut parents = Vec::with_capacity(started.parents.len());
            for parent_id in started.parents {
                let parent = self
                    .scheduler
                    .get_extra(parent_id)
                    .expect("parent of a released task is live");
                assert!(!parent.query_ref.is_expired());
                parents.push(parent.query_ref.clone());
            }

            query.set_invoke_after(parents);
            query.set_last_timeout(0.0);
            tracing::trace!(
                name = ?self.name,
                ?query,
                task = task_id.get(),
                "multi_chain_dispatcher: dispatching query"
            );
            let tx = self.self_tx.clone();
            let reply = ResponseHandle::new(move |query| {
                let _ = tx.unbounded_send(MultiMessage::Result { task_id, query });
            });
            if let Err(send_error) = self.transport.unbounded_send(DispatchedQuery { query, reply })
            {
                let DispatchedQuery { query, .. } = send_error.into_inner();
                self.scheduler
                    .get_extra(task_id)
                    .expect("released task is live")
                    .query = Some(query);
                tracing::warn!(name = ?self.name, "multi_chain_dispatcher: transport closed, stopping");
                return Err(Error::closed());
            }
        }
        Ok(())
    }

    fn tear_down(&mut self) {
        // Leaves the scheduler in an inconsistent state; nothing runs after
        // teardown.
        self.scheduler.for_each(|node| {
            if let Some(query) = &node.query {
                query.set_error(Error::aborted());
            }
        });
    }
}
