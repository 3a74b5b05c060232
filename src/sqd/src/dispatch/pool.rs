//! Routing of single-chain submissions to per-chain dispatchers.
//!
//! The pool creates a [`SequenceDispatcher`] per chain id on first use and
//! hosts its driver on an internal [`FuturesUnordered`], so one task drives
//! the pool and all of its children. A per-chain outstanding count plus the
//! children's idle-close handshake decides when a chain dispatcher is
//! retired; a submission that arrives between the handshake and the retire
//! keeps the dispatcher alive.

use std::future::Future;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use fxhash::FxHashMap;

use crate::dispatch::callback::QueryCallback;
use crate::dispatch::sequence::SequenceDispatcher;
use crate::dispatch::transport::TransportTx;
use crate::dispatch::{ParentEvent, ParentEventKind, ParentHandle};
use crate::{Error, Query};

enum PoolMessage {
    Submit {
        query: Query,
        callback: Box<dyn QueryCallback>,
        chain_id: u64,
    },
    Hangup,
}

/// Handle to a running dispatcher pool.
#[derive(Clone)]
pub struct DispatcherPool {
    tx: mpsc::UnboundedSender<PoolMessage>,
}

impl DispatcherPool {
    /// Starts configuring a pool.
    pub fn builder() -> DispatcherPoolBuilder {
        DispatcherPoolBuilder { name: None }
    }

    /// Submits a query on a single chain, creating the chain's dispatcher on
    /// first use. Chain id zero is reserved.
    pub fn submit(
        &self,
        query: Query,
        callback: impl QueryCallback + 'static,
        chain_id: u64,
    ) -> Result<(), Error> {
        if chain_id == 0 {
            return Err(Error::new(400, "chain id zero is reserved"));
        }
        self.tx
            .unbounded_send(PoolMessage::Submit {
                query,
                callback: Box::new(callback),
                chain_id,
            })
            .map_err(|_| Error::closed())
    }

    /// Stops the pool and every chain dispatcher immediately. Queries in
    /// flight are abandoned and their callbacks never fire.
    pub fn hangup(&self) -> Result<(), Error> {
        self.tx
            .unbounded_send(PoolMessage::Hangup)
            .map_err(|_| Error::closed())
    }
}

/// Configures and launches a [`DispatcherPool`].
pub struct DispatcherPoolBuilder {
    name: Option<String>,
}

impl DispatcherPoolBuilder {
    /// Names the pool in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the handle and the driver future; the driver hosts the pool and
    /// all chain dispatchers it creates.
    pub fn build(
        self,
        transport: TransportTx,
    ) -> (
        DispatcherPool,
        impl Future<Output = Result<(), Error>> + Send,
    ) {
        let (tx, rx) = mpsc::unbounded();
        let (events_tx, events_rx) = mpsc::unbounded();
        let state = PoolState {
            name: self.name,
            transport,
            events_tx,
            entries: FxHashMap::default(),
        };
        (DispatcherPool { tx }, pool_actor(state, rx, events_rx))
    }
}

struct ChainEntry {
    dispatcher: SequenceDispatcher,
    outstanding: usize,
}

struct PoolState {
    name: Option<String>,
    transport: TransportTx,
    events_tx: mpsc::UnboundedSender<ParentEvent>,
    entries: FxHashMap<u64, ChainEntry>,
}

async fn pool_actor(
    mut pool: PoolState,
    mut mailbox: mpsc::UnboundedReceiver<PoolMessage>,
    mut events: mpsc::UnboundedReceiver<ParentEvent>,
) -> Result<(), Error> {
    let mut children: FuturesUnordered<BoxFuture<'static, Result<(), Error>>> =
        FuturesUnordered::new();
    loop {
        futures::select! {
            message = mailbox.next() => match message {
                Some(PoolMessage::Submit { query, callback, chain_id }) => {
                    if let Some(driver) = pool.submit(query, callback, chain_id)? {
                        children.push(driver);
                    }
                }
                Some(PoolMessage::Hangup) | None => break,
            },
            event = events.next() => {
                if let Some(event) = event {
                    pool.on_parent_event(event);
                }
            }
            result = children.select_next_some() => {
                if let Err(error) = result {
                    tracing::warn!(name = ?pool.name, %error, "dispatcher_pool: chain dispatcher stopped with error");
                }
            }
        }
    }
    Ok(())
}

impl PoolState {
    fn submit(
        &mut self,
        query: Query,
        callback: Box<dyn QueryCallback>,
        chain_id: u64,
    ) -> Result<Option<BoxFuture<'static, Result<(), Error>>>, Error> {
        let mut driver = None;
        if !self.entries.contains_key(&chain_id) {
            tracing::debug!(name = ?self.name, chain_id, "dispatcher_pool: creating chain dispatcher");
            let parent = ParentHandle::new(chain_id, self.events_tx.clone());
            let (dispatcher, child) = SequenceDispatcher::builder()
                .name(format!("chain-{chain_id}"))
                .parent(parent)
                .build(self.transport.clone());
            driver = Some(child.boxed());
            self.entries.insert(
                chain_id,
                ChainEntry {
                    dispatcher,
                    outstanding: 0,
                },
            );
        }
        let entry = self
            .entries
            .get_mut(&chain_id)
            .expect("entry created above");
        entry.outstanding += 1;
        entry.dispatcher.submit_boxed(query, callback)?;
        Ok(driver)
    }

    fn on_parent_event(&mut self, event: ParentEvent) {
        match event.kind {
            ParentEventKind::QueryFinished => {
                if let Some(entry) = self.entries.get_mut(&event.token) {
                    entry.outstanding = entry.outstanding.saturating_sub(1);
                }
            }
            ParentEventKind::ReadyToClose => {
                let idle = self
                    .entries
                    .get(&event.token)
                    .is_some_and(|entry| entry.outstanding == 0);
                if idle {
                    tracing::debug!(
                        name = ?self.name,
                        chain_id = event.token,
                        "dispatcher_pool: closing idle chain dispatcher"
                    );
                    let entry = self
                        .entries
                        .remove(&event.token)
                        .expect("checked above");
                    let _ = entry.dispatcher.hangup();
                }
            }
        }
    }
}
