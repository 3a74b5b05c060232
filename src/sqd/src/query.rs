//! The query handle and its non-owning weak reference.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::Error;

/// Default per-query ceiling on accumulated flood timeouts, in seconds.
pub const DEFAULT_TOTAL_TIMEOUT_LIMIT: f64 = 60.0;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

struct QueryState {
    payload: serde_json::Value,
    invoke_after: Vec<QueryRef>,
    session_rand: u32,
    last_timeout: f64,
    total_timeout: f64,
    total_timeout_limit: f64,
    result: Option<Result<serde_json::Value, Error>>,
    resend_count: u32,
}

/// An owned handle to one outbound query.
///
/// A `Query` is exclusively owned at every point of its life: by the caller
/// until submission, by a dispatcher while queued, by the transport while in
/// flight, and by the result callback once delivered. It is deliberately not
/// `Clone`; the only way to refer to a query without owning it is through a
/// [`QueryRef`] obtained from [`Query::get_weak`].
///
/// The handle carries the ordering metadata a dispatcher manages on the
/// caller's behalf (`invoke_after`, `session_rand`, the flood-timeout
/// accounting) next to the caller's own payload and the eventual result.
pub struct Query {
    id: u64,
    state: Arc<Mutex<QueryState>>,
}

/// A non-owning reference to a [`Query`].
///
/// Used as an `invoke_after` target: it identifies the query for its entire
/// lifecycle but neither keeps it alive nor blocks destruction. After the
/// owning `Query` is dropped the reference reports itself expired; resolving
/// an expired reference is not an error.
#[derive(Clone)]
pub struct QueryRef {
    id: u64,
    state: Weak<Mutex<QueryState>>,
}

impl Query {
    /// Creates a query around an opaque payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Query {
            id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(QueryState {
                payload,
                invoke_after: Vec::new(),
                session_rand: 0,
                last_timeout: 0.0,
                total_timeout: 0.0,
                total_timeout_limit: DEFAULT_TOTAL_TIMEOUT_LIMIT,
                result: None,
                resend_count: 0,
            })),
        }
    }

    /// Sets the flood-timeout ceiling for this query, in seconds.
    pub fn with_total_timeout_limit(self, limit: f64) -> Self {
        self.state.lock().unwrap().total_timeout_limit = limit;
        self
    }

    /// The query's stable id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A weak reference usable as an `invoke_after` target even after
    /// ownership has moved into the transport.
    pub fn get_weak(&self) -> QueryRef {
        QueryRef {
            id: self.id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// The caller's payload.
    pub fn payload(&self) -> serde_json::Value {
        self.state.lock().unwrap().payload.clone()
    }

    /// Replaces the ordered list of predecessors the server must observe
    /// executed before this query.
    pub fn set_invoke_after(&self, refs: Vec<QueryRef>) {
        self.state.lock().unwrap().invoke_after = refs;
    }

    /// The current `invoke_after` attachment.
    pub fn invoke_after(&self) -> Vec<QueryRef> {
        self.state.lock().unwrap().invoke_after.clone()
    }

    /// Stamps the session-affinity value sent on the wire.
    pub fn set_session_rand(&self, session_rand: u32) {
        self.state.lock().unwrap().session_rand = session_rand;
    }

    /// The session-affinity value last stamped on this query.
    pub fn session_rand(&self) -> u32 {
        self.state.lock().unwrap().session_rand
    }

    /// The back-off hint observed on the last server response, in seconds.
    pub fn last_timeout(&self) -> f64 {
        self.state.lock().unwrap().last_timeout
    }

    /// Overwrites the back-off hint. Dispatchers zero this on every dispatch.
    pub fn set_last_timeout(&self, last_timeout: f64) {
        self.state.lock().unwrap().last_timeout = last_timeout;
    }

    /// Accumulated flood timeout, in seconds.
    pub fn total_timeout(&self) -> f64 {
        self.state.lock().unwrap().total_timeout
    }

    /// Folds additional flood timeout into the running total.
    pub fn add_total_timeout(&self, delta: f64) {
        self.state.lock().unwrap().total_timeout += delta;
    }

    /// The flood-timeout ceiling, in seconds.
    pub fn total_timeout_limit(&self) -> f64 {
        self.state.lock().unwrap().total_timeout_limit
    }

    /// Stores a successful result.
    pub fn set_ok(&self, value: serde_json::Value) {
        self.state.lock().unwrap().result = Some(Ok(value));
    }

    /// Stores a failure.
    pub fn set_error(&self, error: Error) {
        self.state.lock().unwrap().result = Some(Err(error));
    }

    /// Whether the stored result is a failure.
    pub fn is_error(&self) -> bool {
        matches!(self.state.lock().unwrap().result, Some(Err(_)))
    }

    /// The stored failure, if any.
    pub fn error(&self) -> Option<Error> {
        match &self.state.lock().unwrap().result {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// The stored result, if any.
    pub fn result(&self) -> Option<Result<serde_json::Value, Error>> {
        self.state.lock().unwrap().result.clone()
    }

    /// Marks the query for another attempt: clears the stored result and
    /// bumps the resend counter. Ordering metadata is left for the dispatcher
    /// to refresh on the next dispatch.
    pub fn resend(&self) {
        let mut state = self.state.lock().unwrap();
        state.result = None;
        state.resend_count += 1;
    }

    /// How many times this query has been marked for resend.
    pub fn resend_count(&self) -> u32 {
        self.state.lock().unwrap().resend_count
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("resend_count", &state.resend_count)
            .finish_non_exhaustive()
    }
}

impl QueryRef {
    /// The id of the referenced query.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the referenced query has been destroyed.
    pub fn is_expired(&self) -> bool {
        self.state.strong_count() == 0
    }
}

impl fmt::Debug for QueryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRef")
            .field("id", &self.id)
            .field("expired", &self.is_expired())
            .finish()
    }
}
