//! The wire-style error value carried by failed queries.

use serde::{Deserialize, Serialize};

/// Error message used by a server to reject a query whose `invoke_after`
/// predecessor failed.
pub const MSG_WAIT_FAILED: &str = "MSG_WAIT_FAILED";

/// Error message used by a server to reject a query whose `invoke_after`
/// predecessor did not complete in time.
pub const MSG_WAIT_TIMEOUT: &str = "MSG_WAIT_TIMEOUT";

/// An error attached to a [`Query`](crate::Query).
///
/// Errors travel with the query itself rather than through a separate channel:
/// a transport (or the dispatcher, for locally synthesised failures) calls
/// [`Query::set_error`](crate::Query::set_error) and hands the query back.
/// The numeric `code` follows server conventions (400, 429, 500, ...); codes
/// above 200 and below 300 are reserved for local transport-level signals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Error {
    /// Numeric error code.
    pub code: i32,
    /// Human-readable message; compared literally for the `MSG_WAIT_*` family.
    pub message: String,
    /// Optional structured payload with extra context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Error {
    /// Local code a transport uses to ask for a resend with a fresh
    /// `invoke_after` attachment, without a server round-trip.
    pub const RESEND_INVOKE_AFTER: i32 = 204;

    /// Creates an error from a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a structured payload to the error.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The local "resend with fresh invoke-after" signal.
    pub fn resend_invoke_after() -> Self {
        Error::new(Self::RESEND_INVOKE_AFTER, "Resend with invoke-after")
    }

    /// Server rejection because an `invoke_after` predecessor failed.
    pub fn wait_failed() -> Self {
        Error::new(400, MSG_WAIT_FAILED)
    }

    /// Server rejection because an `invoke_after` predecessor timed out.
    pub fn wait_timeout() -> Self {
        Error::new(400, MSG_WAIT_TIMEOUT)
    }

    /// Locally synthesised flood-control failure.
    ///
    /// Produced by a dispatcher when a query's accumulated timeout exceeds its
    /// limit; `retry_after` is the server's last back-off hint, rounded up to
    /// whole seconds.
    pub fn too_many_requests(retry_after: i32) -> Self {
        Error::new(
            429,
            format!("Too Many Requests: retry after {retry_after}"),
        )
    }

    /// Fabricated during teardown and delivered to every live query.
    pub fn aborted() -> Self {
        Error::new(500, "Request aborted")
    }

    /// Failure to reach a dispatcher whose actor has already stopped.
    pub fn closed() -> Self {
        Error::new(500, "Dispatcher closed")
    }

    /// Whether this error is a server-signalled ordering failure.
    ///
    /// Such failures are recovered locally by restarting the chain; they are
    /// never surfaced to the result callback.
    pub fn is_out_of_order(&self) -> bool {
        self.code == Self::RESEND_INVOKE_AFTER
            || (self.code == 400
                && (self.message == MSG_WAIT_FAILED || self.message == MSG_WAIT_TIMEOUT))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}
