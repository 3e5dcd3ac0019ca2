//! The seam between the wire-protocol core and whatever actually answers
//! queries: an embedded analytic engine, a proxied upstream PostgreSQL, or
//! (for tests and the demo binaries) [`memstore`](../memstore/index.html).
//!
//! None of these traits know anything about the wire protocol; `pgwire` and
//! `session` are the only crates that see a `Connection` or `Session` as
//! more than an opaque implementer of this contract.

mod future;

pub use future::BoxFuture;

use common::error::Result;
use pgrepr::{Type, Value};

/// The result of executing one statement.
///
/// Implementations hand rows back one at a time through [`next_row`], rather
/// than all at once, so a backend never has to materialize an entire result
/// set before the first `DataRow` can go out on the wire.
///
/// [`next_row`]: QueryResult::next_row
pub trait QueryResult: Send {
    /// Whether this statement produces a row stream at all (a `SELECT`) as
    /// opposed to only a completion tag (an `INSERT`/`UPDATE`/`DDL`
    /// statement, which reports `false` here and has no columns).
    fn has_results(&self) -> bool;

    fn column_count(&self) -> usize;

    /// The name and abstract type of the column at `index`, or `None` if
    /// `index` is out of range.
    fn column(&self, index: usize) -> Option<(&str, Type)>;

    /// Pulls the next row, or `None` once the result set is exhausted.
    fn next_row(&mut self) -> Option<Vec<Value>>;

    /// The tag reported in CommandComplete, e.g. `"SELECT 3"` or
    /// `"INSERT 0 1"`. Statements with no results (`SET`, `BEGIN`, ...)
    /// return their own bare tag, e.g. `"SET"`.
    fn status(&self) -> String;
}

/// Per-connection state held by a backend: a live handle to whatever engine
/// is actually answering queries. `process_id`/`secret_key` are not part of
/// this contract — `session::Context` generates and owns those itself, the
/// same way the system this was distilled from assigns them at its own
/// per-connection context object rather than inside the backend session.
pub trait Session: Send {
    /// Executes one already-rewritten, already-substituted statement of SQL
    /// with its bound parameter values, returning the resulting rows or
    /// completion tag.
    ///
    /// A backend that cannot answer the statement at all (bad SQL the
    /// backend's own parser rejects, a missing relation, ...) returns
    /// `Err(PgError::Backend(..))`; `session::Context` is responsible for
    /// turning that into an aborted-transaction latch.
    fn execute_sql<'a>(
        &'a mut self,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Box<dyn QueryResult>>>;

    /// Whether a `BEGIN` is currently open on this session's connection to
    /// the backend.
    fn in_transaction(&self) -> bool;
}

/// The entry point a `pgwire::Server` holds: creates one [`Session`] per
/// accepted connection.
pub trait Connection: Send + Sync {
    fn new_session(&self) -> Box<dyn Session>;

    /// Disposes of a session. Idempotent; the default does nothing beyond
    /// dropping `session`, which is sufficient for backends that hold no
    /// pooled resources.
    fn close_session(&self, _session: Box<dyn Session>) {}

    /// The `ParameterStatus` key/value pairs to send at startup, in the
    /// order they should appear on the wire. Must include at minimum
    /// `server_version` and `client_encoding`.
    fn parameters(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// A handler for the JSON extension-dispatch escape hatch:
/// a comment-wrapped JSON payload sent in place of SQL, routed by its
/// `"method"` field to the extension registered under that name.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn apply<'a>(
        &'a self,
        params: serde_json::Value,
        session: &'a mut dyn Session,
    ) -> BoxFuture<'a, Result<Box<dyn QueryResult>>>;
}
