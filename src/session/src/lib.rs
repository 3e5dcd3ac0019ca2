//! Per-connection state: the `Context` that sits between the protocol
//! handler and a backend session, brokering SQL through the rewriter and
//! keeping the named-statement/portal/result-cache bookkeeping the extended
//! query protocol requires.

mod auth;
mod context;
mod executed;
mod portal;
mod statement;

pub use context::Context;
pub use executed::{ColumnDescription, Executed};
pub use portal::Portal;
pub use statement::PreparedStatement;
