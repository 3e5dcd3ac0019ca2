//! The type codec table: abstract value types, their runtime payloads, and
//! their text/binary wire encodings, plus the low-level buffer primitives
//! every message in `pgwire` is built out of.

pub mod buf;
mod format;
mod types;
mod value;

pub use format::Format;
pub use types::{Type, UNKNOWN_OID};
pub use value::{Interval, Value};
