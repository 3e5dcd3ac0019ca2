//! The wire-protocol core: frames PostgreSQL v3.0 messages off a raw TCP
//! stream, runs the startup/authentication/message-loop state machine, and
//! fans accepted connections out across a shared backend.
//!
//! This crate knows nothing about how a query actually gets answered — that
//! seam is [`backend::Connection`]/[`backend::Session`]. It knows about the
//! wire, the per-connection bookkeeping `session::Context` needs to drive
//! it, and the process-id table that makes `CancelRequest` work.

pub mod codec;
pub mod extension;
pub mod message;
pub mod protocol;
pub mod server;

pub use server::{Server, ServerConfig};
