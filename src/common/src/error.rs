use sqlparser::parser::ParserError;
use std::fmt::Formatter;
use std::{fmt, result};

/// Result type for operations that could result in a [`PgError`].
pub type Result<T> = result::Result<T, PgError>;

/// Error type for operations originating outside this workspace's crates.
pub type GenericError = Box<dyn std::error::Error + Send + Sync>;

/// The error type shared by every crate in this workspace.
///
/// A `PgError` always knows how to become an `ErrorResponse` on the wire
/// (see `pgwire::message::ErrorResponse::from`); the variants here are kept
/// coarse on purpose, matching how little detail the frontend/backend
/// protocol actually transmits back to the client.
#[derive(Debug)]
pub enum PgError {
    /// Malformed framing, an unknown message tag, a bad startup code, or a
    /// non-password message sent before authentication.
    Protocol(String),
    /// A PasswordMessage that does not match the expected MD5 digest.
    Auth(String),
    /// Raised by `Session::execute_sql`, caught at the handler boundary.
    Backend(String),
    /// An unknown extension method, or one that failed during `apply`.
    Extension(String),
    /// Failed to parse a `/**/`-wrapped JSON extension payload.
    Json(String),
    ParserError(ParserError),
    IoError(std::io::Error),
    /// Errors originating from outside this workspace's codebase.
    External(GenericError),
}

impl PgError {
    pub fn backend<S: Into<String>>(msg: S) -> PgError {
        PgError::Backend(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> PgError {
        PgError::Protocol(msg.into())
    }

    /// Whether this error should tear down the connection outright, as
    /// opposed to being reported and leaving the connection open.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PgError::Protocol(_) | PgError::Auth(_) | PgError::IoError(_))
    }
}

impl From<ParserError> for PgError {
    fn from(e: ParserError) -> Self {
        PgError::ParserError(e)
    }
}

impl From<std::io::Error> for PgError {
    fn from(e: std::io::Error) -> Self {
        PgError::IoError(e)
    }
}

impl From<GenericError> for PgError {
    fn from(e: GenericError) -> Self {
        PgError::External(e)
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Protocol(desc) => write!(f, "protocol error: {}", desc),
            PgError::Auth(desc) => write!(f, "authentication error: {}", desc),
            PgError::Backend(desc) => write!(f, "{}", desc),
            PgError::Extension(desc) => write!(f, "extension error: {}", desc),
            PgError::Json(desc) => write!(f, "malformed extension payload: {}", desc),
            PgError::ParserError(e) => write!(f, "parser error: {}", e),
            PgError::IoError(e) => write!(f, "io error: {}", e),
            PgError::External(e) => write!(f, "external error: {}", e),
        }
    }
}

impl std::error::Error for PgError {}
