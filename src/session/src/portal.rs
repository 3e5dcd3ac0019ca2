use pgrepr::{Format, Value};

/// A bound, runnable instance of a prepared statement, recorded by `Bind`.
///
/// The empty name is the unnamed portal, with the same overwrite-on-rebind
/// behavior as the unnamed statement.
#[derive(Debug, Clone)]
pub struct Portal {
    pub stmt_name: String,
    pub params: Vec<Value>,
    pub result_formats: Vec<Format>,
}
