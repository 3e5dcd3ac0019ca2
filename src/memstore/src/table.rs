use pgrepr::{Type, Value};

/// One relation: a fixed column schema plus its rows, held in insertion
/// order. No separate index store to keep in sync — a full scan is the
/// only access path this backend needs.
#[derive(Clone, Debug)]
pub struct Table {
    pub columns: Vec<(String, Type)>,
    pub rows: Vec<Vec<Value>>,
}
