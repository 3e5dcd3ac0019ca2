//! An in-memory [`backend::Connection`], for running `pgwire` without an
//! external storage engine behind it: demos, integration tests, and
//! anything else that just needs tables that live as long as the process.
//!
//! A catalog of named relations behind interior mutability, the same shape
//! as a single-threaded reference-counted heap map — but `Connection`/
//! `Session` need `Send + Sync` across an `.await`, which a `RefCell` can't
//! cross, so a `Mutex` stands in for it here.

mod eval;
mod table;

use backend::{BoxFuture, Connection, Session};
use common::error::Result;
use pgrepr::{Type, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use table::Table;

type Catalog = Arc<Mutex<HashMap<String, Table>>>;

/// A [`Connection`] backed by a shared, process-lifetime table catalog.
/// Every session it hands out sees the same tables; only the transaction
/// flag is per-session.
#[derive(Default)]
pub struct MemoryEngine {
    catalog: Catalog,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        MemoryEngine::default()
    }

    /// Seeds `name` with a schema and rows, for demo fixtures and tests.
    /// Overwrites any existing table of the same name.
    pub fn seed(&self, name: &str, columns: Vec<(String, Type)>, rows: Vec<Vec<Value>>) {
        self.catalog
            .lock()
            .unwrap()
            .insert(name.to_string(), Table { columns, rows });
    }
}

impl Connection for MemoryEngine {
    fn new_session(&self) -> Box<dyn Session> {
        Box::new(MemSession {
            catalog: Arc::clone(&self.catalog),
            in_transaction: false,
        })
    }

    fn parameters(&self) -> Vec<(String, String)> {
        vec![
            ("server_version".to_string(), "14.0".to_string()),
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("DateStyle".to_string(), "ISO, MDY".to_string()),
        ]
    }
}

struct MemSession {
    catalog: Catalog,
    in_transaction: bool,
}

impl Session for MemSession {
    fn execute_sql<'a>(
        &'a mut self,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Result<Box<dyn backend::QueryResult>>> {
        Box::pin(async move { self.run(sql, params) })
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl MemSession {
    fn run(&mut self, sql: &str, params: Vec<Value>) -> Result<Box<dyn backend::QueryResult>> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Ok(Box::new(eval::TagResult::new("")));
        }

        let first_word = trimmed
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_uppercase();

        match first_word.as_str() {
            "BEGIN" | "START" => {
                self.in_transaction = true;
                Ok(Box::new(eval::TagResult::new("BEGIN")))
            }
            "COMMIT" | "END" => {
                self.in_transaction = false;
                Ok(Box::new(eval::TagResult::new("COMMIT")))
            }
            "ROLLBACK" | "ABORT" => {
                self.in_transaction = false;
                Ok(Box::new(eval::TagResult::new("ROLLBACK")))
            }
            "SET" => Ok(Box::new(eval::TagResult::new("SET"))),
            "CREATE" => {
                let mut catalog = self.catalog.lock().unwrap();
                eval::create_table(&mut catalog, trimmed)
            }
            "INSERT" => {
                let mut catalog = self.catalog.lock().unwrap();
                eval::insert(&mut catalog, trimmed, &params)
            }
            _ => {
                let catalog = self.catalog.lock().unwrap();
                eval::select(&catalog, trimmed, &params)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_table_created_in_one_session_is_visible_in_another() {
        let engine = MemoryEngine::new();
        let mut writer = engine.new_session();
        writer
            .execute_sql("CREATE TABLE t1 (c1 int, c2 text)", Vec::new())
            .await
            .unwrap();
        writer
            .execute_sql("INSERT INTO t1 VALUES (1, 'a')", Vec::new())
            .await
            .unwrap();

        let mut reader = engine.new_session();
        let mut result = reader
            .execute_sql("SELECT c1, c2 FROM t1", Vec::new())
            .await
            .unwrap();
        assert_eq!(
            result.next_row().unwrap(),
            vec![Value::Int8(1), Value::Text("a".to_string())]
        );
    }

    #[tokio::test]
    async fn begin_and_commit_toggle_in_transaction() {
        let engine = MemoryEngine::new();
        let mut session = engine.new_session();
        assert!(!session.in_transaction());
        session.execute_sql("BEGIN", Vec::new()).await.unwrap();
        assert!(session.in_transaction());
        session.execute_sql("COMMIT", Vec::new()).await.unwrap();
        assert!(!session.in_transaction());
    }

    #[tokio::test]
    async fn set_on_an_unknown_setting_is_acknowledged() {
        let engine = MemoryEngine::new();
        let mut session = engine.new_session();
        let result = session
            .execute_sql("SET application_name = 'demo'", Vec::new())
            .await
            .unwrap();
        assert_eq!(result.status(), "SET");
    }
}
