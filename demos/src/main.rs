//! A standalone server for the client demos in this directory: an in-memory
//! backend seeded with a `t1(c1, c2)` table, listening on 127.0.0.1:6543.

use common::error::{PgError, Result};
use memstore::MemoryEngine;
use pgrepr::{Type, Value};
use pgwire::{Server, ServerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().map_err(|e| PgError::External(Box::new(e)))?;

    let engine = MemoryEngine::new();
    let rows: Vec<Vec<Value>> = (0..100)
        .map(|n| vec![Value::Int8(n), Value::Int8(n)])
        .collect();
    engine.seed(
        "t1",
        vec![
            ("c1".to_string(), Type::Integer),
            ("c2".to_string(), Type::Integer),
        ],
        rows,
    );

    let mut passwords = HashMap::new();
    passwords.insert("postgres".to_string(), "123456".to_string());

    let config = ServerConfig {
        bind_port: 6543,
        ..ServerConfig::default()
    };
    let server = Arc::new(Server::new(
        config,
        Arc::new(engine),
        None,
        HashMap::new(),
        Some(passwords),
    ));

    let shutdown = signal::ctrl_c();
    server
        .bind_and_serve(async move {
            let _ = shutdown.await;
        })
        .await?;
    Ok(())
}
