//! The TCP accept loop: per-connection fan-out, the process-id/secret-key
//! table that routes `CancelRequest`s, and bind-address/loopback policy.

use crate::codec::{decode_startup, FramedConn, REJECT_ENCRYPTION};
use crate::message::{BackendMessage, ErrorResponse, FrontendStartupMessage, SqlState, VERSION_3};
use crate::protocol::{self, Extensions};
use backend::{Connection, Extension};
use common::error::Result;
use rewriter::Rewriter;
use session::Context;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Bind address/port and loopback policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_host: IpAddr,
    pub bind_port: u16,
    /// If `false` (the default), connections from non-loopback peers are
    /// refused before startup negotiation even begins.
    pub allow_non_loopback: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 5433,
            allow_non_loopback: false,
        }
    }
}

/// What the process-id table remembers about one live connection: enough to
/// authenticate a `CancelRequest` and to wake the handler task that owns it.
struct ConnState {
    secret_key: u32,
    cancel: Arc<Notify>,
}

type Contexts = Arc<Mutex<HashMap<u32, ConnState>>>;

/// Owns the backend, rewriter, extensions, and process-id table shared by
/// every accepted connection.
pub struct Server {
    config: ServerConfig,
    connection: Arc<dyn Connection>,
    rewriter: Option<Arc<Rewriter>>,
    extensions: Extensions,
    passwords: Option<Arc<HashMap<String, String>>>,
    contexts: Contexts,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        connection: Arc<dyn Connection>,
        rewriter: Option<Arc<Rewriter>>,
        extensions: HashMap<String, Arc<dyn Extension>>,
        passwords: Option<HashMap<String, String>>,
    ) -> Server {
        Server {
            config,
            connection,
            rewriter,
            extensions: Arc::new(extensions),
            passwords: passwords.map(Arc::new),
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds `self.config`'s address and serves connections until `shutdown`
    /// resolves.
    pub async fn bind_and_serve(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_host, self.config.bind_port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serves an already-bound `listener` until `shutdown` resolves.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        info!("accepting inbound connections");
        tokio::select! {
            res = self.accept_loop(listener) => {
                if let Err(e) = res {
                    error!(error = %e, "accept loop failed");
                }
            }
            _ = shutdown => {
                info!("shutting down");
            }
        }
        info!("exit");
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (conn, peer) = listener.accept().await?;
            if !self.config.allow_non_loopback && !peer.ip().is_loopback() {
                warn!(%peer, "refusing non-loopback connection");
                continue;
            }
            let server = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(conn, peer).await {
                    error!(%peer, error = %e, "connection ended with an error");
                }
            });
        }
    }

    #[instrument(skip_all, fields(%peer))]
    async fn handle_connection(&self, mut conn: TcpStream, peer: SocketAddr) -> Result<()> {
        loop {
            let message = decode_startup(&mut conn).await?;
            match message {
                None => return Ok(()),
                Some(FrontendStartupMessage::SslRequest) => {
                    conn.write_all(&[REJECT_ENCRYPTION]).await?;
                }
                Some(FrontendStartupMessage::GssEncRequest) => {
                    conn.write_all(&[REJECT_ENCRYPTION]).await?;
                }
                Some(FrontendStartupMessage::CancelRequest {
                    conn_id,
                    secret_key,
                }) => {
                    self.cancel(conn_id, secret_key).await;
                    return Ok(());
                }
                Some(FrontendStartupMessage::Startup { version, params }) => {
                    if version != VERSION_3 {
                        let mut framed = FramedConn::new(conn);
                        framed
                            .send(BackendMessage::ErrorResponse(ErrorResponse::fatal(
                                SqlState::CONNECTION_EXCEPTION,
                                "unsupported protocol version",
                            )))
                            .await?;
                        framed.flush().await?;
                        return Ok(());
                    }
                    return self.run_session(conn, params).await;
                }
            }
        }
    }

    async fn run_session(&self, conn: TcpStream, params: HashMap<String, String>) -> Result<()> {
        let user = params.get("user").cloned().unwrap_or_default();
        let (process_id, secret_key, cancel) = self.allocate_ids().await;

        let session = self.connection.new_session();
        let context = Context::new(
            session,
            self.rewriter.clone(),
            self.connection.parameters(),
            process_id,
            secret_key,
        );

        let mut framed = FramedConn::new(conn);
        let auth = self
            .passwords
            .as_ref()
            .map(|passwords| (user.as_str(), passwords.as_ref()));

        let (context, result) = protocol::run(
            &mut framed,
            context,
            auth,
            Arc::clone(&self.extensions),
            Arc::clone(&cancel),
        )
        .await;

        self.contexts.lock().await.remove(&process_id);
        self.connection.close_session(context.into_session());

        debug!(process_id, "connection closed");
        result
    }

    /// Generates a fresh `(process_id, secret_key)` pair, retrying on a
    /// collision with a currently-live entry.
    async fn allocate_ids(&self) -> (u32, u32, Arc<Notify>) {
        loop {
            let process_id: u32 = rand::random();
            let secret_key: u32 = rand::random();
            let mut contexts = self.contexts.lock().await;
            if contexts.contains_key(&process_id) {
                continue;
            }
            let cancel = Arc::new(Notify::new());
            contexts.insert(
                process_id,
                ConnState {
                    secret_key,
                    cancel: Arc::clone(&cancel),
                },
            );
            return (process_id, secret_key, cancel);
        }
    }

    /// Looks up `(process_id, secret_key)` in the context table; on a match,
    /// wakes that connection's handler so it tears down its session. A
    /// mismatched key, or no such process_id, is silently ignored — the
    /// caller never gets a reply either way.
    pub async fn cancel(&self, process_id: u32, secret_key: u32) {
        let contexts = self.contexts.lock().await;
        if let Some(state) = contexts.get(&process_id) {
            if state.secret_key == secret_key {
                state.cancel.notify_one();
            }
        }
    }
}

/// Convenience entry point: builds a default-configured [`Server`] and
/// serves an already-bound
/// `listener` until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
    connection: Arc<dyn Connection>,
    rewriter: Option<Arc<Rewriter>>,
    extensions: HashMap<String, Arc<dyn Extension>>,
    passwords: Option<HashMap<String, String>>,
) {
    let server = Arc::new(Server::new(
        ServerConfig::default(),
        connection,
        rewriter,
        extensions,
        passwords,
    ));
    server.serve(listener, shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{BoxFuture, QueryResult, Session};
    use pgrepr::Value;

    struct NoopSession;
    impl Session for NoopSession {
        fn execute_sql<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: Vec<Value>,
        ) -> BoxFuture<'a, Result<Box<dyn QueryResult>>> {
            Box::pin(async move { Err(common::error::PgError::backend("not implemented")) })
        }
        fn in_transaction(&self) -> bool {
            false
        }
    }

    struct NoopConnection;
    impl Connection for NoopConnection {
        fn new_session(&self) -> Box<dyn Session> {
            Box::new(NoopSession)
        }
    }

    fn server() -> Server {
        Server::new(
            ServerConfig::default(),
            Arc::new(NoopConnection),
            None,
            HashMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn allocate_ids_does_not_collide_with_a_live_entry() {
        let server = server();
        let (pid1, _, _cancel1) = server.allocate_ids().await;
        let (pid2, _, _cancel2) = server.allocate_ids().await;
        assert_ne!(pid1, pid2);
    }

    #[tokio::test]
    async fn cancel_wakes_the_matching_context_only() {
        let server = server();
        let (pid, secret, cancel) = server.allocate_ids().await;

        server.cancel(pid, secret.wrapping_add(1)).await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(10), cancel.notified())
                .await
                .is_err(),
            "a mismatched secret key must not wake the handler"
        );

        server.cancel(pid, secret).await;
        tokio::time::timeout(std::time::Duration::from_millis(10), cancel.notified())
            .await
            .expect("a matching cancel must wake the handler");
    }
}
