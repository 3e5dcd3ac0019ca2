//! The protocol state machine: startup negotiation, authentication, and the
//! simple/extended query message loop.

use crate::extension;
use crate::message::{BackendMessage, ErrorResponse, FieldDescription, FrontendMessage, SqlState};
use backend::Extension;
use common::error::{PgError, Result};
use pgrepr::{Format, Type};
use session::{Context, Executed};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::codec::{decode_param, FramedConn};

/// Extensions registered at server construction, keyed by the `"method"`
/// field of the JSON payload that should route to them.
pub type Extensions = Arc<HashMap<String, Arc<dyn Extension>>>;

/// Runs one connection's entire post-startup lifecycle: authentication (if
/// `auth` is configured), the startup parameter/BackendKeyData handshake,
/// and the message loop, until the client disconnects, issues `Terminate`,
/// or a fatal protocol error occurs.
///
/// Always returns the `Context` it was given back to the caller (so
/// `server` can hand the backend session to
/// [`backend::Connection::close_session`]), paired with the `Result` that
/// would otherwise have been returned.
#[instrument(skip_all, fields(pid = context.process_id()))]
pub async fn run<A>(
    conn: &mut FramedConn<A>,
    mut context: Context,
    auth: Option<(&str, &HashMap<String, String>)>,
    extensions: Extensions,
    cancel: Arc<Notify>,
) -> (Context, Result<()>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some((user, passwords)) = auth {
        match authenticate(conn, &mut context, user, passwords).await {
            Ok(true) => {}
            Ok(false) => return (context, Ok(())),
            Err(e) => return (context, Err(e)),
        }
    }

    if let Err(e) = send_startup_messages(conn, &context).await {
        return (context, Err(e));
    }

    let mut handler = Handler {
        conn,
        context,
        extensions,
        cancel,
    };
    let result = handler.serve().await;
    (handler.context, result)
}

/// Challenges for and verifies an MD5 password. Returns `Ok(false)` (rather
/// than an `Err`) on a simple auth failure, since that's a normal —if
/// unhappy— end to the connection, not a protocol violation.
async fn authenticate<A>(
    conn: &mut FramedConn<A>,
    context: &mut Context,
    user: &str,
    passwords: &HashMap<String, String>,
) -> Result<bool>
where
    A: AsyncRead + AsyncWrite + Unpin,
{
    // Looked up before the client has a chance to prove otherwise, but never
    // branched on here: an unknown user gets the same challenge and the same
    // rejection as a known user with the wrong password.
    let expected_password = passwords.get(user).cloned().unwrap_or_default();

    let salt = context.begin_md5_auth();
    conn.send(BackendMessage::AuthenticationMd5Password { salt })
        .await?;
    conn.flush().await?;

    let message = conn.recv().await?;
    let authenticated = match message {
        Some(FrontendMessage::PasswordMessage { password: hash }) => {
            context.check_md5_password(user, &expected_password, &hash)
        }
        _ => false,
    };

    if !authenticated {
        let err = PgError::Auth("password authentication failed".to_string());
        conn.send(BackendMessage::ErrorResponse(error_response(&err)))
            .await?;
        conn.flush().await?;
    }
    Ok(authenticated)
}

async fn send_startup_messages<A>(conn: &mut FramedConn<A>, context: &Context) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(BackendMessage::AuthenticationOk).await?;
    for (name, value) in context.parameters() {
        conn.send(BackendMessage::ParameterStatus {
            name: name.clone(),
            value: value.clone(),
        })
        .await?;
    }
    conn.send(BackendMessage::BackendKeyData {
        conn_id: context.process_id(),
        secret_key: context.secret_key(),
    })
    .await?;
    conn.send(BackendMessage::ReadyForQuery(context.transaction_status()))
        .await?;
    conn.flush().await?;
    Ok(())
}

struct Handler<'a, A> {
    conn: &'a mut FramedConn<A>,
    context: Context,
    extensions: Extensions,
    cancel: Arc<Notify>,
}

impl<'a, A> Handler<'a, A>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// The message loop proper. Returns `Ok(())` on a graceful end
    /// (`Terminate`, client hangup, or a successful cancellation); an `Err`
    /// means a fatal protocol/IO error tore the connection down.
    async fn serve(&mut self) -> Result<()> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.notified() => {
                    debug!("connection cancelled");
                    return Ok(());
                }
                message = self.conn.recv() => message?,
            };
            let Some(message) = message else {
                return Ok(());
            };

            match message {
                FrontendMessage::Query { sql } => self.simple_query(&sql).await?,
                FrontendMessage::Parse {
                    name,
                    sql,
                    param_oids,
                } => self.parse(name, sql, param_oids).await?,
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                } => {
                    self.bind(portal, statement, param_formats, params, result_formats)
                        .await?
                }
                FrontendMessage::DescribeStatement { name } => {
                    self.describe_statement(&name).await?
                }
                FrontendMessage::DescribePortal { name } => self.describe_portal(&name).await?,
                FrontendMessage::Execute { portal, max_rows } => {
                    self.execute(&portal, max_rows).await?
                }
                FrontendMessage::CloseStatement { name } => {
                    self.context.close_statement(&name);
                    self.conn.send(BackendMessage::CloseComplete).await?;
                    self.conn
                        .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                        .await?;
                }
                FrontendMessage::ClosePortal { name } => {
                    self.context.close_portal(&name);
                    self.conn.send(BackendMessage::CloseComplete).await?;
                    self.conn
                        .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                        .await?;
                }
                FrontendMessage::Flush => {
                    self.context.flush();
                    self.conn.flush().await?;
                }
                FrontendMessage::Sync => {
                    self.context.sync();
                    self.conn
                        .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                        .await?;
                    self.conn.flush().await?;
                }
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::PasswordMessage { .. } => {
                    self.fatal_protocol_error("unexpected PasswordMessage").await?;
                    return Ok(());
                }
            }
        }
    }

    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        match extension::strip_and_parse_json(sql) {
            Ok(Some(payload)) => {
                self.dispatch_extension(payload).await?;
                self.conn
                    .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                    .await?;
                self.conn.flush().await?;
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
                self.conn
                    .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                    .await?;
                self.conn.flush().await?;
                return Ok(());
            }
        }

        if sql.trim().is_empty() {
            self.conn.send(BackendMessage::EmptyQueryResponse).await?;
            self.conn
                .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
                .await?;
            self.conn.flush().await?;
            return Ok(());
        }

        match self.context.execute_sql(sql, Vec::new()).await {
            Ok(mut executed) => {
                if executed.result.has_results() {
                    self.send_row_description(&executed).await?;
                    let rows = self.send_data_rows(&mut executed, 0).await?;
                    self.conn
                        .send(BackendMessage::CommandComplete {
                            tag: format!("SELECT {}", rows),
                        })
                        .await?;
                } else {
                    let tag = executed.result.status();
                    self.conn
                        .send(BackendMessage::CommandComplete { tag })
                        .await?;
                }
            }
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
            }
        }
        self.conn
            .send(BackendMessage::ReadyForQuery(self.context.transaction_status()))
            .await?;
        self.conn.flush().await?;
        Ok(())
    }

    async fn dispatch_extension(&mut self, payload: serde_json::Value) -> Result<()> {
        let method = payload.get("method").and_then(|m| m.as_str());
        let Some(method) = method else {
            self.context.mark_error();
            self.conn
                .send(BackendMessage::ErrorResponse(ErrorResponse::error(
                    SqlState::SYNTAX_ERROR,
                    "extension payload has no \"method\"",
                )))
                .await?;
            return Ok(());
        };
        let Some(extension) = self.extensions.get(method).cloned() else {
            self.context.mark_error();
            self.conn
                .send(BackendMessage::ErrorResponse(ErrorResponse::error(
                    SqlState::FEATURE_NOT_SUPPORTED,
                    format!("unknown extension method {:?}", method),
                )))
                .await?;
            return Ok(());
        };
        let params = payload
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        match self.context.apply_extension(&*extension, params).await {
            Ok(mut executed) => {
                if executed.result.has_results() {
                    self.send_row_description(&executed).await?;
                    let rows = self.send_data_rows(&mut executed, 0).await?;
                    self.conn
                        .send(BackendMessage::CommandComplete {
                            tag: format!("SELECT {}", rows),
                        })
                        .await?;
                } else {
                    let tag = executed.result.status();
                    self.conn
                        .send(BackendMessage::CommandComplete { tag })
                        .await?;
                }
            }
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn parse(&mut self, name: String, sql: String, param_oids: Vec<i32>) -> Result<()> {
        self.context.add_statement(name, sql, param_oids);
        self.conn.send(BackendMessage::ParseComplete).await?;
        Ok(())
    }

    async fn bind(
        &mut self,
        portal: String,
        statement: String,
        param_formats: Vec<Format>,
        raw_params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<Format>,
    ) -> Result<()> {
        let declared_oids = self
            .context
            .statement_param_oids(&statement)
            .map(|oids| oids.to_vec());
        let Some(declared_oids) = declared_oids else {
            self.context.mark_error();
            self.conn
                .send(BackendMessage::ErrorResponse(ErrorResponse::error(
                    SqlState::UNDEFINED_OBJECT,
                    format!("no statement named {:?}", statement),
                )))
                .await?;
            return Ok(());
        };

        let formats = broadcast(param_formats, raw_params.len());
        let mut params = Vec::with_capacity(raw_params.len());
        for (i, raw) in raw_params.into_iter().enumerate() {
            let oid = declared_oids.get(i).copied().filter(|oid| *oid != 0);
            let format = formats.get(i).copied().unwrap_or(Format::Text);
            match decode_param(raw.as_deref(), format, oid) {
                Ok(v) => params.push(v),
                Err(e) => {
                    self.context.mark_error();
                    self.conn
                        .send(BackendMessage::ErrorResponse(error_response(&e)))
                        .await?;
                    return Ok(());
                }
            }
        }

        match self
            .context
            .add_portal(portal, statement, params, result_formats)
        {
            Ok(()) => {
                self.conn.send(BackendMessage::BindComplete).await?;
            }
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn describe_statement(&mut self, name: &str) -> Result<()> {
        if self.context.has_error() {
            return Ok(());
        }
        match self.context.describe_statement(name).await {
            Ok(Some(columns)) => {
                let fields = columns
                    .into_iter()
                    .map(|c| FieldDescription::new(c.name, c.ty.oid(), Format::Text))
                    .collect();
                self.conn
                    .send(BackendMessage::RowDescription(fields))
                    .await?;
            }
            Ok(None) => {
                self.conn.send(BackendMessage::NoData).await?;
            }
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn describe_portal(&mut self, name: &str) -> Result<()> {
        if self.context.has_error() {
            return Ok(());
        }
        match self.context.describe_portal(name).await {
            Ok(Some(columns)) => {
                let formats = self.context.portal_result_formats(name);
                let fields = columns
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let format = formats.get(i).copied().unwrap_or(Format::Text);
                        FieldDescription::new(c.name, c.ty.oid(), format)
                    })
                    .collect();
                self.conn
                    .send(BackendMessage::RowDescription(fields))
                    .await?;
            }
            Ok(None) => {
                self.conn.send(BackendMessage::NoData).await?;
            }
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn execute(&mut self, portal: &str, max_rows: i32) -> Result<()> {
        if self.context.has_error() {
            return Ok(());
        }

        let executed = tokio::select! {
            biased;
            _ = self.cancel.notified() => {
                debug!("cancelled mid-execute");
                return Ok(());
            }
            executed = self.context.execute_portal(portal) => executed,
        };

        let mut executed = match executed {
            Ok(executed) => executed,
            Err(e) => {
                self.context.mark_error();
                self.conn
                    .send(BackendMessage::ErrorResponse(error_response(&e)))
                    .await?;
                return Ok(());
            }
        };

        if !executed.result.has_results() {
            let tag = executed.result.status();
            self.conn
                .send(BackendMessage::CommandComplete { tag })
                .await?;
            return Ok(());
        }

        let limit = if max_rows <= 0 { 0 } else { max_rows as usize };
        let rows = self.send_data_rows(&mut executed, limit).await?;
        let suspended = limit != 0 && executed.has_more();
        if suspended {
            self.context.suspend_portal(portal, executed);
            self.conn.send(BackendMessage::PortalSuspended).await?;
        } else {
            self.conn
                .send(BackendMessage::CommandComplete {
                    tag: format!("SELECT {}", rows),
                })
                .await?;
        }
        Ok(())
    }

    async fn send_row_description(&mut self, executed: &Executed) -> Result<()> {
        let fields = executed
            .columns()
            .into_iter()
            .enumerate()
            .map(|(i, c)| FieldDescription::new(c.name, c.ty.oid(), executed.format_for(i)))
            .collect();
        self.conn
            .send(BackendMessage::RowDescription(fields))
            .await
    }

    /// Streams up to `limit` rows (`0` means unlimited) from `executed`,
    /// encoding each cell per its column's requested format. Returns the
    /// number of rows actually sent.
    async fn send_data_rows(&mut self, executed: &mut Executed, limit: usize) -> Result<usize> {
        let mut sent = 0;
        loop {
            if limit != 0 && sent >= limit {
                break;
            }
            let Some(row) = executed.next_row() else {
                break;
            };
            let mut encoded = Vec::with_capacity(row.len());
            for (i, value) in row.into_iter().enumerate() {
                let format = executed.format_for(i);
                let ty = executed
                    .columns()
                    .get(i)
                    .map(|c| c.ty)
                    .unwrap_or(Type::Unknown);
                let bytes = match format {
                    Format::Text => ty.encode_text(&value),
                    Format::Binary => ty.encode_binary(&value)?,
                };
                encoded.push(bytes);
            }
            self.conn.send(BackendMessage::DataRow(encoded)).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn fatal_protocol_error(&mut self, message: &str) -> Result<()> {
        self.conn
            .send(BackendMessage::ErrorResponse(ErrorResponse::fatal(
                SqlState::PROTOCOL_VIOLATION,
                message,
            )))
            .await?;
        self.conn.flush().await?;
        Ok(())
    }
}

fn broadcast(requested: Vec<Format>, count: usize) -> Vec<Format> {
    match requested.len() {
        0 => vec![Format::Text; count],
        1 => vec![requested[0]; count],
        _ => {
            let mut formats = requested;
            let last = *formats.last().unwrap();
            formats.resize(count, last);
            formats
        }
    }
}

fn error_response(err: &PgError) -> ErrorResponse {
    match err {
        PgError::Protocol(msg) => ErrorResponse::error(SqlState::PROTOCOL_VIOLATION, msg.clone()),
        PgError::Auth(msg) => ErrorResponse::fatal(SqlState::INVALID_PASSWORD, msg.clone()),
        PgError::Backend(msg) => ErrorResponse::error(SqlState::INTERNAL_ERROR, msg.clone()),
        PgError::Extension(msg) => {
            ErrorResponse::error(SqlState::FEATURE_NOT_SUPPORTED, msg.clone())
        }
        PgError::Json(msg) => ErrorResponse::error(SqlState::SYNTAX_ERROR, msg.clone()),
        PgError::ParserError(e) => ErrorResponse::error(SqlState::SYNTAX_ERROR, e.to_string()),
        PgError::IoError(e) => ErrorResponse::fatal(SqlState::CONNECTION_EXCEPTION, e.to_string()),
        PgError::External(e) => ErrorResponse::error(SqlState::INTERNAL_ERROR, e.to_string()),
    }
}
