use crate::auth;
use crate::executed::{ColumnDescription, Executed};
use crate::portal::Portal;
use crate::statement::PreparedStatement;
use backend::{Extension, Session};
use common::error::{PgError, Result};
use pgrepr::{Format, Value};
use rewriter::Rewriter;
use std::collections::HashMap;
use std::sync::Arc;

/// A connection parameter key/value pair, kept in the order the backend
/// declared it so `ParameterStatus` messages are emitted in that same
/// order at startup.
pub type Parameters = Vec<(String, String)>;

/// The per-connection state bundle that mediates between the protocol
/// handler and a single backend session: authentication status, named
/// statements and portals, the Describe-then-Execute result cache, and the
/// transaction-error latch.
pub struct Context {
    session: Box<dyn Session>,
    rewriter: Option<Arc<Rewriter>>,
    parameters: Parameters,
    process_id: u32,
    secret_key: u32,
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
    result_cache: HashMap<String, Executed>,
    has_error: bool,
    authenticated: bool,
    md5_salt: Option<[u8; 4]>,
}

impl Context {
    pub fn new(
        session: Box<dyn Session>,
        rewriter: Option<Arc<Rewriter>>,
        parameters: Parameters,
        process_id: u32,
        secret_key: u32,
    ) -> Context {
        Context {
            session,
            rewriter,
            parameters,
            process_id,
            secret_key,
            statements: HashMap::new(),
            portals: HashMap::new(),
            result_cache: HashMap::new(),
            has_error: false,
            // No password table configured means authentication is skipped
            // entirely; a caller that does configure one flips this back to
            // false immediately after construction.
            authenticated: true,
            md5_salt: None,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn secret_key(&self) -> u32 {
        self.secret_key
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, authenticated: bool) {
        self.authenticated = authenticated;
    }

    /// Generates and records a fresh salt for an `AuthenticationMD5Password`
    /// challenge, marking this context as not yet authenticated.
    pub fn begin_md5_auth(&mut self) -> [u8; 4] {
        let salt: [u8; 4] = rand::random();
        self.md5_salt = Some(salt);
        self.authenticated = false;
        salt
    }

    /// Checks a client's `PasswordMessage` digest against the expected MD5
    /// hash for `user`/`password`. Returns whether it matched; on a match,
    /// this context is marked authenticated.
    pub fn check_md5_password(&mut self, user: &str, password: &str, client_hash: &str) -> bool {
        let salt = match self.md5_salt {
            Some(salt) => salt,
            None => return false,
        };
        let matches = auth::expected_hash(password, user, &salt) == client_hash;
        if matches {
            self.authenticated = true;
        }
        matches
    }

    /// Rewrites `sql`, forwards it to the backend session, and pads the
    /// result-format vector to match the column count the backend actually
    /// returned.
    pub async fn execute_sql(&mut self, sql: &str, params: Vec<Value>) -> Result<Executed> {
        self.run(sql, params, Vec::new()).await
    }

    async fn run(&mut self, sql: &str, params: Vec<Value>, formats: Vec<Format>) -> Result<Executed> {
        let rewritten = match &self.rewriter {
            Some(rewriter) => rewriter.rewrite(sql),
            None => sql.to_string(),
        };
        let result = self.session.execute_sql(&rewritten, params).await?;
        // The error latch tracks "inside a failed transaction"; once the
        // backend reports the transaction over, any earlier failure inside
        // it is moot, so a fresh BEGIN doesn't inherit a stale latch.
        if !self.session.in_transaction() {
            self.has_error = false;
        }
        Ok(Executed::new(result, formats))
    }

    /// Applies a JSON extension-dispatch payload directly to the backend
    /// session, bypassing the rewriter entirely since there is no SQL text
    /// to rewrite.
    pub async fn apply_extension(
        &mut self,
        extension: &dyn Extension,
        params: serde_json::Value,
    ) -> Result<Executed> {
        let result = extension.apply(params, &mut *self.session).await?;
        if !self.session.in_transaction() {
            self.has_error = false;
        }
        Ok(Executed::new(result, Vec::new()))
    }

    /// The result-format vector the client bound to portal `name`, or empty
    /// if there's no such portal (the caller is responsible for reporting
    /// that separately).
    pub fn portal_result_formats(&self, name: &str) -> Vec<Format> {
        self.portals
            .get(name)
            .map(|p| p.result_formats.clone())
            .unwrap_or_default()
    }

    pub fn add_statement(&mut self, name: String, sql: String, param_oids: Vec<i32>) {
        self.statements
            .insert(name, PreparedStatement { sql, param_oids });
    }

    pub fn close_statement(&mut self, name: &str) {
        self.statements.remove(name);
    }

    pub fn statement_param_oids(&self, name: &str) -> Option<&[i32]> {
        self.statements.get(name).map(|s| s.param_oids.as_slice())
    }

    pub fn add_portal(
        &mut self,
        name: String,
        stmt_name: String,
        params: Vec<Value>,
        result_formats: Vec<Format>,
    ) -> Result<()> {
        if !self.statements.contains_key(&stmt_name) {
            return Err(PgError::protocol(format!(
                "no statement named {:?}",
                stmt_name
            )));
        }
        self.portals.insert(
            name,
            Portal {
                stmt_name,
                params,
                result_formats,
            },
        );
        Ok(())
    }

    pub fn close_portal(&mut self, name: &str) {
        self.portals.remove(name);
        self.result_cache.remove(name);
    }

    /// Puts a partially-consumed result back in the cache under `name`, so a
    /// follow-up `Execute` (after a `PortalSuspended` row-limit cutoff)
    /// resumes the same row stream instead of re-running the query.
    pub fn suspend_portal(&mut self, name: &str, executed: Executed) {
        self.result_cache.insert(name.to_string(), executed);
    }

    /// Executes the statement bound to `name` without consuming rows beyond
    /// what's needed to learn column metadata, caching the full result so
    /// the following Execute reuses it instead of running the query twice.
    pub async fn describe_portal(&mut self, name: &str) -> Result<Option<Vec<ColumnDescription>>> {
        let portal = self
            .portals
            .get(name)
            .ok_or_else(|| PgError::protocol(format!("no portal named {:?}", name)))?
            .clone();
        let stmt = self
            .statements
            .get(&portal.stmt_name)
            .ok_or_else(|| PgError::protocol(format!("no statement named {:?}", portal.stmt_name)))?
            .clone();
        let executed = self
            .run(&stmt.sql, portal.params, portal.result_formats)
            .await?;
        let desc = if executed.result.has_results() {
            Some(executed.columns())
        } else {
            None
        };
        self.result_cache.insert(name.to_string(), executed);
        Ok(desc)
    }

    /// Executes the named statement with no bound parameters, purely to
    /// discover its column metadata; the result is not cached, since there
    /// is no portal yet for an Execute to consume it through.
    pub async fn describe_statement(&mut self, name: &str) -> Result<Option<Vec<ColumnDescription>>> {
        let stmt = self
            .statements
            .get(name)
            .ok_or_else(|| PgError::protocol(format!("no statement named {:?}", name)))?
            .clone();
        let executed = self.run(&stmt.sql, Vec::new(), Vec::new()).await?;
        Ok(if executed.result.has_results() {
            Some(executed.columns())
        } else {
            None
        })
    }

    /// `execute_portal(name) → QueryResult`: reuses a cached Describe
    /// result if present, otherwise executes afresh.
    pub async fn execute_portal(&mut self, name: &str) -> Result<Executed> {
        if let Some(executed) = self.result_cache.remove(name) {
            return Ok(executed);
        }
        let portal = self
            .portals
            .get(name)
            .ok_or_else(|| PgError::protocol(format!("no portal named {:?}", name)))?
            .clone();
        let stmt = self
            .statements
            .get(&portal.stmt_name)
            .ok_or_else(|| PgError::protocol(format!("no statement named {:?}", portal.stmt_name)))?
            .clone();
        self.run(&stmt.sql, portal.params, portal.result_formats)
            .await
    }

    /// `'I'` idle, `'E'` in a failed transaction, `'T'` otherwise in an open
    /// transaction, per the §3 invariant.
    pub fn transaction_status(&self) -> char {
        if !self.session.in_transaction() {
            'I'
        } else if self.has_error {
            'E'
        } else {
            'T'
        }
    }

    pub fn mark_error(&mut self) {
        self.has_error = true;
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Clears the error latch; called on Sync.
    pub fn sync(&mut self) {
        self.has_error = false;
    }

    /// No-op: the wire writer's own buffering, not result ordering, is what
    /// Flush affects.
    pub fn flush(&mut self) {}

    /// Unwraps the backend session, for handing to
    /// `backend::Connection::close_session` when the connection tears down.
    pub fn into_session(self) -> Box<dyn Session> {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{BoxFuture, QueryResult as QueryResultTrait};
    use pgrepr::Type;
    use std::collections::VecDeque;

    struct FakeResult {
        rows: VecDeque<Vec<Value>>,
        cols: Vec<(String, Type)>,
    }

    impl QueryResultTrait for FakeResult {
        fn has_results(&self) -> bool {
            !self.cols.is_empty()
        }
        fn column_count(&self) -> usize {
            self.cols.len()
        }
        fn column(&self, index: usize) -> Option<(&str, Type)> {
            self.cols.get(index).map(|(n, t)| (n.as_str(), *t))
        }
        fn next_row(&mut self) -> Option<Vec<Value>> {
            self.rows.pop_front()
        }
        fn status(&self) -> String {
            "SELECT 1".to_string()
        }
    }

    struct FakeSession {
        in_txn: bool,
    }

    impl Session for FakeSession {
        fn execute_sql<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: Vec<Value>,
        ) -> BoxFuture<'a, Result<Box<dyn QueryResultTrait>>> {
            Box::pin(async move {
                let result: Box<dyn QueryResultTrait> = Box::new(FakeResult {
                    rows: VecDeque::from(vec![vec![Value::Int8(1)]]),
                    cols: vec![("n".to_string(), Type::Integer)],
                });
                Ok(result)
            })
        }

        fn in_transaction(&self) -> bool {
            self.in_txn
        }
    }

    fn ctx(in_txn: bool) -> Context {
        Context::new(Box::new(FakeSession { in_txn }), None, Vec::new(), 42, 99)
    }

    #[tokio::test]
    async fn add_portal_requires_known_statement() {
        let mut c = ctx(false);
        let err = c.add_portal("p".into(), "missing".into(), vec![], vec![]);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn describe_then_execute_reuses_cached_result() {
        let mut c = ctx(false);
        c.add_statement("s".into(), "SELECT 1".into(), vec![]);
        c.add_portal("p".into(), "s".into(), vec![], vec![]).unwrap();
        let desc = c.describe_portal("p").await.unwrap();
        assert_eq!(desc.unwrap().len(), 1);
        let executed = c.execute_portal("p").await.unwrap();
        assert_eq!(executed.result.column_count(), 1);
    }

    #[test]
    fn idle_when_not_in_transaction() {
        let c = ctx(false);
        assert_eq!(c.transaction_status(), 'I');
    }

    #[test]
    fn failed_when_error_latched_in_transaction() {
        let mut c = ctx(true);
        c.mark_error();
        assert_eq!(c.transaction_status(), 'E');
        c.sync();
        assert_eq!(c.transaction_status(), 'T');
    }
}
