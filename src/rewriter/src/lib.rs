//! SQL rewriting: pre-parse short-circuits for client-compatibility quirks,
//! and a relation-substitution pass that lets a server synthesize catalog
//! views the backend has no native concept of.
//!
//! Rewriting never fails outward. A parse error here means the statement is
//! passed on to the backend exactly as the client sent it; the backend's own
//! parser gets the final word on whether it's valid SQL.

mod relation;
mod short_circuit;

pub use relation::RelationProducer;

use sqlparser::dialect::{Dialect, GenericDialect};
use sqlparser::parser::Parser;
use std::collections::HashMap;
use tracing::warn;

/// The pre-parse short-circuit and relation-substitution stage.
///
/// A `Rewriter` is constructed once, at server startup, with every relation
/// it will ever serve: `relation` registration after a server starts
/// accepting connections is not supported, matching the "relation map must
/// be set at server-construction time" rule.
pub struct Rewriter {
    dialect: Box<dyn Dialect + Send + Sync>,
    relations: HashMap<String, RelationProducer>,
}

impl std::fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rewriter")
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Rewriter {
    fn default() -> Self {
        Rewriter::new(Box::new(GenericDialect {}))
    }
}

impl Rewriter {
    /// `dialect` governs how SQL is parsed for the relation-substitution
    /// pass; regeneration goes through `sqlparser`'s own `Display` for
    /// `Statement`, which renders ANSI-ish SQL independent of dialect, so a
    /// dialect pair (read, write) as in the system this was distilled from
    /// collapses to a single read dialect here.
    pub fn new(dialect: Box<dyn Dialect + Send + Sync>) -> Rewriter {
        Rewriter {
            dialect,
            relations: HashMap::new(),
        }
    }

    /// Registers a synthetic relation: every `FROM`/`JOIN` reference to
    /// `name` is replaced by a parenthesized subquery of whatever SQL
    /// `producer` returns, preserving the original alias.
    pub fn relation(&mut self, name: impl Into<String>, producer: RelationProducer) {
        self.relations.insert(name.into(), producer);
    }

    /// Applies short-circuits, then (if any relations are registered) parses
    /// and rewrites relation references, then regenerates the SQL text.
    pub fn rewrite(&self, sql: &str) -> String {
        let sql = short_circuit::apply(sql);
        if self.relations.is_empty() {
            return sql;
        }

        let mut stmts = match Parser::parse_sql(&*self.dialect, &sql) {
            Ok(stmts) => stmts,
            Err(e) => {
                warn!(error = %e, sql, "rewriter: parse failed, passing SQL through unchanged");
                return sql;
            }
        };

        relation::substitute(&mut stmts, &self.relations, &*self.dialect);

        stmts
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn passes_through_when_no_relations_registered() {
        let rewriter = Rewriter::default();
        assert_eq!(
            rewriter.rewrite("SELECT * FROM widgets"),
            "SELECT * FROM widgets"
        );
    }

    #[test]
    fn applies_short_circuits_before_parsing() {
        let rewriter = Rewriter::default();
        assert_eq!(rewriter.rewrite("BEGIN READ ONLY"), "BEGIN");
    }

    #[test]
    fn substitutes_a_registered_relation() {
        let mut rewriter = Rewriter::default();
        rewriter.relation(
            "system.jdbc.schemas",
            Arc::new(|| {
                "SELECT catalog_name as table_catalog, schema_name as table_schem \
                 FROM information_schema.schemata"
                    .to_string()
            }),
        );
        let rewritten = rewriter.rewrite("SELECT * FROM system.jdbc.schemas t");
        assert!(rewritten.contains("information_schema.schemata"));
        assert!(rewritten.contains(" AS t") || rewritten.contains(") t"));
    }

    #[test]
    fn unparseable_sql_passes_through_unchanged() {
        let mut rewriter = Rewriter::default();
        rewriter.relation("t", Arc::new(|| "SELECT 1".to_string()));
        let garbage = "SELECT FROM FROM WHERE";
        assert_eq!(rewriter.rewrite(garbage), garbage);
    }
}
