//! Relation substitution: replacing a reference to a named table with a
//! parenthesized subquery, so a synthetic catalog view (`system.jdbc.*` and
//! the like) can be backed by an ordinary `SELECT` against the backend's own
//! `information_schema`.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Produces the SQL text a registered relation name expands to. Called once
/// per query that references the relation, not cached, since a relation's
/// definition may depend on the session (e.g. `current_schema()`).
pub type RelationProducer = Arc<dyn Fn() -> String + Send + Sync>;

/// Walks every `Statement` in `stmts`, replacing `FROM`/`JOIN` references to
/// a name present in `relations` with a derived-table subquery that
/// preserves the original alias.
pub(crate) fn substitute(
    stmts: &mut [Statement],
    relations: &HashMap<String, RelationProducer>,
    dialect: &dyn Dialect,
) {
    if relations.is_empty() {
        return;
    }
    for stmt in stmts {
        if let Statement::Query(query) = stmt {
            substitute_query(query, relations, dialect);
        }
    }
}

fn substitute_query(
    query: &mut Query,
    relations: &HashMap<String, RelationProducer>,
    dialect: &dyn Dialect,
) {
    if let Some(with) = &mut query.with {
        for cte in &mut with.cte_tables {
            substitute_query(&mut cte.query, relations, dialect);
        }
    }
    substitute_set_expr(&mut query.body, relations, dialect);
}

fn substitute_set_expr(
    expr: &mut SetExpr,
    relations: &HashMap<String, RelationProducer>,
    dialect: &dyn Dialect,
) {
    match expr {
        SetExpr::Select(select) => substitute_select(select, relations, dialect),
        SetExpr::Query(query) => substitute_query(query, relations, dialect),
        SetExpr::SetOperation { left, right, .. } => {
            substitute_set_expr(left, relations, dialect);
            substitute_set_expr(right, relations, dialect);
        }
        SetExpr::Values(_) | SetExpr::Insert(_) | SetExpr::Update(_) | SetExpr::Table(_) => {}
    }
}

fn substitute_select(
    select: &mut Select,
    relations: &HashMap<String, RelationProducer>,
    dialect: &dyn Dialect,
) {
    for twj in &mut select.from {
        substitute_factor(&mut twj.relation, relations, dialect);
        for join in &mut twj.joins {
            substitute_factor(&mut join.relation, relations, dialect);
        }
    }
}

fn substitute_factor(
    factor: &mut TableFactor,
    relations: &HashMap<String, RelationProducer>,
    dialect: &dyn Dialect,
) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let Some(producer) = relations.get(&name.to_string()) else {
                return;
            };
            let sql = producer();
            match Parser::parse_sql(dialect, &sql) {
                Ok(mut parsed) if parsed.len() == 1 => {
                    if let Statement::Query(subquery) = parsed.remove(0) {
                        *factor = TableFactor::Derived {
                            lateral: false,
                            subquery,
                            alias: alias.clone(),
                        };
                    } else {
                        warn!(relation = %name, "relation producer did not return a SELECT");
                    }
                }
                Ok(_) => warn!(relation = %name, "relation producer returned more than one statement"),
                Err(e) => warn!(relation = %name, error = %e, "failed to parse relation producer's SQL"),
            }
        }
        TableFactor::Derived { subquery, .. } => substitute_query(subquery, relations, dialect),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            substitute_factor(&mut table_with_joins.relation, relations, dialect);
            for join in &mut table_with_joins.joins {
                substitute_factor(&mut join.relation, relations, dialect);
            }
        }
        _ => {}
    }
}
