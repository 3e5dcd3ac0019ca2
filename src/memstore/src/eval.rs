//! A small hand-rolled SQL surface: transaction keywords and `SET` by raw
//! keyword dispatch (the same string-matching style `rewriter::short_circuit`
//! uses upstream of this backend), `CREATE TABLE`/`INSERT` by a minimal
//! paren-aware splitter, and `SELECT` through `sqlparser`'s AST for the
//! projection/filter/expression work that's worth not hand-rolling.

use crate::table::Table;
use backend::QueryResult;
use common::error::{PgError, Result};
use pgrepr::{Type, Value};
use sqlparser::ast::{
    BinaryOperator, DataType, Expr, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, VecDeque};

/// A completed statement's column schema and materialized rows.
pub(crate) struct RowsResult {
    columns: Vec<(String, Type)>,
    rows: VecDeque<Vec<Value>>,
    tag: String,
}

impl QueryResult for RowsResult {
    fn has_results(&self) -> bool {
        true
    }

    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column(&self, index: usize) -> Option<(&str, Type)> {
        self.columns.get(index).map(|(name, ty)| (name.as_str(), *ty))
    }

    fn next_row(&mut self) -> Option<Vec<Value>> {
        self.rows.pop_front()
    }

    fn status(&self) -> String {
        self.tag.clone()
    }
}

/// A completed statement with no result set, just a command tag.
pub(crate) struct TagResult {
    tag: String,
}

impl TagResult {
    pub(crate) fn new(tag: impl Into<String>) -> TagResult {
        TagResult { tag: tag.into() }
    }
}

impl QueryResult for TagResult {
    fn has_results(&self) -> bool {
        false
    }

    fn column_count(&self) -> usize {
        0
    }

    fn column(&self, _index: usize) -> Option<(&str, Type)> {
        None
    }

    fn next_row(&mut self) -> Option<Vec<Value>> {
        None
    }

    fn status(&self) -> String {
        self.tag.clone()
    }
}

pub(crate) fn create_table(
    catalog: &mut HashMap<String, Table>,
    sql: &str,
) -> Result<Box<dyn QueryResult>> {
    let sql = sql.trim().trim_end_matches(';');
    let rest = strip_ci_prefix(sql, "CREATE")
        .and_then(|s| strip_ci_prefix(s, "TABLE"))
        .ok_or_else(|| PgError::backend("malformed CREATE TABLE"))?;
    let rest = strip_ci_prefix(rest, "IF NOT EXISTS").unwrap_or(rest);

    let open = rest
        .find('(')
        .ok_or_else(|| PgError::backend("CREATE TABLE missing column list"))?;
    let close = rest
        .rfind(')')
        .ok_or_else(|| PgError::backend("CREATE TABLE missing closing paren"))?;
    let name = rest[..open].trim().to_string();
    let body = &rest[open + 1..close];

    let mut columns = Vec::new();
    for col in split_top_level(body, ',') {
        let col = col.trim();
        let mut parts = col.splitn(2, char::is_whitespace);
        let col_name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PgError::backend("malformed column definition"))?
            .to_string();
        let type_word = parts.next().unwrap_or("text");
        columns.push((col_name, parse_type(type_word)));
    }

    catalog.insert(name, Table {
        columns,
        rows: Vec::new(),
    });
    Ok(Box::new(TagResult::new("CREATE TABLE")))
}

pub(crate) fn insert(
    catalog: &mut HashMap<String, Table>,
    sql: &str,
    params: &[Value],
) -> Result<Box<dyn QueryResult>> {
    let sql = sql.trim().trim_end_matches(';');
    let rest = strip_ci_prefix(sql, "INSERT")
        .and_then(|s| strip_ci_prefix(s, "INTO"))
        .ok_or_else(|| PgError::backend("malformed INSERT"))?;

    let values_pos =
        find_ci(rest, "VALUES").ok_or_else(|| PgError::backend("INSERT without VALUES is not supported"))?;
    let target = rest[..values_pos].trim();
    let values_part = rest[values_pos + "VALUES".len()..].trim();

    let (table_name, explicit_columns) = if let Some(paren) = target.find('(') {
        let name = target[..paren].trim().to_string();
        let close = target
            .rfind(')')
            .ok_or_else(|| PgError::backend("malformed column list"))?;
        let cols = split_top_level(&target[paren + 1..close], ',');
        (name, Some(cols))
    } else {
        (target.to_string(), None)
    };

    let table = catalog
        .get_mut(&table_name)
        .ok_or_else(|| PgError::backend(format!("no such table: {}", table_name)))?;

    let column_order: Vec<usize> = match &explicit_columns {
        Some(cols) => cols
            .iter()
            .map(|c| {
                table
                    .columns
                    .iter()
                    .position(|(name, _)| name.eq_ignore_ascii_case(c.trim()))
                    .ok_or_else(|| PgError::backend(format!("no such column: {}", c)))
            })
            .collect::<Result<Vec<_>>>()?,
        None => (0..table.columns.len()).collect(),
    };

    let mut inserted = 0;
    for group in split_top_level(values_part, ',') {
        let group = group.trim();
        let inner = group
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| PgError::backend("malformed VALUES list"))?;
        let raw_values = split_top_level(inner, ',');
        if raw_values.len() != column_order.len() {
            return Err(PgError::backend("VALUES arity does not match column list"));
        }
        let mut row = vec![Value::Null; table.columns.len()];
        for (pos, raw) in column_order.iter().zip(raw_values.iter()) {
            row[*pos] = parse_literal(raw, params)?;
        }
        table.rows.push(row);
        inserted += 1;
    }

    Ok(Box::new(TagResult::new(format!("INSERT 0 {}", inserted))))
}

pub(crate) fn select(
    catalog: &HashMap<String, Table>,
    sql: &str,
    params: &[Value],
) -> Result<Box<dyn QueryResult>> {
    let dialect = GenericDialect {};
    let stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| PgError::backend(e.to_string()))?;
    let stmt = stmts
        .into_iter()
        .next()
        .ok_or_else(|| PgError::backend("empty statement"))?;
    let Statement::Query(query) = &stmt else {
        return Err(PgError::backend("only SELECT is supported by this backend"));
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(PgError::backend(
            "only simple SELECT is supported by this backend",
        ));
    };

    if select.from.is_empty() {
        let (columns, values) = project_row(&select.projection, &[], None, params)?;
        let mut rows = VecDeque::new();
        rows.push_back(values);
        return Ok(Box::new(RowsResult {
            columns,
            rows,
            tag: "SELECT 1".to_string(),
        }));
    }

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(PgError::backend("joins are not supported by this backend"));
    }
    let TableFactor::Table { name, .. } = &select.from[0].relation else {
        return Err(PgError::backend(
            "only plain table references are supported",
        ));
    };
    let table_name = name.to_string();
    let table = catalog
        .get(&table_name)
        .ok_or_else(|| PgError::backend(format!("no such table: {}", table_name)))?;

    let mut matched = Vec::new();
    for row in &table.rows {
        let keep = match &select.selection {
            Some(expr) => {
                let (value, _) = eval_expr(expr, Some((&table.columns, row)), params)?;
                as_bool(&value)?
            }
            None => true,
        };
        if keep {
            matched.push(row);
        }
    }

    let dummy_row: Vec<Value> = table.columns.iter().map(|_| Value::Null).collect();
    let (columns, _) = project_row(&select.projection, &table.columns, Some(&dummy_row), params)?;

    let mut rows = VecDeque::new();
    for row in &matched {
        let (_, values) = project_row(&select.projection, &table.columns, Some(row), params)?;
        rows.push_back(values);
    }

    let tag = format!("SELECT {}", rows.len());
    Ok(Box::new(RowsResult { columns, rows, tag }))
}

type Ctx<'a> = Option<(&'a [(String, Type)], &'a [Value])>;

fn project_row(
    projection: &[SelectItem],
    schema: &[(String, Type)],
    row: Option<&[Value]>,
    params: &[Value],
) -> Result<(Vec<(String, Type)>, Vec<Value>)> {
    let ctx: Ctx = row.map(|r| (schema, r));
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for item in projection {
        match item {
            SelectItem::Wildcard(_) => {
                for (i, (name, ty)) in schema.iter().enumerate() {
                    columns.push((name.clone(), *ty));
                    values.push(row.map(|r| r[i].clone()).unwrap_or(Value::Null));
                }
            }
            SelectItem::UnnamedExpr(expr) => {
                let (value, ty) = eval_expr(expr, ctx, params)?;
                columns.push((expr.to_string(), ty));
                values.push(value);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                let (value, ty) = eval_expr(expr, ctx, params)?;
                columns.push((alias.value.clone(), ty));
                values.push(value);
            }
            _ => return Err(PgError::backend("unsupported select item")),
        }
    }
    Ok((columns, values))
}

fn eval_expr(expr: &Expr, ctx: Ctx, params: &[Value]) -> Result<(Value, Type)> {
    match expr {
        Expr::Value(v) => eval_literal(v, params),
        Expr::Identifier(ident) => lookup_column(&ident.value, ctx),
        Expr::CompoundIdentifier(parts) => {
            let name = &parts
                .last()
                .ok_or_else(|| PgError::backend("empty compound identifier"))?
                .value;
            lookup_column(name, ctx)
        }
        Expr::UnaryOp { op, expr } => {
            let (value, ty) = eval_expr(expr, ctx, params)?;
            match op {
                UnaryOperator::Minus => negate(value, ty),
                UnaryOperator::Plus => Ok((value, ty)),
                _ => Err(PgError::backend("unsupported unary operator")),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let (lv, _) = eval_expr(left, ctx, params)?;
            let (rv, _) = eval_expr(right, ctx, params)?;
            eval_binary(op, lv, rv)
        }
        Expr::Cast { expr, data_type, .. } => {
            let (value, _) = eval_expr(expr, ctx, params)?;
            cast_value(value, data_type)
        }
        Expr::Nested(inner) => eval_expr(inner, ctx, params),
        Expr::Function(_) => eval_function_text(&expr.to_string()),
        _ => Err(PgError::backend(format!("unsupported expression: {}", expr))),
    }
}

fn lookup_column(name: &str, ctx: Ctx) -> Result<(Value, Type)> {
    let (schema, row) = ctx.ok_or_else(|| {
        PgError::backend(format!("column {:?} referenced with no FROM clause", name))
    })?;
    let idx = schema
        .iter()
        .position(|(col, _)| col.eq_ignore_ascii_case(name))
        .ok_or_else(|| PgError::backend(format!("no such column: {}", name)))?;
    Ok((row[idx].clone(), schema[idx].1))
}

fn eval_literal(v: &SqlValue, params: &[Value]) -> Result<(Value, Type)> {
    match v {
        SqlValue::Number(n, _) => {
            if n.contains('.') {
                let f: f64 = n
                    .parse()
                    .map_err(|_| PgError::backend(format!("invalid numeric literal: {}", n)))?;
                Ok((Value::Float8(f), Type::Float))
            } else {
                let i: i64 = n
                    .parse()
                    .map_err(|_| PgError::backend(format!("invalid numeric literal: {}", n)))?;
                Ok((Value::Int8(i), Type::Bigint))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok((Value::Text(s.clone()), Type::Text))
        }
        SqlValue::Boolean(b) => Ok((Value::Bool(*b), Type::Bool)),
        SqlValue::Null => Ok((Value::Null, Type::Unknown)),
        SqlValue::Placeholder(p) => {
            let idx: usize = p
                .trim_start_matches('$')
                .parse()
                .map_err(|_| PgError::backend(format!("bad placeholder: {}", p)))?;
            let value = params
                .get(idx.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| PgError::backend("missing bind parameter"))?;
            let ty = infer_type(&value);
            Ok((value, ty))
        }
        _ => Err(PgError::backend(format!("unsupported literal: {}", v))),
    }
}

fn eval_function_text(text: &str) -> Result<(Value, Type)> {
    let lower = text.to_lowercase();
    if let Some(rest) = lower.strip_prefix("current_setting(") {
        let arg = rest
            .trim_end_matches(')')
            .trim()
            .trim_matches(|c| c == '\'' || c == '"');
        return Ok((Value::Text(current_setting(arg)), Type::Text));
    }
    if lower.starts_with("version(") {
        return Ok((Value::Text("PostgreSQL 14.0".to_string()), Type::Text));
    }
    Err(PgError::backend(format!(
        "unsupported function call: {}",
        text
    )))
}

fn current_setting(name: &str) -> String {
    match name {
        "search_path" => "public".to_string(),
        "timezone" => "UTC".to_string(),
        "server_version" => "14.0".to_string(),
        _ => String::new(),
    }
}

fn infer_type(v: &Value) -> Type {
    match v {
        Value::Null => Type::Unknown,
        Value::Bool(_) => Type::Bool,
        Value::Int8(_) => Type::Bigint,
        Value::Float8(_) => Type::Float,
        Value::Bytes(_) => Type::Bytes,
        Value::Date(_) => Type::Date,
        Value::Time(_) => Type::Time,
        Value::Timestamp(_) => Type::Timestamp,
        Value::Interval(_) => Type::Interval,
        Value::Json(_) => Type::Json,
        Value::Decimal(_) => Type::Decimal,
        Value::Text(_) => Type::Text,
        Value::Array(_) => Type::Array,
    }
}

fn negate(v: Value, ty: Type) -> Result<(Value, Type)> {
    match v {
        Value::Int8(n) => Ok((Value::Int8(-n), ty)),
        Value::Float8(f) => Ok((Value::Float8(-f), ty)),
        _ => Err(PgError::backend("unary minus requires a numeric operand")),
    }
}

fn as_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Int8(n) => Ok(*n as f64),
        Value::Float8(f) => Ok(*f),
        Value::Decimal(s) => s
            .parse()
            .map_err(|_| PgError::backend(format!("invalid decimal: {}", s))),
        _ => Err(PgError::backend("expected a numeric value")),
    }
}

fn eval_binary(op: &BinaryOperator, lv: Value, rv: Value) -> Result<(Value, Type)> {
    use BinaryOperator::*;
    match op {
        Plus | Minus | Multiply | Divide | Modulo => arithmetic(op, lv, rv),
        Eq | NotEq | Lt | LtEq | Gt | GtEq => Ok((Value::Bool(compare(op, &lv, &rv)?), Type::Bool)),
        And => Ok((Value::Bool(as_bool(&lv)? && as_bool(&rv)?), Type::Bool)),
        Or => Ok((Value::Bool(as_bool(&lv)? || as_bool(&rv)?), Type::Bool)),
        _ => Err(PgError::backend("unsupported binary operator")),
    }
}

fn arithmetic(op: &BinaryOperator, lv: Value, rv: Value) -> Result<(Value, Type)> {
    use BinaryOperator::*;
    if let (Value::Int8(l), Value::Int8(r)) = (&lv, &rv) {
        let (l, r) = (*l, *r);
        let result = match op {
            Plus => l.checked_add(r),
            Minus => l.checked_sub(r),
            Multiply => l.checked_mul(r),
            Divide => l.checked_div(r),
            Modulo => l.checked_rem(r),
            _ => return Err(PgError::backend("unsupported arithmetic operator")),
        };
        let result = result.ok_or_else(|| PgError::backend("integer overflow or division by zero"))?;
        return Ok((Value::Int8(result), Type::Bigint));
    }
    let l = as_f64(&lv)?;
    let r = as_f64(&rv)?;
    let result = match op {
        Plus => l + r,
        Minus => l - r,
        Multiply => l * r,
        Divide => l / r,
        Modulo => l % r,
        _ => return Err(PgError::backend("unsupported arithmetic operator")),
    };
    Ok((Value::Float8(result), Type::Float))
}

fn compare(op: &BinaryOperator, lv: &Value, rv: &Value) -> Result<bool> {
    use BinaryOperator::*;
    let ordering = if let (Value::Text(l), Value::Text(r)) = (lv, rv) {
        l.cmp(r)
    } else {
        as_f64(lv)?
            .partial_cmp(&as_f64(rv)?)
            .ok_or_else(|| PgError::backend("values are not comparable"))?
    };
    Ok(match op {
        Eq => ordering.is_eq(),
        NotEq => !ordering.is_eq(),
        Lt => ordering.is_lt(),
        LtEq => ordering.is_le(),
        Gt => ordering.is_gt(),
        GtEq => ordering.is_ge(),
        _ => return Err(PgError::backend("unsupported comparison operator")),
    })
}

fn as_bool(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        _ => Err(PgError::backend("expected a boolean expression")),
    }
}

fn cast_value(v: Value, data_type: &DataType) -> Result<(Value, Type)> {
    let ty = parse_type(&data_type.to_string());
    let converted = convert(v, ty)?;
    Ok((converted, ty))
}

fn convert(v: Value, ty: Type) -> Result<Value> {
    Ok(match (ty, v) {
        (Type::Integer | Type::Bigint, Value::Text(s)) => Value::Int8(
            s.parse()
                .map_err(|_| PgError::backend(format!("invalid integer literal: {}", s)))?,
        ),
        (Type::Integer | Type::Bigint, Value::Float8(f)) => Value::Int8(f as i64),
        (Type::Float, Value::Text(s)) => Value::Float8(
            s.parse()
                .map_err(|_| PgError::backend(format!("invalid float literal: {}", s)))?,
        ),
        (Type::Float, Value::Int8(n)) => Value::Float8(n as f64),
        (Type::Bool, Value::Text(s)) => Value::Bool(s.eq_ignore_ascii_case("true") || s == "t"),
        (Type::Text, Value::Int8(n)) => Value::Text(n.to_string()),
        (Type::Text, Value::Float8(f)) => Value::Text(f.to_string()),
        (Type::Text, Value::Bool(b)) => Value::Text(b.to_string()),
        (_, v) => v,
    })
}

fn parse_type(word: &str) -> Type {
    let upper = word.trim().to_uppercase();
    if upper.contains("BIGINT") {
        Type::Bigint
    } else if upper.contains("INT") {
        Type::Integer
    } else if upper.contains("BOOL") {
        Type::Bool
    } else if upper.contains("DOUBLE") || upper.contains("FLOAT") || upper.contains("REAL") {
        Type::Float
    } else if upper.contains("NUMERIC") || upper.contains("DECIMAL") {
        Type::Decimal
    } else if upper.contains("TIMESTAMP") {
        Type::Timestamp
    } else if upper.contains("DATE") {
        Type::Date
    } else if upper.contains("TIME") {
        Type::Time
    } else if upper.contains("JSON") {
        Type::Json
    } else if upper.contains("BYTEA") {
        Type::Bytes
    } else {
        Type::Text
    }
}

fn parse_literal(raw: &str, params: &[Value]) -> Result<Value> {
    let s = raw.trim();
    if s.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if s.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if s.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if let Some(rest) = s.strip_prefix('$') {
        let idx: usize = rest
            .parse()
            .map_err(|_| PgError::backend(format!("bad placeholder: {}", s)))?;
        return params
            .get(idx.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| PgError::backend("missing bind parameter"));
    }
    if let Some(inner) = s.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Ok(Value::Text(inner.replace("''", "'")));
    }
    if s.contains('.') {
        return s
            .parse::<f64>()
            .map(Value::Float8)
            .map_err(|_| PgError::backend(format!("invalid literal: {}", s)));
    }
    s.parse::<i64>()
        .map(Value::Int8)
        .map_err(|_| PgError::backend(format!("invalid literal: {}", s)))
}

fn split_top_level(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut in_quote = false;
    for c in s.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '(' if !in_quote => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_quote => {
                depth -= 1;
                current.push(c);
            }
            c if c == delim && depth == 0 && !in_quote => {
                parts.push(current.trim().to_string());
                current = String::new();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn strip_ci_prefix<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(s[prefix.len()..].trim_start())
    } else {
        None
    }
}

fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_uppercase().find(&needle.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_catalog() -> HashMap<String, Table> {
        HashMap::new()
    }

    #[test]
    fn create_then_insert_then_select_round_trips_rows() {
        let mut catalog = empty_catalog();
        create_table(&mut catalog, "CREATE TABLE t1 (c1 int, c2 text)").unwrap();
        insert(
            &mut catalog,
            "INSERT INTO t1 VALUES (1, 'a'), (2, 'b')",
            &[],
        )
        .unwrap();

        let mut result = select(&catalog, "SELECT c1, c2 FROM t1 WHERE c1 = 2", &[]).unwrap();
        assert_eq!(result.status(), "SELECT 1");
        let row = result.next_row().unwrap();
        assert_eq!(row, vec![Value::Int8(2), Value::Text("b".to_string())]);
        assert!(result.next_row().is_none());
    }

    #[test]
    fn insert_substitutes_bind_parameters() {
        let mut catalog = empty_catalog();
        create_table(&mut catalog, "CREATE TABLE t1 (c1 int, c2 text)").unwrap();
        insert(
            &mut catalog,
            "INSERT INTO t1 (c1, c2) VALUES ($1, $2)",
            &[Value::Int8(7), Value::Text("seven".to_string())],
        )
        .unwrap();

        let mut result = select(&catalog, "SELECT c1, c2 FROM t1", &[]).unwrap();
        let row = result.next_row().unwrap();
        assert_eq!(row, vec![Value::Int8(7), Value::Text("seven".to_string())]);
    }

    #[test]
    fn select_with_no_from_evaluates_literal_expressions() {
        let catalog = empty_catalog();
        let mut result = select(&catalog, "SELECT 1 + 2 AS sum", &[]).unwrap();
        assert_eq!(result.column(0).unwrap().0, "sum");
        assert_eq!(result.next_row().unwrap(), vec![Value::Int8(3)]);
    }

    #[test]
    fn select_missing_table_is_an_error() {
        let catalog = empty_catalog();
        assert!(select(&catalog, "SELECT * FROM nope", &[]).is_err());
    }

    #[test]
    fn current_setting_reports_a_default_search_path() {
        let catalog = empty_catalog();
        let mut result = select(&catalog, "SELECT current_setting('search_path')", &[]).unwrap();
        assert_eq!(result.next_row().unwrap(), vec![Value::Text("public".to_string())]);
    }
}
