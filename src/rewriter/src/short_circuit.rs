//! Pre-parse rewrites for queries the downstream SQL dialect would either
//! mangle or simply doesn't support, but a real-world client driver (psql,
//! DBeaver, JDBC) sends as a matter of course. These run before anything is
//! handed to `sqlparser`, on the raw SQL text, and never fail: a rule either
//! matches and produces a replacement, or the input passes through.

/// Settings a client is allowed to `SET` even though the backend has no
/// underlying concept of them; anything else is swallowed to an empty
/// statement so `SET application_name = ...`-style noise from client
/// drivers doesn't reach the backend's own parser.
const KNOWN_SETTINGS: &[&str] = &[
    "search_path",
    "application_name",
    "client_encoding",
    "datestyle",
    "timezone",
    "extra_float_digits",
    "statement_timeout",
];

pub(crate) fn apply(sql: &str) -> String {
    let trimmed = sql.trim();

    if let Some(rewritten) = prepare_from_to_as(trimmed) {
        return rewritten;
    }
    if trimmed.eq_ignore_ascii_case("select pg_catalog.version()") {
        return "SELECT 'PostgreSQL 14.0' as version".to_string();
    }
    if trimmed.eq_ignore_ascii_case("SHOW search_path") {
        return "SELECT current_setting('search_path') as search_path".to_string();
    }
    if trimmed.eq_ignore_ascii_case("SHOW TRANSACTION ISOLATION LEVEL") {
        return "SELECT 'read committed' as transaction_isolation".to_string();
    }
    if trimmed.eq_ignore_ascii_case("BEGIN READ ONLY") {
        return "BEGIN".to_string();
    }
    if trimmed.eq_ignore_ascii_case(
        "SELECT setting FROM pg_catalog.pg_settings WHERE name='max_index_keys'",
    ) {
        return "SELECT 32 as setting".to_string();
    }
    if let Some(rest) = strip_prefix_ci(trimmed, "SET ") {
        return rewrite_set(rest, trimmed);
    }

    let mut sql = trimmed.to_string();
    for cast in ["::regclass", "::regtype", "::regproc"] {
        if sql.contains(cast) {
            sql = sql.replace(cast, "");
        }
    }
    sql = sql.replace(
        "pg_get_expr(ad.adbin, ad.adrelid, true)",
        "pg_get_expr(ad.adbin, ad.adrelid)",
    );
    sql = sql.replace("pg_catalog.current_schemas", "current_schemas");
    sql = sql.replace("pg_catalog.generate_series", "generate_series");
    sql
}

fn rewrite_set(rest: &str, original: &str) -> String {
    let param = rest.split_whitespace().next().unwrap_or("");
    if KNOWN_SETTINGS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(param))
    {
        original.to_string()
    } else {
        String::new()
    }
}

fn strip_prefix_ci<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    if sql.len() >= prefix.len() && sql[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&sql[prefix.len()..])
    } else {
        None
    }
}

/// `PREPARE name FROM '...'` (the ODBC/JDBC spelling) becomes `PREPARE name
/// AS '...'` (what `sqlparser`'s PostgreSQL dialect actually accepts).
fn prepare_from_to_as(sql: &str) -> Option<String> {
    let upper = sql.to_uppercase();
    if !upper.starts_with("PREPARE ") {
        return None;
    }
    let from_idx = upper.find(" FROM")?;
    let mut out = String::with_capacity(sql.len());
    out.push_str(&sql[..from_idx]);
    out.push_str(" AS");
    out.push_str(&sql[from_idx + 5..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fakes_version() {
        assert_eq!(
            apply("select pg_catalog.version()"),
            "SELECT 'PostgreSQL 14.0' as version"
        );
    }

    #[test]
    fn strips_reg_casts() {
        assert_eq!(
            apply("SELECT oid::regclass FROM pg_class"),
            "SELECT oid FROM pg_class"
        );
    }

    #[test]
    fn begin_read_only_becomes_begin() {
        assert_eq!(apply("BEGIN READ ONLY"), "BEGIN");
    }

    #[test]
    fn unknown_set_param_is_swallowed() {
        assert_eq!(apply("SET some_unknown_param = 1"), "");
    }

    #[test]
    fn known_set_param_passes_through() {
        assert_eq!(
            apply("SET search_path = public"),
            "SET search_path = public"
        );
    }

    #[test]
    fn prepare_from_becomes_as() {
        assert_eq!(
            apply("PREPARE stmt1 FROM 'SELECT 1'"),
            "PREPARE stmt1 AS 'SELECT 1'"
        );
    }

    #[test]
    fn is_idempotent_on_short_circuit_targets() {
        let once = apply("BEGIN READ ONLY");
        let twice = apply(&once);
        assert_eq!(once, twice);
    }
}
