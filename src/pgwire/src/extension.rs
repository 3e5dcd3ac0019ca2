//! The JSON extension-dispatch escape hatch: a simple-query
//! payload that, once SQL comments are stripped, is a JSON object is routed
//! to a registered [`backend::Extension`] by its `"method"` field instead of
//! going through the rewriter and backend SQL execution at all.

use common::error::{PgError, Result};

/// Strips `/* ... */` comments from `sql` and, if what remains looks like a
/// JSON object (ends in `}` or `};`), parses it.
///
/// Detection is deliberately loose — "ends with a closing brace" — matching
/// how a client-side driver wraps an extension call in a harmless-looking
/// SQL comment so it still round-trips through tools that insist on parsing
/// the text as SQL first. Returns `Ok(None)` for ordinary SQL; a payload that
/// looks like an extension call but fails to parse as JSON is an error, not
/// a silent fall-through to the rewriter/backend.
pub fn strip_and_parse_json(sql: &str) -> Result<Option<serde_json::Value>> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    if !trimmed.ends_with('}') {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| PgError::Json(e.to_string()))
}

fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' && chars.peek() == Some(&'*') {
            chars.next();
            loop {
                match chars.next() {
                    None => break,
                    Some('*') if chars.peek() == Some(&'/') => {
                        chars.next();
                        break;
                    }
                    Some(_) => {}
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comment_and_parses_object() {
        let sql = "/* extension call */ {\"method\": \"ping\", \"params\": {}}";
        let json = strip_and_parse_json(sql).unwrap().unwrap();
        assert_eq!(json["method"], "ping");
    }

    #[test]
    fn accepts_trailing_semicolon() {
        let sql = "{\"method\": \"ping\", \"params\": {}};";
        assert!(strip_and_parse_json(sql).unwrap().is_some());
    }

    #[test]
    fn ordinary_sql_is_not_an_extension_call() {
        assert!(strip_and_parse_json("SELECT 1").unwrap().is_none());
    }

    #[test]
    fn comment_containing_braces_does_not_confuse_the_scanner() {
        let sql = "/* {not json} */ {\"method\": \"ping\", \"params\": {}}";
        let json = strip_and_parse_json(sql).unwrap().unwrap();
        assert_eq!(json["method"], "ping");
    }

    #[test]
    fn brace_shaped_but_invalid_json_is_an_error() {
        let sql = "{not: valid, json}";
        assert!(matches!(strip_and_parse_json(sql), Err(PgError::Json(_))));
    }
}
