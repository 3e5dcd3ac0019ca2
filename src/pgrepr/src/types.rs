//! The type codec table: for each abstract type, its PostgreSQL OID and its
//! text/binary encoders.
//!
//! Unlike PostgreSQL's own type catalog (arbitrary array nesting and a much
//! larger type list), this `Type` is the flat set the core actually needs to
//! move values between a backend and a wire client. Encoding is pure and
//! infallible in the text format; binary
//! encoding can fail, since several abstract types simply have no assigned
//! binary representation here.

use crate::value::{Interval, Value};
use byteorder::{BigEndian, ByteOrder};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use common::error::{PgError, Result};

/// The OID PostgreSQL clients get for any type this table has no better
/// answer for, paired with text-only `to_string` rendering.
pub const UNKNOWN_OID: i32 = 705;

/// An abstract value type, independent of any particular backend's own type
/// system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Null,
    Bigint,
    Bool,
    Bytes,
    Date,
    Decimal,
    Float,
    Integer,
    Interval,
    Json,
    Text,
    Time,
    Timestamp,
    /// A type a backend didn't map to anything more specific; text-only,
    /// `to_string` rendering, OID 705.
    Unknown,
    IntegerArray,
    StringArray,
    Array,
}

/// Day zero for the binary DATE/TIMESTAMP encodings: 2000-01-01, matching
/// PostgreSQL's own epoch for these types.
fn pg_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid date")
}

impl Type {
    /// The PostgreSQL OID clients should be told this type is, in
    /// RowDescription.
    pub fn oid(&self) -> i32 {
        match self {
            Type::Null => -1,
            Type::Bigint => 20,
            Type::Bool => 16,
            Type::Bytes => 17,
            Type::Integer => 23,
            Type::Text => 25,
            Type::Json => 114,
            Type::Float => 701,
            Type::Date => 1082,
            Type::Time => 1083,
            Type::Timestamp => 1114,
            Type::Interval => 1186,
            Type::Decimal => 1700,
            Type::IntegerArray => 1007,
            Type::StringArray => 1009,
            Type::Array => 2277,
            Type::Unknown => UNKNOWN_OID,
        }
    }

    /// Renders `value` in PostgreSQL's text format. Returns `None` for SQL
    /// NULL, which the caller encodes as a field length of -1 regardless of
    /// the requested format.
    pub fn encode_text(&self, value: &Value) -> Option<Vec<u8>> {
        if matches!(value, Value::Null) {
            return None;
        }
        Some(self.encode_text_non_null(value).into_bytes())
    }

    fn encode_text_non_null(&self, value: &Value) -> String {
        match (self, value) {
            (_, Value::Null) => unreachable!("handled by encode_text"),
            (Type::Bool, Value::Bool(b)) => {
                if *b { "true".to_string() } else { "false".to_string() }
            }
            (Type::Bytes, Value::Bytes(b)) => format!("\\x{}", hex_encode(b)),
            (Type::Date, Value::Date(d)) => d.format("%Y-%m-%d").to_string(),
            (Type::Time, Value::Time(t)) => t.format("%H:%M:%S%.f").to_string(),
            (Type::Timestamp, Value::Timestamp(ts)) => {
                ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
            }
            (Type::Interval, Value::Interval(iv)) => {
                let (secs, micros) = iv.seconds_and_micros();
                format!("{} days {} seconds {} microseconds", iv.days, secs, micros)
            }
            (Type::Json, Value::Json(j)) => j.to_string(),
            (Type::IntegerArray | Type::StringArray | Type::Array, Value::Array(elems)) => {
                let rendered: Vec<String> =
                    elems.iter().map(|e| self.array_element_text(e)).collect();
                format!("{{{}}}", rendered.join(","))
            }
            (_, Value::Int8(n)) => n.to_string(),
            (_, Value::Float8(f)) => f.to_string(),
            (_, Value::Decimal(s)) => s.clone(),
            (_, Value::Text(s)) => s.clone(),
            // Any other combination falls back to the unknown-type rule:
            // printable `to_string` rendering.
            (_, v) => self.array_element_text(v),
        }
    }

    /// Renders a single array element for inclusion inside `{...}`.
    fn array_element_text(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int8(n) => n.to_string(),
            Value::Float8(f) => f.to_string(),
            Value::Decimal(s) | Value::Text(s) => s.clone(),
            Value::Bytes(b) => format!("\\x{}", hex_encode(b)),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            Value::Json(j) => j.to_string(),
            Value::Interval(iv) => {
                let (secs, micros) = iv.seconds_and_micros();
                format!("{} days {} seconds {} microseconds", iv.days, secs, micros)
            }
            Value::Array(elems) => {
                let rendered: Vec<String> =
                    elems.iter().map(|e| self.array_element_text(e)).collect();
                format!("{{{}}}", rendered.join(","))
            }
        }
    }

    /// Renders `value` in PostgreSQL's binary format. Returns `Ok(None)` for
    /// SQL NULL. Types this table has no binary encoding for fail with a
    /// backend error the caller turns into an ErrorResponse.
    pub fn encode_binary(&self, value: &Value) -> Result<Option<Vec<u8>>> {
        if matches!(value, Value::Null) {
            return Ok(None);
        }
        let bytes = match (self, value) {
            (Type::Integer, Value::Int8(n)) => {
                let mut buf = [0u8; 4];
                BigEndian::write_i32(&mut buf, *n as i32);
                buf.to_vec()
            }
            (Type::Bigint, Value::Int8(n)) => {
                let mut buf = [0u8; 8];
                BigEndian::write_i64(&mut buf, *n);
                buf.to_vec()
            }
            (Type::Bool, Value::Bool(b)) => vec![if *b { 1 } else { 0 }],
            (Type::Float, Value::Float8(f)) => {
                let mut buf = [0u8; 8];
                BigEndian::write_f64(&mut buf, *f);
                buf.to_vec()
            }
            (Type::Text, Value::Text(s)) => s.as_bytes().to_vec(),
            (Type::Date, Value::Date(d)) => {
                let days = (*d - pg_epoch()).num_days() as i32;
                let mut buf = [0u8; 4];
                BigEndian::write_i32(&mut buf, days);
                buf.to_vec()
            }
            (Type::Time, Value::Time(t)) => {
                let micros = time_of_day_micros(t);
                let mut buf = [0u8; 8];
                BigEndian::write_i64(&mut buf, micros);
                buf.to_vec()
            }
            (Type::Timestamp, Value::Timestamp(ts)) => {
                let micros = timestamp_micros_since_pg_epoch(ts);
                let mut buf = [0u8; 8];
                BigEndian::write_i64(&mut buf, micros);
                buf.to_vec()
            }
            (Type::Bytes, Value::Bytes(b)) => b.clone(),
            _ => {
                return Err(PgError::backend(format!(
                    "unsupported binary encoding for type {:?}",
                    self
                )))
            }
        };
        Ok(Some(bytes))
    }

    /// The abstract type `oid` maps to, if it's one of the ones in this
    /// table. Used to decode a Bind parameter per its statement-declared
    /// OID rather than guessing from the bytes alone.
    pub fn from_oid(oid: i32) -> Option<Type> {
        Some(match oid {
            20 => Type::Bigint,
            16 => Type::Bool,
            17 => Type::Bytes,
            23 => Type::Integer,
            25 => Type::Text,
            114 => Type::Json,
            701 => Type::Float,
            1082 => Type::Date,
            1083 => Type::Time,
            1114 => Type::Timestamp,
            1186 => Type::Interval,
            1700 => Type::Decimal,
            1007 => Type::IntegerArray,
            1009 => Type::StringArray,
            2277 => Type::Array,
            _ => return None,
        })
    }

    /// Decodes a Bind parameter sent in text format.
    pub fn decode_text(&self, bytes: &[u8]) -> Result<Value> {
        let s = std::str::from_utf8(bytes)
            .map_err(|e| PgError::protocol(format!("parameter is not valid utf-8: {}", e)))?;
        if let (Type::IntegerArray | Type::StringArray | Type::Array, true) =
            (self, s.starts_with('{') && s.ends_with('}'))
        {
            let inner = &s[1..s.len() - 1];
            let elem_ty = match self {
                Type::IntegerArray => Type::Integer,
                Type::StringArray => Type::Text,
                _ => Type::Text,
            };
            let elems = if inner.is_empty() {
                Vec::new()
            } else {
                inner
                    .split(',')
                    .map(|e| elem_ty.decode_text(e.as_bytes()))
                    .collect::<Result<Vec<_>>>()?
            };
            return Ok(Value::Array(elems));
        }
        Ok(match self {
            Type::Bool => Value::Bool(s.eq_ignore_ascii_case("true") || s == "t"),
            Type::Integer | Type::Bigint => Value::Int8(
                s.parse::<i64>()
                    .map_err(|e| PgError::protocol(format!("invalid integer parameter: {}", e)))?,
            ),
            Type::Float => Value::Float8(
                s.parse::<f64>()
                    .map_err(|e| PgError::protocol(format!("invalid float parameter: {}", e)))?,
            ),
            Type::Decimal => Value::Decimal(s.to_string()),
            Type::Bytes => Value::Bytes(decode_hex_field(s)?),
            Type::Date => Value::Date(
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| PgError::protocol(format!("invalid date parameter: {}", e)))?,
            ),
            Type::Time => Value::Time(
                NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                    .map_err(|e| PgError::protocol(format!("invalid time parameter: {}", e)))?,
            ),
            Type::Timestamp => Value::Timestamp(
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").map_err(|e| {
                    PgError::protocol(format!("invalid timestamp parameter: {}", e))
                })?,
            ),
            Type::Json => Value::Json(
                serde_json::from_str(s)
                    .map_err(|e| PgError::protocol(format!("invalid json parameter: {}", e)))?,
            ),
            _ => Value::Text(s.to_string()),
        })
    }

    /// Decodes a Bind parameter sent in binary format.
    pub fn decode_binary(&self, bytes: &[u8]) -> Result<Value> {
        Ok(match self {
            Type::Integer => {
                if bytes.len() != 4 {
                    return Err(PgError::protocol("bad binary integer parameter length"));
                }
                Value::Int8(BigEndian::read_i32(bytes) as i64)
            }
            Type::Bigint => {
                if bytes.len() != 8 {
                    return Err(PgError::protocol("bad binary bigint parameter length"));
                }
                Value::Int8(BigEndian::read_i64(bytes))
            }
            Type::Bool => {
                if bytes.len() != 1 {
                    return Err(PgError::protocol("bad binary bool parameter length"));
                }
                Value::Bool(bytes[0] != 0)
            }
            Type::Float => {
                if bytes.len() != 8 {
                    return Err(PgError::protocol("bad binary float parameter length"));
                }
                Value::Float8(BigEndian::read_f64(bytes))
            }
            Type::Text => Value::Text(
                std::str::from_utf8(bytes)
                    .map_err(|e| PgError::protocol(format!("parameter is not valid utf-8: {}", e)))?
                    .to_string(),
            ),
            Type::Bytes => Value::Bytes(bytes.to_vec()),
            Type::Date => {
                if bytes.len() != 4 {
                    return Err(PgError::protocol("bad binary date parameter length"));
                }
                let days = BigEndian::read_i32(bytes) as i64;
                Value::Date(pg_epoch() + chrono::Duration::days(days))
            }
            Type::Time => {
                if bytes.len() != 8 {
                    return Err(PgError::protocol("bad binary time parameter length"));
                }
                let micros = BigEndian::read_i64(bytes);
                Value::Time(
                    NaiveTime::MIN + chrono::Duration::microseconds(micros),
                )
            }
            Type::Timestamp => {
                if bytes.len() != 8 {
                    return Err(PgError::protocol("bad binary timestamp parameter length"));
                }
                let micros = BigEndian::read_i64(bytes);
                let epoch = NaiveDateTime::new(pg_epoch(), NaiveTime::MIN);
                Value::Timestamp(epoch + chrono::Duration::microseconds(micros))
            }
            _ => {
                return Err(PgError::backend(format!(
                    "unsupported binary decoding for type {:?}",
                    self
                )))
            }
        })
    }
}

fn decode_hex_field(s: &str) -> Result<Vec<u8>> {
    let hex = s.strip_prefix("\\x").ok_or_else(|| {
        PgError::protocol("bytea parameter must be \\x-prefixed hex")
    })?;
    if hex.len() % 2 != 0 {
        return Err(PgError::protocol("bytea parameter has odd hex length"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| PgError::protocol(format!("invalid hex byte: {}", e)))
        })
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn time_of_day_micros(t: &NaiveTime) -> i64 {
    let secs = t.num_seconds_from_midnight() as i64;
    let micros = (t.nanosecond() / 1_000) as i64;
    secs * 1_000_000 + micros
}

fn timestamp_micros_since_pg_epoch(ts: &NaiveDateTime) -> i64 {
    let epoch = NaiveDateTime::new(pg_epoch(), NaiveTime::MIN);
    let delta = *ts - epoch;
    delta.num_microseconds().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Interval;

    #[test]
    fn null_is_always_absent() {
        assert_eq!(Type::Integer.encode_text(&Value::Null), None);
        assert_eq!(Type::Integer.encode_binary(&Value::Null).unwrap(), None);
    }

    #[test]
    fn bool_text_encoding() {
        assert_eq!(
            Type::Bool.encode_text(&Value::Bool(true)).unwrap(),
            b"true"
        );
        assert_eq!(
            Type::Bool.encode_text(&Value::Bool(false)).unwrap(),
            b"false"
        );
    }

    #[test]
    fn bytes_text_is_hex_prefixed() {
        let v = Value::Bytes(vec![0xDE, 0xAD]);
        assert_eq!(Type::Bytes.encode_text(&v).unwrap(), b"\\xdead");
    }

    #[test]
    fn interval_text_format() {
        let v = Value::Interval(Interval {
            months: 0,
            days: 3,
            micros: 2_000_001,
        });
        assert_eq!(
            Type::Interval.encode_text(&v).unwrap(),
            b"3 days 2 seconds 1 microseconds"
        );
    }

    #[test]
    fn integer_array_text_format() {
        let v = Value::Array(vec![Value::Int8(1), Value::Int8(2), Value::Int8(3)]);
        assert_eq!(Type::IntegerArray.encode_text(&v).unwrap(), b"{1,2,3}");
    }

    #[test]
    fn integer_binary_round_trip() {
        let v = Value::Int8(42);
        let bytes = Type::Integer.encode_binary(&v).unwrap().unwrap();
        assert_eq!(bytes, 42i32.to_be_bytes());
    }

    #[test]
    fn json_binary_is_unsupported() {
        let v = Value::Json(serde_json::json!({"a": 1}));
        assert!(Type::Json.encode_binary(&v).is_err());
    }

    #[test]
    fn date_binary_is_days_since_2000() {
        let d = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        let bytes = Type::Date.encode_binary(&Value::Date(d)).unwrap().unwrap();
        assert_eq!(BigEndian::read_i32(&bytes), 1);
    }
}
