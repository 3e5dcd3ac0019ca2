//! Runtime payloads for the abstract types in [`crate::Type`].

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// A decoded (or about-to-be-encoded) column value.
///
/// `Value` deliberately has no `String`/`Bytes` distinction beyond what the
/// protocol cares about: a backend hands the core one of these per cell, and
/// the core's only job is turning it into wire bytes via [`crate::Type`]'s
/// encoders.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i64),
    Float8(f64),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Interval(Interval),
    Json(serde_json::Value),
    /// Arbitrary-precision numbers are carried as their canonical decimal
    /// text representation; nothing downstream of the wire needs to do
    /// arithmetic on them.
    Decimal(String),
    Text(String),
    Array(Vec<Value>),
}

/// A PostgreSQL interval: months, days, and microseconds kept separate
/// because `1 month` has no fixed number of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl Interval {
    /// Splits the interval's microsecond component into whole seconds and
    /// the remaining microseconds, matching the `D days S seconds U
    /// microseconds` text form.
    pub fn seconds_and_micros(&self) -> (i64, i64) {
        (self.micros / 1_000_000, self.micros.rem_euclid(1_000_000))
    }
}
