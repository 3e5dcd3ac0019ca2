/// The encoding format for a value, requested per-column in Bind and
/// reported per-column in RowDescription.
///
/// See the ["Formats and Format Codes"][pgdocs] section of the PostgreSQL
/// protocol documentation for details on the available formats.
///
/// [pgdocs]:
/// https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// Text encoding (format code 0).
    Text,
    /// Binary encoding (format code 1).
    Binary,
}

impl From<i16> for Format {
    /// Any nonzero code is binary, matching how PostgreSQL itself treats
    /// format codes beyond 0/1 in Bind's parameter/result format arrays.
    fn from(code: i16) -> Format {
        if code == 0 { Format::Text } else { Format::Binary }
    }
}

impl From<Format> for i16 {
    fn from(format: Format) -> i16 {
        match format {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}
