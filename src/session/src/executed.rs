use backend::QueryResult;
use pgrepr::Format;

/// A column's name and abstract type, as reported by `QueryResult::column`,
/// snapshotted so it outlives the result itself (needed when a Describe
/// caches the result for a later Execute to consume).
#[derive(Debug, Clone)]
pub struct ColumnDescription {
    pub name: String,
    pub ty: pgrepr::Type,
}

/// The result of one `Context::execute_sql`/`execute_portal` call, with its
/// result-format vector already padded or broadcast to match the column
/// count.
pub struct Executed {
    pub result: Box<dyn QueryResult>,
    pub formats: Vec<Format>,
    /// A row pulled ahead of schedule to answer "is there more after this
    /// row-limited batch?" (`PortalSuspended`); `next_row` drains this
    /// before going back to `result`.
    pending: Option<Vec<pgrepr::Value>>,
}

impl Executed {
    pub(crate) fn new(result: Box<dyn QueryResult>, requested: Vec<Format>) -> Executed {
        let formats = pad_formats(requested, result.column_count());
        Executed {
            result,
            formats,
            pending: None,
        }
    }

    /// Pulls the next row, preferring one stashed by a prior [`Self::has_more`]
    /// check over pulling a fresh one from the underlying result.
    pub fn next_row(&mut self) -> Option<Vec<pgrepr::Value>> {
        self.pending.take().or_else(|| self.result.next_row())
    }

    /// Pulls one row ahead of schedule and stashes it, returning whether the
    /// result set has anything left. Idempotent: calling it again before the
    /// stashed row is consumed just reports the same answer.
    pub fn has_more(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        self.pending = self.result.next_row();
        self.pending.is_some()
    }

    /// The result format for `column`, per the padding/broadcast rule: an
    /// empty request means all-text, a short request broadcasts its first
    /// entry to the remaining columns.
    pub fn format_for(&self, column: usize) -> Format {
        self.formats.get(column).copied().unwrap_or(Format::Text)
    }

    pub fn columns(&self) -> Vec<ColumnDescription> {
        (0..self.result.column_count())
            .filter_map(|i| {
                self.result
                    .column(i)
                    .map(|(name, ty)| ColumnDescription {
                        name: name.to_string(),
                        ty,
                    })
            })
            .collect()
    }
}

fn pad_formats(requested: Vec<Format>, column_count: usize) -> Vec<Format> {
    if column_count == 0 {
        return Vec::new();
    }
    if requested.is_empty() {
        return vec![Format::Text; column_count];
    }
    let broadcast = requested[0];
    let mut formats = requested;
    formats.resize(column_count, broadcast);
    formats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_request_is_all_text() {
        assert_eq!(pad_formats(vec![], 3), vec![Format::Text; 3]);
    }

    #[test]
    fn short_request_broadcasts_first_entry() {
        assert_eq!(
            pad_formats(vec![Format::Binary], 3),
            vec![Format::Binary, Format::Binary, Format::Binary]
        );
    }

    #[test]
    fn exact_length_request_passes_through() {
        let req = vec![Format::Text, Format::Binary];
        assert_eq!(pad_formats(req.clone(), 2), req);
    }
}
