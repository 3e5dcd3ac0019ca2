/// A parsed-by-name statement recorded by `Parse`: its raw SQL text
/// (possibly carrying `$1..$N` placeholders) and the parameter-type OIDs the
/// client declared for it.
///
/// The empty name is the unnamed statement, silently overwritten by every
/// new `Parse` that targets it; `Context::add_statement` implements that by
/// simply inserting into the same map every other name uses.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub sql: String,
    pub param_oids: Vec<i32>,
}
