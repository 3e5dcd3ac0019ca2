pub mod error;

pub use error::{PgError, Result};
