use super::Visitor;
use crate::identifier::Dialect;

/// PostgreSQL emission: only dialect that rebinds `?` to `$n` and only
/// dialect that honors `DISTINCT ON`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Visitor for Postgres {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}
