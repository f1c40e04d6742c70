use super::Visitor;
use crate::identifier::Dialect;

/// SQLite emission: `?` placeholders pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Visitor for Sqlite {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}
