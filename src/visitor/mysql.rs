use super::Visitor;
use crate::identifier::Dialect;

/// MySQL emission: `?` placeholders pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mysql;

impl Visitor for Mysql {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }
}
