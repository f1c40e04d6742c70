use super::{Fragment, Value};

/// A fully composed DELETE statement.
#[derive(Debug, Clone, Default)]
pub struct Delete {
    pub table: String,
    pub wheres: Vec<Fragment>,
    pub args: Vec<Value>,
}

impl Delete {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }
}
