use super::{Fragment, Value};

/// A fully composed UPDATE statement.
#[derive(Debug, Clone, Default)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    pub wheres: Vec<Fragment>,
    pub args: Vec<Value>,
    /// Pre-rendered `CASE ... END`-style assignment used by
    /// `update_many_by_key`; when set it replaces `assignments`.
    pub raw_assignment: Option<(String, Vec<Value>)>,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assignments.push((column.into(), value.into()));
        self
    }
}
