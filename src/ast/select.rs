use super::{Cte, Fragment, GroupBy, LockMode, OrderBy, Value};

/// A fully composed SELECT statement, ready for [`crate::visitor`].
#[derive(Debug, Clone, Default)]
pub struct Select {
    pub ctes: Vec<Cte>,
    pub table: String,
    pub columns: Vec<String>,
    pub distinct: bool,
    pub distinct_on: Vec<String>,
    pub wheres: Vec<Fragment>,
    pub args: Vec<Value>,
    pub group_bys: Vec<GroupBy>,
    pub havings: Vec<Fragment>,
    pub having_args: Vec<Value>,
    pub order_bys: Vec<OrderBy>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub lock_mode: Option<LockMode>,
}

impl Select {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn value(mut self, column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self
    }
}
