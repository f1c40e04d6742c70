use super::Value;

/// A fully composed INSERT statement (single- or multi-row).
#[derive(Debug, Clone, Default)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    /// One entry per row, each aligned positionally to `columns`.
    pub rows: Vec<Vec<Value>>,
    /// Column to read back via `RETURNING` (the primary key, usually).
    pub returning: Option<String>,
}

impl Insert {
    pub fn single_into(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let column = column.into();
        let value = value.into();
        if let Some(idx) = self.columns.iter().position(|c| c == &column) {
            if self.rows.is_empty() {
                self.rows.push(Vec::new());
            }
            if let Some(row) = self.rows.first_mut() {
                if row.len() <= idx {
                    row.resize(idx + 1, Value::Text(None));
                }
                row[idx] = value;
            }
        } else {
            let idx = self.columns.len();
            self.columns.push(column);
            if self.rows.is_empty() {
                self.rows.push(Vec::new());
            }
            if let Some(row) = self.rows.first_mut() {
                if row.len() <= idx {
                    row.resize(idx + 1, Value::Text(None));
                }
                row[idx] = value;
            }
        }
        self
    }
}
