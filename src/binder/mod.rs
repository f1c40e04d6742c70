//! Result Binder: column → field mapping, row scanning,
//! and type coercion.

pub mod cache;
pub mod coerce;

pub use cache::ColumnMapCache;

use crate::ast::Value;
use crate::error::{Error, ErrorKind, Name};
use crate::schema::{Entity, Schema};
use std::any::TypeId;
use std::sync::Arc;

/// One row as handed back by a [`crate::connector::Queryable`]: column
/// names alongside their (already-driver-decoded) values, in result
/// order. This is the seam a real driver integration plugs into.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.iter().position(|c| c == column).map(|i| &self.values[i])
    }
}

/// Scans rows into entities, reusing a destination buffer and the
/// column-mapping cache across calls.
pub struct Binder {
    cache: Arc<ColumnMapCache>,
}

impl Binder {
    pub fn new(cache: Arc<ColumnMapCache>) -> Self {
        Self { cache }
    }

    /// Scan one row into a fresh `T`, coercing each mapped column.
    pub fn scan_row<T: Entity + Default>(&self, schema: &Schema, row: &Row) -> crate::Result<T> {
        let mapping = self.cache.get_or_compute(TypeId::of::<T>(), schema, &row.columns);

        let mut entity = T::default();
        // Reused destination buffer: one slot per column, populated in
        // column order before any field is written, so a coercion
        // failure on a later column never leaves the entity partially
        // mutated with a value that hasn't been validated.
        let mut staged: Vec<Option<(&str, Value)>> = Vec::with_capacity(row.columns.len());

        for (col_idx, field_idx) in mapping.iter().enumerate() {
            let Some(field_idx) = field_idx else {
                staged.push(None);
                continue;
            };
            let field = &schema.fields[*field_idx];
            let raw = &row.values[col_idx];
            let coerced = coerce::coerce(raw, field.kind, field.nullable, &field.column_name)?;
            staged.push(Some((field.column_name.as_str(), coerced)));
        }

        for slot in staged.into_iter().flatten() {
            entity.set_field(slot.0, slot.1)?;
        }

        Ok(entity)
    }

    /// Scan every row in `rows` into a sequence of `T`, pre-sizing the
    /// destination vector to `size_hint` (the query's `LIMIT`, or 64
    /// by default) to reduce reallocation.
    pub fn scan_rows<T: Entity + Default>(
        &self,
        schema: &Schema,
        rows: &[Row],
        size_hint: Option<usize>,
    ) -> crate::Result<Vec<T>> {
        let mut out = Vec::with_capacity(size_hint.unwrap_or(64).min(rows.len().max(1)));
        for row in rows {
            out.push(self.scan_row(schema, row)?);
        }
        Ok(out)
    }

    /// Scan a single-column projection (`pluck`) into an explicit
    /// optional scalar, preferring a strongly-typed `Option` over the
    /// driver's raw null representation.
    pub fn pluck_column(&self, column: &str, rows: &[Row]) -> crate::Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value = row.get(column).cloned().ok_or_else(|| {
                Error::new(ErrorKind::ColumnNotFound { column: Name::available(column) }).with_operation("pluck")
            })?;
            out.push(if value.is_null() { None } else { Some(value) });
        }
        Ok(out)
    }
}
