//! Convenience re-exports for crates implementing entities against
//! this crate's `Query`/`Entity` API.
//!
//! ```ignore
//! use entity_query::prelude::*;
//! ```

pub use crate::ast::Value;
pub use crate::connector::{Queryable, ResultSet, Transaction};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::executor::{create, update, ExecutorContext};
pub use crate::hooks::Hooks;
pub use crate::query::Query;
pub use crate::schema::{Accessors, Entity, FieldDef, FieldKind, RelationsOf, Schema, SchemaBuilder};

#[cfg(feature = "test-support")]
pub use crate::mock::MockQueryable;
