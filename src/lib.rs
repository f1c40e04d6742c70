//! A relational object-mapping and query-composition layer for SQL
//! databases.
//!
//! The crate is organized as a stack of independently testable layers:
//!
//! - [`schema`] — the entity introspection registry (`Entity::describe`).
//! - [`ast`] — the composable SQL statement AST (`Select`/`Insert`/
//!   `Update`/`Delete`/`Value`).
//! - [`identifier`] — identifier whitelisting and placeholder rebinding.
//! - [`visitor`] — dialect-specific SQL emission.
//! - [`binder`] — driver row → entity scanning and coercion.
//! - [`connector`] — the `Queryable`/`Transaction` driver seam and
//!   connection configuration.
//! - [`statement_cache`] — a bounded cache for prepared statement handles.
//! - [`router`] — primary/replica read routing.
//! - [`transaction`] — panic-safe transaction scopes.
//! - [`dirty`] — change tracking for partial updates.
//! - [`relations`] — eager-load planning and batching.
//! - [`hooks`] — entity lifecycle callbacks.
//! - [`query`] — the fluent, per-entity query builder.
//! - [`executor`] — terminal operations (`create`/`update`/`delete`/
//!   `find`/aggregates/cursors) bound to a query.
//! - [`mock`] (behind `test-support`) — an in-process `Queryable` for
//!   downstream crates' own tests.
//!
//! None of these layers open a socket or speak a wire protocol —
//! `connector::Queryable` is the boundary a real database driver
//! integration implements.

pub mod ast;
pub mod binder;
pub mod connector;
pub mod dirty;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod identifier;
pub mod prelude;
pub mod query;
pub mod relations;
pub mod router;
pub mod schema;
pub mod statement_cache;
pub mod transaction;
pub mod visitor;

#[cfg(feature = "test-support")]
pub mod mock;

pub use error::{Error, ErrorKind, Result};
