//! External interfaces: the `Queryable` seam a real driver
//! integration implements, plus the connection/cache configuration
//! structs this crate parses and hands to that external collaborator.
//!
//! Connection pool construction, socket handling, and driver-specific
//! wire protocols are explicitly out of scope — this module
//! only defines the boundary.

pub mod config;

pub use config::{CacheConfig, ConnectionInfo, RouterConfig};

use crate::ast::Value;
use crate::binder::Row;
use async_trait::async_trait;

/// One executed statement's effect on a write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub rows_affected: u64,
    pub last_insert_id: Option<Value>,
}

/// The boundary a concrete database driver integration implements.
/// Every method takes already-rebound SQL and a flat positional
/// argument list.
#[async_trait]
pub trait Queryable: Send + Sync {
    async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>>;

    async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet>;

    /// Begin a transaction, returning a nested `Queryable` bound to it.
    /// Implementations that don't support nesting may return an error.
    async fn begin(&self) -> crate::Result<Box<dyn Transaction>>;

    fn dialect(&self) -> crate::identifier::Dialect;
}

/// A `Queryable` bound to an open transaction.
#[async_trait]
pub trait Transaction: Queryable {
    async fn commit(self: Box<Self>) -> crate::Result<()>;
    async fn rollback(self: Box<Self>) -> crate::Result<()>;
}
