//! In-process mock [`Queryable`], feature-gated behind
//! `test-support` so downstream crates can exercise `get()`/`create()`/
//! `update()` against a full executor without a live database. Follows
//! the same shape as the `Stub`/`Recorder` fixtures scattered across
//! this crate's own `#[cfg(test)]` modules (see `executor::tests::Stub`,
//! `relations::pivot::tests::Recorder`): record what ran, return what
//! the test programmed.
//!
//! Driving a real integration suite against live Postgres/MySQL/SQLite
//! is a test-infrastructure concern this library doesn't bundle, so
//! this mock is the only `Queryable` this crate ships for downstream
//! tests.

use crate::ast::Value;
use crate::binder::Row;
use crate::connector::{Queryable, ResultSet, Transaction};
use crate::identifier::Dialect;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// One recorded `query`/`execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub args: Vec<Value>,
}

struct Inner {
    dialect: Dialect,
    executed: Mutex<Vec<ExecutedStatement>>,
    query_queue: Mutex<VecDeque<crate::Result<Vec<Row>>>>,
    execute_queue: Mutex<VecDeque<crate::Result<ResultSet>>>,
    default_rows: Mutex<Vec<Row>>,
    default_result: Mutex<ResultSet>,
}

impl Inner {
    async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
        self.executed.lock().push(ExecutedStatement { sql: sql.to_string(), args: args.to_vec() });
        match self.query_queue.lock().pop_front() {
            Some(result) => result,
            None => Ok(self.default_rows.lock().clone()),
        }
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
        self.executed.lock().push(ExecutedStatement { sql: sql.to_string(), args: args.to_vec() });
        match self.execute_queue.lock().pop_front() {
            Some(result) => result,
            None => Ok(self.default_result.lock().clone()),
        }
    }
}

/// A `Queryable` that never touches a real database: every `query`/
/// `execute` call is recorded, and answered from a FIFO queue of
/// programmed responses (falling back to a default once the queue is
/// drained). `begin()` hands back a [`MockTransaction`] sharing the
/// same recorder, so statements run inside a mocked transaction show
/// up in [`MockQueryable::executed`] too.
pub struct MockQueryable(Arc<Inner>);

impl MockQueryable {
    pub fn new(dialect: Dialect) -> Self {
        MockQueryable(Arc::new(Inner {
            dialect,
            executed: Mutex::new(Vec::new()),
            query_queue: Mutex::new(VecDeque::new()),
            execute_queue: Mutex::new(VecDeque::new()),
            default_rows: Mutex::new(Vec::new()),
            default_result: Mutex::new(ResultSet::default()),
        }))
    }

    /// Rows returned by every `query()` call once the programmed queue
    /// (see [`Self::push_query_result`]) is empty.
    pub fn with_default_rows(self, rows: Vec<Row>) -> Self {
        *self.0.default_rows.lock() = rows;
        self
    }

    /// The [`ResultSet`] returned by every `execute()` call once the
    /// programmed queue is empty — the usual way to fix a
    /// `last_insert_id` for `create()` tests.
    pub fn with_default_result(self, result: ResultSet) -> Self {
        *self.0.default_result.lock() = result;
        self
    }

    /// Queue one `query()` response; consumed in FIFO order ahead of
    /// the default.
    pub fn push_query_result(&self, rows: Vec<Row>) {
        self.0.query_queue.lock().push_back(Ok(rows));
    }

    pub fn push_query_error(&self, err: crate::Error) {
        self.0.query_queue.lock().push_back(Err(err));
    }

    /// Queue one `execute()` response; consumed in FIFO order ahead of
    /// the default.
    pub fn push_execute_result(&self, result: ResultSet) {
        self.0.execute_queue.lock().push_back(Ok(result));
    }

    pub fn push_execute_error(&self, err: crate::Error) {
        self.0.execute_queue.lock().push_back(Err(err));
    }

    /// Every statement run against this mock (and any transaction
    /// begun from it), in execution order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.0.executed.lock().clone()
    }

    pub fn clear_executed(&self) {
        self.0.executed.lock().clear();
    }
}

#[async_trait]
impl Queryable for MockQueryable {
    async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
        self.0.query(sql, args).await
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
        self.0.execute(sql, args).await
    }

    async fn begin(&self) -> crate::Result<Box<dyn Transaction>> {
        Ok(Box::new(MockTransaction { inner: self.0.clone() }))
    }

    fn dialect(&self) -> Dialect {
        self.0.dialect
    }
}

/// A transaction handle over a [`MockQueryable`]'s shared recorder.
/// `commit`/`rollback` never fail; both simply drop the handle. Use
/// [`MockQueryable::push_execute_error`] on the underlying mock ahead
/// of the statement you want a test's rollback path to react to.
pub struct MockTransaction {
    inner: Arc<Inner>,
}

#[async_trait]
impl Queryable for MockTransaction {
    async fn query(&self, sql: &str, args: &[Value]) -> crate::Result<Vec<Row>> {
        self.inner.query(sql, args).await
    }

    async fn execute(&self, sql: &str, args: &[Value]) -> crate::Result<ResultSet> {
        self.inner.execute(sql, args).await
    }

    async fn begin(&self) -> crate::Result<Box<dyn Transaction>> {
        Ok(Box::new(MockTransaction { inner: self.inner.clone() }))
    }

    fn dialect(&self) -> Dialect {
        self.inner.dialect
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn commit(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_executed_statements() {
        let mock = MockQueryable::new(Dialect::Postgres);
        mock.query("SELECT 1", &[]).await.unwrap();
        mock.execute("DELETE FROM x", &[Value::int32(1)]).await.unwrap();

        let executed = mock.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].sql, "SELECT 1");
        assert_eq!(executed[1].args, vec![Value::int32(1)]);
    }

    #[tokio::test]
    async fn queued_responses_drain_before_falling_back_to_default() {
        let mock = MockQueryable::new(Dialect::Postgres).with_default_rows(vec![Row { columns: vec!["id".into()], values: vec![Value::int32(0)] }]);
        mock.push_query_result(vec![Row { columns: vec!["id".into()], values: vec![Value::int32(1)] }]);

        let first = mock.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(first[0].values[0], Value::int32(1));

        let second = mock.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(second[0].values[0], Value::int32(0));
    }

    #[tokio::test]
    async fn transaction_shares_the_recorder_with_its_parent() {
        let mock = MockQueryable::new(Dialect::Postgres);
        let tx = mock.begin().await.unwrap();
        tx.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(mock.executed().len(), 1);
    }
}
