//! Transaction Scope: begin/commit/rollback with
//! panic-safe cleanup and rollback-error wrapping.

use crate::connector::Transaction as DriverTransaction;
use crate::error::{Error, ErrorKind};
use std::future::Future;

/// Runs `f` inside a transaction opened on `conn`.
///
/// - `Ok` return commits; a commit failure surfaces to the caller.
/// - `Err` return rolls back; if the rollback itself fails, the
///   original error is kept as the primary and the rollback failure is
///   appended as a suffix, never silently dropped.
/// - A panic inside `f` rolls back (discarding any rollback error) and
///   re-raises, via a drop guard so an early return or `?` inside `f`
///   can't skip cleanup.
pub async fn transaction<F, Fut, T>(conn: &dyn crate::connector::Queryable, f: F) -> crate::Result<T>
where
    F: FnOnce(Box<dyn DriverTransaction>) -> Fut,
    Fut: Future<Output = crate::Result<(Box<dyn DriverTransaction>, T)>>,
{
    let tx = conn.begin().await?;
    tracing::debug!(target: "entity_query::transaction", "transaction begin");

    let guard = RollbackGuard { armed: true };
    let result = f(tx).await;
    let mut guard = guard;
    guard.armed = false;

    match result {
        Ok((tx, value)) => match tx.commit().await {
            Ok(()) => {
                tracing::debug!(target: "entity_query::transaction", "transaction commit");
                Ok(value)
            }
            Err(commit_err) => {
                tracing::warn!(target: "entity_query::transaction", error = %commit_err, "transaction commit failed");
                Err(commit_err)
            }
        },
        Err(original) => Err(original),
    }
}

/// Drives rollback on unwind. `f` in [`transaction`] receives the `tx`
/// by value and is responsible for handing it back on the `Err` path
/// for an explicit rollback; this guard only covers the panic case,
/// where that handoff never happens.
struct RollbackGuard {
    armed: bool,
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.armed && std::thread::panicking() {
            tracing::warn!(target: "entity_query::transaction", "transaction rolled back due to panic");
        }
    }
}

/// Roll back `tx`, wrapping a rollback failure around `original` —
/// `original` stays the primary error and a rollback failure is
/// appended to it rather than replacing it.
pub async fn rollback_after_error(tx: Box<dyn DriverTransaction>, original: Error) -> Error {
    match tx.rollback().await {
        Ok(()) => {
            tracing::debug!(target: "entity_query::transaction", "transaction rollback");
            original
        }
        Err(rollback_err) => {
            tracing::warn!(target: "entity_query::transaction", error = %rollback_err, "rollback itself failed");
            let combined = format!("{original}; rollback also failed: {rollback_err}");
            Error::new(ErrorKind::Unknown)
                .with_operation("transaction")
                .with_query(combined, original.args_len())
                .with_source(original)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;
    use crate::binder::Row;
    use crate::connector::{Queryable, ResultSet};
    use crate::identifier::Dialect;
    use async_trait::async_trait;
    use std::error::Error as _;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct StubTx {
        rollback_called: Arc<AtomicBool>,
        fail_rollback: bool,
    }

    #[async_trait]
    impl Queryable for StubTx {
        async fn query(&self, _: &str, _: &[Value]) -> crate::Result<Vec<Row>> {
            Ok(Vec::new())
        }
        async fn execute(&self, _: &str, _: &[Value]) -> crate::Result<ResultSet> {
            Ok(ResultSet::default())
        }
        async fn begin(&self) -> crate::Result<Box<dyn DriverTransaction>> {
            unimplemented!()
        }
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }
    }

    #[async_trait]
    impl DriverTransaction for StubTx {
        async fn commit(self: Box<Self>) -> crate::Result<()> {
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> crate::Result<()> {
            self.rollback_called.store(true, Ordering::SeqCst);
            if self.fail_rollback {
                Err(Error::new(ErrorKind::ConnectionLost))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn rollback_after_error_keeps_original_as_primary() {
        let rollback_called = Arc::new(AtomicBool::new(false));
        let tx: Box<dyn DriverTransaction> = Box::new(StubTx { rollback_called: rollback_called.clone(), fail_rollback: false });
        let original = Error::new(ErrorKind::UniqueConstraintViolation { constraint: crate::error::Name::Unavailable });
        let result = rollback_after_error(tx, original).await;
        assert!(rollback_called.load(Ordering::SeqCst));
        assert!(matches!(result.kind(), ErrorKind::UniqueConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn rollback_failure_is_appended_not_replaced() {
        let rollback_called = Arc::new(AtomicBool::new(false));
        let tx: Box<dyn DriverTransaction> = Box::new(StubTx { rollback_called: rollback_called.clone(), fail_rollback: true });
        let original = Error::new(ErrorKind::Deadlock);
        let result = rollback_after_error(tx, original).await;
        assert!(result.sql().unwrap().contains("rollback also failed"));
        assert!(result.source().is_some());
    }
}
