//! Transaction scopes.
//!
//! [`in_transaction`] checks out one connection from an engine, issues
//! `BEGIN`, and publishes the connection in a task-local slot keyed by the
//! engine name for as long as the scope's future runs. Every statement the
//! engine executes from inside that future, however deeply nested, finds the
//! connection through [`current_connection`] and joins the transaction.
//!
//! On exit the scope commits when the future returned `Ok` and rolls back
//! otherwise. The slot is cleared and the connection released in both cases,
//! including when `COMMIT` itself fails. A scope that never gets to exit
//! (cancelled, timed out, panicked) discards its connection.
//!
//! Entering a second scope for the same engine inside an open one fails with
//! [`PostmodelError::TransactionManagementError`]; savepoints are not issued.
//! [`NestedTransaction`] marks where they would go.
//!
//! # Examples
//!
//! ```ignore
//! use postmodel_db::transactions::in_transaction;
//!
//! let db = pm.database("default")?;
//! in_transaction(db, || async {
//!     Book::objects().create(&pm, [("title", "Dune".into())]).await?;
//!     Ok(())
//! })
//! .await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use postmodel_core::logging::DB_TARGET;
use postmodel_core::{PostmodelError, PostmodelResult};

use crate::executor::{Database, TransactedConnection};

type ActiveTransactions = HashMap<String, Arc<dyn TransactedConnection>>;

tokio::task_local! {
    static ACTIVE: ActiveTransactions;
}

/// The transaction-scoped connection of `db_name` in the current task, if any.
pub fn current_connection(db_name: &str) -> Option<Arc<dyn TransactedConnection>> {
    ACTIVE
        .try_with(|active| active.get(db_name).cloned())
        .ok()
        .flatten()
}

/// Returns `true` if the current task is inside a transaction on `db_name`.
pub fn is_in_transaction(db_name: &str) -> bool {
    current_connection(db_name).is_some()
}

/// Runs `f` inside a transaction on `db`.
///
/// Commits if `f` resolves to `Ok`, rolls back if it resolves to `Err` and
/// returns that error. A rollback failure is logged and the original error
/// wins.
pub async fn in_transaction<F, Fut, T>(db: Arc<dyn Database>, f: F) -> PostmodelResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PostmodelResult<T>>,
{
    let name = db.name().to_string();
    if is_in_transaction(&name) {
        return Err(PostmodelError::TransactionManagementError(format!(
            "a transaction is already active on '{name}'; nested transactions are not supported"
        )));
    }

    let conn = db.begin().await?;
    let guard = ScopeGuard {
        conn: Arc::clone(&conn),
        db: name.clone(),
        armed: true,
    };
    let mut active = ACTIVE.try_with(Clone::clone).unwrap_or_default();
    active.insert(name.clone(), Arc::clone(&conn));

    let outcome = ACTIVE.scope(active, f()).await;
    let result = match outcome {
        Ok(value) => conn.commit().await.map(|()| value),
        Err(err) => {
            if let Err(rollback_err) = conn.rollback().await {
                tracing::warn!(target: DB_TARGET, db = %name, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    };
    conn.release().await;
    guard.disarm();
    tracing::debug!(target: DB_TARGET, db = %name, committed = result.is_ok(), "transaction finished");
    result
}

/// Discards the scope's connection unless the scope ran to completion.
///
/// The scope future can stop at any await point, for instance when a timeout
/// drops it or a panic unwinds through it. Such a stop never reaches
/// `COMMIT`/`ROLLBACK`, so the connection still has an open transaction and
/// must not go back to the pool.
struct ScopeGuard {
    conn: Arc<dyn TransactedConnection>,
    db: String,
    armed: bool,
}

impl ScopeGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(target: DB_TARGET, db = %self.db, "transaction scope abandoned; discarding its connection");
            self.conn.discard();
        }
    }
}

/// Placeholder for savepoint-based nesting.
///
/// Running through it executes `f` in whatever transaction is already active,
/// without a savepoint: an error inside still aborts the outer transaction
/// when it propagates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NestedTransaction;

impl NestedTransaction {
    /// Runs `f` as part of the enclosing transaction.
    pub async fn run<F, Fut, T>(self, f: F) -> PostmodelResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PostmodelResult<T>>,
    {
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDb;

    #[tokio::test]
    async fn test_commit_on_ok() {
        let db = MockDb::new("default");
        let value = in_transaction(db.clone(), || async {
            assert!(is_in_transaction("default"));
            assert!(!is_in_transaction("other"));
            Ok(5)
        })
        .await
        .unwrap();
        assert_eq!(value, 5);
        assert_eq!(db.statements(), vec!["BEGIN", "COMMIT", "RELEASE"]);
        assert!(!is_in_transaction("default"));
    }

    #[tokio::test]
    async fn test_rollback_on_err() {
        let db = MockDb::new("default");
        let err = in_transaction(db.clone(), || async {
            Err::<(), _>(PostmodelError::OperationalError("boom".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PostmodelError::OperationalError(_)));
        assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK", "RELEASE"]);
    }

    #[tokio::test]
    async fn test_statements_inside_scope_use_connection() {
        let db = MockDb::new("default");
        let inner = db.clone();
        in_transaction(db.clone(), || async move {
            crate::executor::DbExecutor::execute_sql(inner.as_ref(), "SELECT 1", &[]).await?;
            Ok::<_, PostmodelError>(())
        })
        .await
        .unwrap();
        assert_eq!(db.statements(), vec!["BEGIN", "[tx] SELECT 1", "COMMIT", "RELEASE"]);
    }

    #[tokio::test]
    async fn test_nested_scope_rejected() {
        let db = MockDb::new("default");
        let inner = db.clone();
        let err = in_transaction(db.clone(), || async move {
            in_transaction(inner, || async { Ok(()) }).await
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PostmodelError::TransactionManagementError(_)));
        assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK", "RELEASE"]);
    }

    #[tokio::test]
    async fn test_independent_engines_nest() {
        let a = MockDb::new("default");
        let b = MockDb::new("other");
        let b_inner = b.clone();
        in_transaction(a.clone(), || async move {
            in_transaction(b_inner, || async {
                assert!(is_in_transaction("default"));
                assert!(is_in_transaction("other"));
                Ok(())
            })
            .await
        })
        .await
        .unwrap();
        assert_eq!(b.statements(), vec!["BEGIN", "COMMIT", "RELEASE"]);
    }

    #[tokio::test]
    async fn test_cancelled_scope_discards_connection() {
        let db = MockDb::new("default");
        let inner = db.clone();
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            in_transaction(db.clone(), || async move {
                crate::executor::DbExecutor::execute_sql(inner.as_ref(), "INSERT", &[]).await?;
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok::<_, PostmodelError>(())
            }),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(db.statements(), vec!["BEGIN", "[tx] INSERT", "DISCARD"]);
        assert!(!is_in_transaction("default"));
    }

    #[tokio::test]
    async fn test_panicking_scope_discards_connection() {
        let db = MockDb::new("default");
        let scope = db.clone();
        let joined = tokio::spawn(async move {
            in_transaction(scope, || async {
                if is_in_transaction("default") {
                    panic!("inside transaction");
                }
                Ok(())
            })
            .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(db.statements(), vec!["BEGIN", "DISCARD"]);
    }

    #[tokio::test]
    async fn test_completed_scope_does_not_discard() {
        let db = MockDb::new("default");
        in_transaction(db.clone(), || async { Ok(()) }).await.unwrap();
        in_transaction(db.clone(), || async { Err::<(), _>(PostmodelError::OperationalError("x".into())) })
            .await
            .unwrap_err();
        assert!(!db.statements().iter().any(|s| s == "DISCARD"));
    }

    #[tokio::test]
    async fn test_nested_transaction_is_passthrough() {
        let value = NestedTransaction.run(|| async { Ok(1) }).await.unwrap();
        assert_eq!(value, 1);
    }
}
