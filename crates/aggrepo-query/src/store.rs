//! The store contract.
//!
//! A store is reached through a synchronous request/response call that can
//! fail. Every interaction happens inside a transaction obtained from
//! [`Store::begin`]; [`unit_of_work`] is the usual way to run one.

use crate::criteria::Criteria;
use aggrepo_core::{Result, Row, Value};
use std::collections::BTreeMap;

/// A backing store that hands out transactions.
pub trait Store: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &str {
        "store"
    }

    /// Begin a transaction.
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;
}

/// One open transaction against a [`Store`].
///
/// Dropping a transaction without calling `commit` rolls it back.
pub trait StoreTransaction {
    /// Select rows of `criteria`'s target table.
    fn query(&mut self, criteria: &Criteria) -> Result<Vec<Row>>;

    /// Count rows matching `criteria`, ignoring limit and offset.
    fn count(&mut self, criteria: &Criteria) -> Result<u64>;

    /// Insert a row. Returns the generated key value when the table has a
    /// store-generated key column that was not supplied.
    fn insert(&mut self, table: &str, values: &BTreeMap<String, Value>) -> Result<Option<Value>>;

    /// Update rows of `table` matching `filter`. Returns the affected row count.
    fn update(
        &mut self,
        table: &str,
        values: &BTreeMap<String, Value>,
        filter: &Criteria,
    ) -> Result<u64>;

    /// Delete rows of `table` matching `filter`. Returns the affected row count.
    fn delete(&mut self, table: &str, filter: &Criteria) -> Result<u64>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `work` inside one transaction.
///
/// Commits when `work` succeeds. When `work` (or the commit) fails the
/// transaction is rolled back, the failure is logged at error level and the
/// original error is returned.
#[tracing::instrument(level = "trace", skip(store, work), fields(store = store.name()))]
pub fn unit_of_work<T>(
    store: &dyn Store,
    label: &str,
    work: impl FnOnce(&mut dyn StoreTransaction) -> Result<T>,
) -> Result<T> {
    let mut tx = store.begin().inspect_err(|e| {
        tracing::error!(store = store.name(), unit = label, error = %e, "failed to begin transaction");
    })?;

    match work(tx.as_mut()) {
        Ok(value) => {
            tx.commit().inspect_err(|e| {
                tracing::error!(store = store.name(), unit = label, error = %e, "commit failed");
            })?;
            tracing::trace!(unit = label, "unit of work committed");
            Ok(value)
        }
        Err(e) => {
            tracing::error!(
                store = store.name(),
                unit = label,
                error = %e,
                "unit of work failed, rolling back"
            );
            if let Err(rollback_err) = tx.rollback() {
                tracing::error!(
                    store = store.name(),
                    unit = label,
                    error = %rollback_err,
                    "rollback failed"
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggrepo_core::{Error, StoreErrorKind};
    use std::sync::Mutex;

    /// Records which transaction calls were made.
    #[derive(Default)]
    struct ScriptedStore {
        log: Mutex<Vec<&'static str>>,
        fail_commit: bool,
    }

    struct ScriptedTx<'a> {
        store: &'a ScriptedStore,
    }

    impl Store for ScriptedStore {
        fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>> {
            self.log.lock().unwrap().push("begin");
            Ok(Box::new(ScriptedTx { store: self }))
        }
    }

    impl StoreTransaction for ScriptedTx<'_> {
        fn query(&mut self, _criteria: &Criteria) -> Result<Vec<Row>> {
            self.store.log.lock().unwrap().push("query");
            Ok(vec![])
        }
        fn count(&mut self, _criteria: &Criteria) -> Result<u64> {
            Ok(0)
        }
        fn insert(&mut self, _: &str, _: &BTreeMap<String, Value>) -> Result<Option<Value>> {
            Ok(None)
        }
        fn update(&mut self, _: &str, _: &BTreeMap<String, Value>, _: &Criteria) -> Result<u64> {
            Err(Error::store(StoreErrorKind::Query, "update refused"))
        }
        fn delete(&mut self, _: &str, _: &Criteria) -> Result<u64> {
            Ok(0)
        }
        fn commit(self: Box<Self>) -> Result<()> {
            self.store.log.lock().unwrap().push("commit");
            if self.store.fail_commit {
                return Err(Error::store(StoreErrorKind::Transaction, "commit refused"));
            }
            Ok(())
        }
        fn rollback(self: Box<Self>) -> Result<()> {
            self.store.log.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[test]
    fn commits_on_success() {
        let store = ScriptedStore::default();
        let rows = unit_of_work(&store, "read", |tx| tx.query(&Criteria::new())).unwrap();
        assert!(rows.is_empty());
        assert_eq!(*store.log.lock().unwrap(), vec!["begin", "query", "commit"]);
    }

    #[test]
    fn rolls_back_and_returns_the_error() {
        let store = ScriptedStore::default();
        let err = unit_of_work(&store, "write", |tx| {
            tx.update("t", &BTreeMap::new(), &Criteria::new())
        })
        .unwrap_err();
        assert!(err.is_store_error());
        assert_eq!(*store.log.lock().unwrap(), vec!["begin", "rollback"]);
    }

    #[test]
    fn commit_failure_is_reported() {
        let store = ScriptedStore {
            fail_commit: true,
            ..ScriptedStore::default()
        };
        let err = unit_of_work(&store, "read", |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Store(ref s) if s.kind == StoreErrorKind::Transaction));
    }
}
