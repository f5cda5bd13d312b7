//! Scoped storage transactions.
//!
//! [`TxScope`] owns one [`StorageTx`] for the length of a batch. It is finished
//! exactly once: [`TxScope::finish`] commits on `Ok` and rolls back on `Err`,
//! and a scope dropped without finishing (panic, early return, cancelled future)
//! falls back to the transaction's own rollback-on-drop. The pooled connection
//! is released on every one of those paths.

use tracing::{debug, warn};

use super::store::{Storage, StorageTx, StoreError};

pub struct TxScope {
    tx: Box<dyn StorageTx>,
    label: String,
    finished: bool,
}

impl TxScope {
    pub async fn begin(storage: &dyn Storage, label: impl Into<String>) -> Result<Self, StoreError> {
        let label = label.into();
        let tx = storage.begin().await?;
        debug!(scope = %label, "transaction opened");
        Ok(Self { tx, label, finished: false })
    }

    pub fn tx(&mut self) -> &mut dyn StorageTx {
        self.tx.as_mut()
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        match self.tx.commit().await {
            Ok(()) => {
                debug!(scope = %self.label, "transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(scope = %self.label, "commit failed, rolling back: {}", e);
                if let Err(rollback_err) = self.tx.rollback().await {
                    debug!(scope = %self.label, "rollback after failed commit: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.tx.rollback().await?;
        debug!(scope = %self.label, "transaction rolled back");
        Ok(())
    }

    /// Commits when `result` is `Ok`, rolls back otherwise, and hands `result`
    /// back. A rollback failure is logged; the run error is returned.
    pub async fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError> + std::fmt::Display,
    {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                let label = self.label.clone();
                if let Err(rollback_err) = self.rollback().await {
                    warn!(scope = %label, "rollback failed after error '{}': {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }
}

impl Drop for TxScope {
    fn drop(&mut self) {
        if !self.finished {
            warn!(scope = %self.label, "transaction dropped unfinished; rolling back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryStorage;
    use crate::database::models::TaskRecord;

    #[tokio::test]
    async fn test_finish_commits_on_ok() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "* * * * * *"));

        let mut scope = TxScope::begin(&storage, "test").await.unwrap();
        let result: Result<u32, StoreError> = async {
            scope.tx().save_cursor("job", 7).await?;
            Ok(1)
        }
        .await;
        assert_eq!(scope.finish(result).await.unwrap(), 1);

        assert_eq!(storage.task("job").unwrap().cursor, Some(7));
        assert_eq!(storage.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_finish_rolls_back_on_err() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "* * * * * *"));

        let mut scope = TxScope::begin(&storage, "test").await.unwrap();
        let result: Result<(), StoreError> = async {
            scope.tx().save_cursor("job", 7).await?;
            Err(StoreError::Unavailable("boom".to_string()))
        }
        .await;
        assert!(scope.finish(result).await.is_err());

        assert_eq!(storage.task("job").unwrap().cursor, None);
        assert_eq!(storage.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_transaction() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "* * * * * *"));

        {
            let mut scope = TxScope::begin(&storage, "test").await.unwrap();
            scope.tx().save_cursor("job", 3).await.unwrap();
            assert_eq!(storage.open_transactions(), 1);
        }

        assert_eq!(storage.task("job").unwrap().cursor, None);
        assert_eq!(storage.open_transactions(), 0);
    }
}
