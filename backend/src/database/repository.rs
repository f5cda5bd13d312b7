use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use tracing::{debug, info};

use super::models::*;
use super::store::{format_duration, Storage, StorageTx, StoreError, TaskStore};

const TASK_COLUMNS: &str = r#"
    id, enabled, running, panicked, cron, cursor, config, auxiliary_data,
    last_run_duration_seconds
"#;

const FIND_TOKENS_SQL: &str = r#"
    SELECT id, network_id, address, kind, name, symbol, decimals, status,
           constituent_a, constituent_b
    FROM tokens
    WHERE network_id = $1 AND address = ANY($2)
"#;

/// PostgreSQL-backed storage sharing one connection pool across all tasks.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn execute_for_task(&self, id: &str, sql: &str) -> Result<(), StoreError> {
        let result = sqlx::query(sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Registers a network row so tokens can reference it.
    pub async fn ensure_network(&self, id: i64, name: &str, chain_id: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO networks (id, name, chain_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, chain_id = EXCLUDED.chain_id
            "#)
            .bind(id)
            .bind(name)
            .bind(chain_id as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn token_from_row(row: &sqlx::postgres::PgRow) -> Result<Token, StoreError> {
    let address: String = row.try_get("address")?;
    let address = Address::from_str(&address)
        .map_err(|e| StoreError::Corrupt(format!("token address {}: {}", address, e)))?;

    Ok(Token {
        id: row.try_get("id")?,
        network_id: row.try_get("network_id")?,
        address,
        kind: row.try_get("kind")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        decimals: row.try_get("decimals")?,
        status: row.try_get("status")?,
        constituent_a: row.try_get("constituent_a")?,
        constituent_b: row.try_get("constituent_b")?,
    })
}

#[async_trait]
impl TaskStore for PgStorage {
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = sqlx::query_as::<_, TaskRecord>(&format!("SELECT {} FROM tasks ORDER BY id", TASK_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<TaskRecord, StoreError> {
        sqlx::query_as::<_, TaskRecord>(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    async fn ensure_task(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (id, enabled, running, panicked, cron, cursor, config, auxiliary_data)
            VALUES ($1, $2, false, false, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#)
            .bind(&record.id)
            .bind(record.enabled)
            .bind(&record.cron)
            .bind(record.cursor)
            .bind(&record.config)
            .bind(&record.auxiliary_data)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            info!("Seeded task row: {}", record.id);
        }
        Ok(inserted)
    }

    async fn reset_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE tasks SET running = false, panicked = false")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_running(&self, id: &str) -> Result<(), StoreError> {
        self.execute_for_task(id, "UPDATE tasks SET running = true WHERE id = $1").await
    }

    async fn finish_run(&self, id: &str, duration_seconds: f64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tasks SET running = false, last_run_duration_seconds = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(format_duration(duration_seconds))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), StoreError> {
        self.execute_for_task(id, "UPDATE tasks SET running = false WHERE id = $1").await
    }

    async fn mark_panicked(&self, id: &str) -> Result<(), StoreError> {
        self.execute_for_task(
            id,
            "UPDATE tasks SET running = false, panicked = true, enabled = false WHERE id = $1",
        )
        .await
    }

    async fn clear_panicked(&self, id: &str) -> Result<(), StoreError> {
        self.execute_for_task(id, "UPDATE tasks SET panicked = false WHERE id = $1").await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_cron(&self, id: &str, cron: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET cron = $2 WHERE id = $1")
            .bind(id)
            .bind(cron)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStorageTx { tx: Some(tx) }))
    }

    async fn find_tokens(&self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_checksum(None)).collect();

        let rows = sqlx::query(FIND_TOKENS_SQL)
            .bind(network_id)
            .bind(&addresses)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(token_from_row).collect()
    }
}

/// Wraps a sqlx transaction; sqlx rolls back and returns the connection to the
/// pool when an unfinished transaction is dropped.
pub struct PgStorageTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgStorageTx {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl StorageTx for PgStorageTx {
    async fn find_tokens(&mut self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let addresses: Vec<String> = addresses.iter().map(|a| a.to_checksum(None)).collect();
        let tx = self.open()?;

        let rows = sqlx::query(FIND_TOKENS_SQL)
            .bind(network_id)
            .bind(&addresses)
            .fetch_all(&mut **tx)
            .await?;

        rows.iter().map(token_from_row).collect()
    }

    async fn insert_tokens(&mut self, tokens: &[NewToken]) -> Result<u64, StoreError> {
        let tx = self.open()?;
        let mut inserted = 0;

        for token in tokens {
            let result = sqlx::query(
                r#"
                INSERT INTO tokens (network_id, address, kind, name, symbol, decimals, status,
                                    constituent_a, constituent_b)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (network_id, address) DO NOTHING
                "#)
                .bind(token.network_id)
                .bind(token.address.to_checksum(None))
                .bind(token.kind)
                .bind(&token.name)
                .bind(&token.symbol)
                .bind(token.decimals)
                .bind(token.status)
                .bind(token.constituent_a)
                .bind(token.constituent_b)
            .execute(&mut **tx)
            .await?;

            inserted += result.rows_affected();
        }

        debug!("Inserted {}/{} tokens", inserted, tokens.len());
        Ok(inserted)
    }

    async fn save_cursor(&mut self, task_id: &str, cursor: i64) -> Result<(), StoreError> {
        let tx = self.open()?;
        let result = sqlx::query("UPDATE tasks SET cursor = $2 WHERE id = $1")
            .bind(task_id)
            .bind(cursor)
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn save_auxiliary_data(&mut self, task_id: &str, data: Value) -> Result<(), StoreError> {
        let tx = self.open()?;
        let result = sqlx::query("UPDATE tasks SET auxiliary_data = $2 WHERE id = $1")
            .bind(task_id)
            .bind(data)
            .execute(&mut **tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}
