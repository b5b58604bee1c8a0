//! SQLite-backed [`KvStore`].
//!
//! Each transaction pins one pooled connection and opens it with
//! `BEGIN IMMEDIATE`, so writers are serialized by SQLite's write lock and
//! readers inside a transaction never see a torn state. Lock contention that
//! outlasts the busy timeout is reported as [`StoreError::Conflict`], which
//! the engine retries.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite};
use tracing::debug;

use stepledger_core::errors::StoreError;
use stepledger_core::store::{KvPair, KvStore, KvTransaction};

use crate::DbPool;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Clone)]
pub struct SqliteKvStore {
    pool: DbPool,
}

impl SqliteKvStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(store_error)?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.map_err(store_error)?;
        Ok(Box::new(SqliteKvTransaction { conn, open: true }))
    }
}

struct SqliteKvTransaction {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

#[async_trait]
impl KvTransaction for SqliteKvTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(store_error)?;
        Ok(row.map(|row| row.get::<Vec<u8>, _>("value")))
    }

    async fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.conn)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&mut *self.conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn scan_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<KvPair>, StoreError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let rows = match prefix_upper_bound(prefix) {
            Some(upper) => {
                sqlx::query(
                    "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key LIMIT ?",
                )
                .bind(prefix)
                .bind(upper)
                .bind(limit)
                .fetch_all(&mut *self.conn)
                .await
            }
            None => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ? ORDER BY key LIMIT ?")
                    .bind(prefix)
                    .bind(limit)
                    .fetch_all(&mut *self.conn)
                    .await
            }
        }
        .map_err(store_error)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<Vec<u8>, _>("key"), row.get::<Vec<u8>, _>("value")))
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await.map_err(store_error)?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteKvTransaction {
    fn drop(&mut self) {
        if self.open {
            // Closing the connection rolls the open transaction back.
            debug!(event_name = "db.kv.rollback", "discarding uncommitted transaction");
            self.conn.close_on_drop();
        }
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

fn store_error(error: sqlx::Error) -> StoreError {
    if is_lock_contention(&error) {
        StoreError::Conflict
    } else {
        StoreError::Backend(error.to_string())
    }
}

fn is_lock_contention(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = error else {
        return false;
    };
    db_error
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}
