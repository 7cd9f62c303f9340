// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! SQLite journal storage
//!
//! ## Purpose
//! Stores events in SQLite through an sqlx connection pool. Suitable for single-node
//! and edge deployments.
//!
//! ## Connection Strings
//! - `:memory:` - private in-memory database; the pool keeps exactly one connection
//!   open for its whole lifetime so the database survives between chunks
//! - `sqlite:...` - passed to sqlx unchanged
//! - anything else - a file path (created if missing, WAL mode)
//!
//! ## Error Classification
//! Statement-level failures (constraint violations, decode errors, missing rows) map to
//! `JournalError::Storage`; everything else (I/O, pool timeouts, closed pool) maps to
//! `JournalError::Connection` and is treated as an infrastructure failure.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::{tag_like_pattern, EventRow, JournalStatements, StorageDriver, StorageSession, StoredEvent};
use crate::config::BatchingJournalConfig;
use crate::{JournalError, JournalResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn classify(err: sqlx::Error) -> JournalError {
    match err {
        sqlx::Error::Database(_)
        | sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => JournalError::Storage(err.to_string()),
        other => JournalError::Connection(other.to_string()),
    }
}

fn decode_event(row: &SqliteRow) -> JournalResult<StoredEvent> {
    Ok(StoredEvent {
        ordering: row.try_get(0).map_err(classify)?,
        persistence_id: row.try_get(1).map_err(classify)?,
        sequence_nr: row.try_get(2).map_err(classify)?,
        is_deleted: row.try_get(3).map_err(classify)?,
        manifest: row.try_get(4).map_err(classify)?,
        timestamp: row.try_get(5).map_err(classify)?,
        payload: row.try_get(6).map_err(classify)?,
        tags: row.try_get(7).map_err(classify)?,
    })
}

/// SQLite storage driver
///
/// ## Example
/// ```rust,no_run
/// use plexspaces_batching_journal::*;
///
/// # async fn example() -> JournalResult<()> {
/// let config = BatchingJournalConfig::builder()
///     .connection_string("/tmp/journal.db")
///     .auto_initialize(true)
///     .build();
/// let driver = SqliteStorageDriver::connect(&config).await?;
/// let journal = BatchingJournal::builder(config, driver).start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteStorageDriver {
    pool: SqlitePool,
    statements: Arc<JournalStatements>,
}

impl SqliteStorageDriver {
    /// Open a pool for `config.connection_string`
    ///
    /// ## Errors
    /// - `JournalError::Configuration` for a malformed connection string
    /// - `JournalError::Connection` if the database cannot be opened
    pub async fn connect(config: &BatchingJournalConfig) -> JournalResult<Self> {
        config.naming.validate()?;

        let pool = if config.connection_string == ":memory:" {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| JournalError::Configuration(e.to_string()))?;
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            let options = if config.connection_string.starts_with("sqlite:") {
                SqliteConnectOptions::from_str(&config.connection_string)
                    .map_err(|e| JournalError::Configuration(e.to_string()))?
            } else {
                SqliteConnectOptions::new().filename(&config.connection_string)
            };
            let options = options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT);
            SqlitePoolOptions::new()
                .max_connections(u32::try_from(config.max_concurrent_operations).unwrap_or(u32::MAX))
                .connect_with(options)
                .await
        }
        .map_err(|e| JournalError::Connection(format!("Failed to connect to SQLite: {}", e)))?;

        tracing::debug!(connection_string = %config.connection_string, "sqlite journal pool opened");

        Ok(Self {
            pool,
            statements: Arc::new(JournalStatements::new(&config.naming)),
        })
    }

    /// Rendered statements in use
    pub fn statements(&self) -> &JournalStatements {
        &self.statements
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl StorageDriver for SqliteStorageDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> JournalResult<()> {
        for sql in [
            &self.statements.create_journal_table,
            &self.statements.create_ordering_index,
            &self.statements.create_metadata_table,
        ] {
            sqlx::query(sql).execute(&self.pool).await.map_err(classify)?;
        }
        Ok(())
    }

    async fn open_session(&self, transactional: bool) -> JournalResult<Box<dyn StorageSession>> {
        let handle = if transactional {
            SessionHandle::Transaction(self.pool.begin().await.map_err(classify)?)
        } else {
            SessionHandle::Connection(self.pool.acquire().await.map_err(classify)?)
        };
        Ok(Box::new(SqliteSession {
            handle,
            statements: self.statements.clone(),
        }))
    }

    async fn all_persistence_ids(&self) -> JournalResult<BTreeSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(&self.statements.select_persistence_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(ids.into_iter().collect())
    }
}

enum SessionHandle {
    Connection(PoolConnection<Sqlite>),
    Transaction(Transaction<'static, Sqlite>),
}

impl SessionHandle {
    fn conn(&mut self) -> &mut SqliteConnection {
        match self {
            SessionHandle::Connection(c) => &mut **c,
            SessionHandle::Transaction(t) => &mut **t,
        }
    }
}

struct SqliteSession {
    handle: SessionHandle,
    statements: Arc<JournalStatements>,
}

#[async_trait]
impl StorageSession for SqliteSession {
    fn is_transactional(&self) -> bool {
        matches!(self.handle, SessionHandle::Transaction(_))
    }

    async fn insert_event(&mut self, row: &EventRow) -> JournalResult<()> {
        sqlx::query(&self.statements.insert_event)
            .bind(row.persistence_id.as_str())
            .bind(row.sequence_nr)
            .bind(row.is_deleted)
            .bind(row.manifest.as_str())
            .bind(row.timestamp)
            .bind(row.payload.as_slice())
            .bind(row.tags.as_deref())
            .execute(self.handle.conn())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn highest_sequence_nr(&mut self, persistence_id: &str) -> JournalResult<i64> {
        let highest: Option<i64> = sqlx::query_scalar(&self.statements.highest_sequence_nr)
            .bind(persistence_id)
            .bind(persistence_id)
            .fetch_one(self.handle.conn())
            .await
            .map_err(classify)?;
        Ok(highest.unwrap_or(0))
    }

    async fn events_by_persistence_id<'a>(
        &'a mut self,
        persistence_id: &'a str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        let stream = sqlx::query(&self.statements.select_by_persistence_id)
            .bind(persistence_id)
            .bind(from_sequence_nr)
            .bind(to_sequence_nr)
            .fetch(self.handle.conn())
            .map(|row| row.map_err(classify).and_then(|row| decode_event(&row)))
            .boxed();
        Ok(stream)
    }

    async fn events_by_tag<'a>(
        &'a mut self,
        tag: &'a str,
        from_offset: i64,
        to_offset: i64,
        limit: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        let stream = sqlx::query(&self.statements.select_by_tag)
            .bind(from_offset)
            .bind(to_offset)
            .bind(tag_like_pattern(tag))
            .bind(limit)
            .fetch(self.handle.conn())
            .map(|row| row.map_err(classify).and_then(|row| decode_event(&row)))
            .boxed();
        Ok(stream)
    }

    async fn delete_events_to(&mut self, persistence_id: &str, to_sequence_nr: i64) -> JournalResult<u64> {
        let result = sqlx::query(&self.statements.delete_events_to)
            .bind(persistence_id)
            .bind(to_sequence_nr)
            .execute(self.handle.conn())
            .await
            .map_err(classify)?;
        Ok(result.rows_affected())
    }

    async fn upsert_metadata(&mut self, persistence_id: &str, sequence_nr: i64) -> JournalResult<()> {
        sqlx::query(&self.statements.upsert_metadata)
            .bind(persistence_id)
            .bind(sequence_nr)
            .execute(self.handle.conn())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> JournalResult<()> {
        match self.handle {
            SessionHandle::Transaction(tx) => tx.commit().await.map_err(classify),
            SessionHandle::Connection(_) => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> JournalResult<()> {
        match self.handle {
            SessionHandle::Transaction(tx) => tx.rollback().await.map_err(classify),
            SessionHandle::Connection(_) => Ok(()),
        }
    }
}
