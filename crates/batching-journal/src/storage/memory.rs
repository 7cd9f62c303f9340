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

//! In-memory journal storage
//!
//! ## Purpose
//! Journal and metadata tables held in process memory, with the same semantics as the
//! SQL backend (unique `(persistence_id, sequence_nr)`, global ordering, metadata markers).
//! **NOT for production use** - data is lost when the driver is dropped.
//!
//! ## Design
//! - One `tokio::sync::Mutex` around both tables
//! - Non-transactional sessions lock per statement
//! - Transactional sessions hold the lock for their lifetime and write to a working copy,
//!   which replaces the shared tables on commit
//!
//! ## Fault Injection
//! Tests can make session opens fail, or make inserts for one persistence id fail with
//! a chosen error, to exercise rollback and infrastructure-failure paths.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{decode_tags, EventRow, StorageDriver, StorageSession, StoredEvent};
use crate::{JournalError, JournalResult};

#[derive(Debug, Default, Clone)]
struct MemoryTables {
    /// ordering -> row
    events: BTreeMap<i64, StoredEvent>,
    /// (persistence_id, sequence_nr) -> ordering
    index: BTreeMap<(String, i64), i64>,
    /// persistence_id -> marker
    metadata: HashMap<String, i64>,
    last_ordering: i64,
}

impl MemoryTables {
    fn insert(&mut self, row: &EventRow) -> JournalResult<()> {
        let key = (row.persistence_id.clone(), row.sequence_nr);
        if self.index.contains_key(&key) {
            return Err(JournalError::Storage(format!(
                "UNIQUE constraint failed: ({}, {})",
                row.persistence_id, row.sequence_nr
            )));
        }
        self.last_ordering += 1;
        let ordering = self.last_ordering;
        self.index.insert(key, ordering);
        self.events.insert(
            ordering,
            StoredEvent {
                ordering,
                persistence_id: row.persistence_id.clone(),
                sequence_nr: row.sequence_nr,
                is_deleted: row.is_deleted,
                manifest: row.manifest.clone(),
                timestamp: row.timestamp,
                payload: row.payload.clone(),
                tags: row.tags.clone(),
            },
        );
        Ok(())
    }

    fn highest(&self, persistence_id: &str) -> i64 {
        let journal = self
            .index
            .range((persistence_id.to_string(), i64::MIN)..=(persistence_id.to_string(), i64::MAX))
            .next_back()
            .map(|((_, seq), _)| *seq);
        let metadata = self.metadata.get(persistence_id).copied();
        journal.into_iter().chain(metadata).max().unwrap_or(0)
    }

    fn by_persistence_id(&self, persistence_id: &str, from: i64, to: i64) -> Vec<StoredEvent> {
        if from > to {
            return Vec::new();
        }
        self.index
            .range((persistence_id.to_string(), from)..=(persistence_id.to_string(), to))
            .filter_map(|(_, ordering)| self.events.get(ordering).cloned())
            .collect()
    }

    fn by_tag(&self, tag: &str, from_offset: i64, to_offset: i64, limit: i64) -> Vec<StoredEvent> {
        if from_offset >= to_offset || limit <= 0 {
            return Vec::new();
        }
        self.events
            .range(from_offset.saturating_add(1)..=to_offset)
            .map(|(_, event)| event)
            .filter(|event| decode_tags(event.tags.as_deref()).contains(tag))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    fn delete_to(&mut self, persistence_id: &str, to: i64) -> u64 {
        let doomed: Vec<(String, i64)> = self
            .index
            .range((persistence_id.to_string(), i64::MIN)..=(persistence_id.to_string(), to))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            if let Some(ordering) = self.index.remove(key) {
                self.events.remove(&ordering);
            }
        }
        doomed.len() as u64
    }

    fn upsert_metadata(&mut self, persistence_id: &str, sequence_nr: i64) {
        self.metadata.insert(persistence_id.to_string(), sequence_nr);
    }

    fn persistence_ids(&self) -> BTreeSet<String> {
        self.index.keys().map(|(pid, _)| pid.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct Faults {
    open_session: Option<JournalError>,
    inserts: HashMap<String, JournalError>,
}

/// In-memory storage driver (testing only)
///
/// ## Example
/// ```rust
/// use plexspaces_batching_journal::*;
///
/// # async fn example() -> JournalResult<()> {
/// let driver = MemoryStorageDriver::new();
/// let mut session = driver.open_session(false).await?;
/// assert_eq!(session.highest_sequence_nr("acct-1").await?, 0);
/// session.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageDriver {
    tables: Arc<Mutex<MemoryTables>>,
    faults: Arc<RwLock<Faults>>,
    session_opens: Arc<AtomicUsize>,
    initialized: Arc<AtomicBool>,
}

impl MemoryStorageDriver {
    /// Empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open_session` fail with `error` (`None` to clear)
    pub async fn fail_session_opens(&self, error: Option<JournalError>) {
        self.faults.write().await.open_session = error;
    }

    /// Make every insert for `persistence_id` fail with `error`
    pub async fn fail_inserts_for(&self, persistence_id: impl Into<String>, error: JournalError) {
        self.faults.write().await.inserts.insert(persistence_id.into(), error);
    }

    /// Clear every injected fault
    pub async fn clear_faults(&self) {
        *self.faults.write().await = Faults::default();
    }

    /// Number of sessions opened so far (including failed attempts)
    pub fn session_opens(&self) -> usize {
        self.session_opens.load(Ordering::SeqCst)
    }

    /// Whether `initialize` has been called
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Number of stored event rows
    pub async fn event_count(&self) -> usize {
        self.tables.lock().await.events.len()
    }
}

#[async_trait]
impl StorageDriver for MemoryStorageDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> JournalResult<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self, transactional: bool) -> JournalResult<Box<dyn StorageSession>> {
        self.session_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.faults.read().await.open_session {
            return Err(err.clone());
        }

        let tables = if transactional {
            let guard = self.tables.clone().lock_owned().await;
            let working = guard.clone();
            SessionTables::Transaction { guard, working }
        } else {
            SessionTables::Shared(self.tables.clone())
        };

        Ok(Box::new(MemorySession {
            tables,
            faults: self.faults.clone(),
        }))
    }

    async fn all_persistence_ids(&self) -> JournalResult<BTreeSet<String>> {
        Ok(self.tables.lock().await.persistence_ids())
    }
}

enum SessionTables {
    Shared(Arc<Mutex<MemoryTables>>),
    Transaction {
        guard: OwnedMutexGuard<MemoryTables>,
        working: MemoryTables,
    },
}

struct MemorySession {
    tables: SessionTables,
    faults: Arc<RwLock<Faults>>,
}

impl MemorySession {
    async fn with_tables<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut MemoryTables) -> R + Send,
        R: Send,
    {
        match &mut self.tables {
            SessionTables::Shared(tables) => {
                let mut tables = tables.lock().await;
                f(&mut tables)
            }
            SessionTables::Transaction { working, .. } => f(working),
        }
    }
}

#[async_trait]
impl StorageSession for MemorySession {
    fn is_transactional(&self) -> bool {
        matches!(self.tables, SessionTables::Transaction { .. })
    }

    async fn insert_event(&mut self, row: &EventRow) -> JournalResult<()> {
        if let Some(err) = self.faults.read().await.inserts.get(&row.persistence_id) {
            return Err(err.clone());
        }
        self.with_tables(|tables| tables.insert(row)).await
    }

    async fn highest_sequence_nr(&mut self, persistence_id: &str) -> JournalResult<i64> {
        Ok(self.with_tables(|tables| tables.highest(persistence_id)).await)
    }

    async fn events_by_persistence_id<'a>(
        &'a mut self,
        persistence_id: &'a str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        let rows = self
            .with_tables(|tables| tables.by_persistence_id(persistence_id, from_sequence_nr, to_sequence_nr))
            .await;
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn events_by_tag<'a>(
        &'a mut self,
        tag: &'a str,
        from_offset: i64,
        to_offset: i64,
        limit: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        let rows = self
            .with_tables(|tables| tables.by_tag(tag, from_offset, to_offset, limit))
            .await;
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn delete_events_to(&mut self, persistence_id: &str, to_sequence_nr: i64) -> JournalResult<u64> {
        Ok(self
            .with_tables(|tables| tables.delete_to(persistence_id, to_sequence_nr))
            .await)
    }

    async fn upsert_metadata(&mut self, persistence_id: &str, sequence_nr: i64) -> JournalResult<()> {
        self.with_tables(|tables| tables.upsert_metadata(persistence_id, sequence_nr))
            .await;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> JournalResult<()> {
        if let SessionTables::Transaction { mut guard, working } = self.tables {
            *guard = working;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> JournalResult<()> {
        Ok(())
    }
}
