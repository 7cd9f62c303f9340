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

//! Journal storage drivers
//!
//! ## Purpose
//! Defines the storage capability the chunk executor runs against: a [`StorageDriver`]
//! hands out one [`StorageSession`] per chunk, optionally wrapped in a transaction.
//!
//! ## Design Pattern
//! - Trait abstraction so the engine never sees SQL or connection types
//! - Row-level operations only; batching and response routing stay in the executor
//! - Feature-gated SQL backend, always-available memory backend
//!
//! ## Backends
//! - [`memory::MemoryStorageDriver`]: in-process tables with fault injection (testing)
//! - [`sqlite::SqliteStorageDriver`]: SQLite through sqlx (feature `sqlite-backend`)
//!
//! ## Tag Encoding
//! Tags are stored in a single column as `;tag1;tag2;` so a tag query is a
//! `LIKE '%;tag;%'` scan. A tag therefore must not contain the delimiter.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{BTreeSet, HashSet};

use crate::{JournalError, JournalResult};

pub mod memory;
pub mod statements;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

pub use statements::JournalStatements;

/// Separator between tags in the tag column
pub const TAG_DELIMITER: char = ';';

/// One row to insert into the journal table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    /// Stream id
    pub persistence_id: String,
    /// Position within the stream
    pub sequence_nr: i64,
    /// Logical delete flag
    pub is_deleted: bool,
    /// Serializer manifest
    pub manifest: String,
    /// Unix ms
    pub timestamp: i64,
    /// Serialized event
    pub payload: Vec<u8>,
    /// Encoded tag column (`None` when untagged)
    pub tags: Option<String>,
}

/// One row read back from the journal table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Store-assigned global ordering
    pub ordering: i64,
    /// Stream id
    pub persistence_id: String,
    /// Position within the stream
    pub sequence_nr: i64,
    /// Logical delete flag
    pub is_deleted: bool,
    /// Serializer manifest
    pub manifest: String,
    /// Unix ms
    pub timestamp: i64,
    /// Serialized event
    pub payload: Vec<u8>,
    /// Encoded tag column
    pub tags: Option<String>,
}

/// Storage backend capable of opening per-chunk sessions
///
/// ## Design Notes
/// - A driver is shared by every in-flight chunk (`Arc<dyn StorageDriver>`)
/// - `open_session(true)` must begin a transaction; `commit`/`rollback` end it
/// - Read-only chunks always get `open_session(false)`
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Create journal and metadata tables if missing
    async fn initialize(&self) -> JournalResult<()>;

    /// Open a session for one chunk
    ///
    /// ## Errors
    /// - `JournalError::Connection` if no connection can be acquired
    async fn open_session(&self, transactional: bool) -> JournalResult<Box<dyn StorageSession>>;

    /// Distinct persistence ids present in the journal table
    async fn all_persistence_ids(&self) -> JournalResult<BTreeSet<String>>;
}

/// One connection (and optionally one transaction) used by a single chunk
#[async_trait]
pub trait StorageSession: Send {
    /// Whether statements run inside a transaction
    fn is_transactional(&self) -> bool;

    /// Insert one event row
    ///
    /// ## Errors
    /// - `JournalError::Storage` on constraint violations, e.g. a duplicate
    ///   `(persistence_id, sequence_nr)`
    async fn insert_event(&mut self, row: &EventRow) -> JournalResult<()>;

    /// Highest sequence number across the journal and metadata tables (0 if none)
    async fn highest_sequence_nr(&mut self, persistence_id: &str) -> JournalResult<i64>;

    /// Rows of one stream with `from <= sequence_nr <= to`, ascending
    async fn events_by_persistence_id<'a>(
        &'a mut self,
        persistence_id: &'a str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>>;

    /// Rows carrying `tag` with `from_offset < ordering <= to_offset`, ascending, at most `limit`
    async fn events_by_tag<'a>(
        &'a mut self,
        tag: &'a str,
        from_offset: i64,
        to_offset: i64,
        limit: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>>;

    /// Delete rows of one stream with `sequence_nr <= to`; returns rows removed
    async fn delete_events_to(&mut self, persistence_id: &str, to_sequence_nr: i64) -> JournalResult<u64>;

    /// Record the highest sequence number of a fully deleted stream
    async fn upsert_metadata(&mut self, persistence_id: &str, sequence_nr: i64) -> JournalResult<()>;

    /// Commit (no-op for non-transactional sessions)
    async fn commit(self: Box<Self>) -> JournalResult<()>;

    /// Roll back (no-op for non-transactional sessions)
    async fn rollback(self: Box<Self>) -> JournalResult<()>;
}

fn validate_tag(tag: &str) -> JournalResult<()> {
    if tag.is_empty() {
        return Err(JournalError::InvalidTag {
            tag: tag.to_string(),
            reason: "tag must not be empty".to_string(),
        });
    }
    if tag.contains(TAG_DELIMITER) {
        return Err(JournalError::InvalidTag {
            tag: tag.to_string(),
            reason: format!("tag must not contain '{}'", TAG_DELIMITER),
        });
    }
    Ok(())
}

/// Encode tags as `;a;b;` (`None` for no tags)
///
/// ## Errors
/// - `JournalError::InvalidTag` for an empty tag or one containing the delimiter
pub fn encode_tags<'a, I>(tags: I) -> JournalResult<Option<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut encoded = String::new();
    for tag in tags {
        validate_tag(tag)?;
        if encoded.is_empty() {
            encoded.push(TAG_DELIMITER);
        }
        encoded.push_str(tag);
        encoded.push(TAG_DELIMITER);
    }
    Ok(if encoded.is_empty() { None } else { Some(encoded) })
}

/// Decode a tag column back into tags
pub fn decode_tags(encoded: Option<&str>) -> HashSet<String> {
    encoded
        .map(|s| {
            s.split(TAG_DELIMITER)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `LIKE` pattern matching one tag, with `\` as escape character
pub fn tag_like_pattern(tag: &str) -> String {
    let mut pattern = String::with_capacity(tag.len() + 4);
    pattern.push('%');
    pattern.push(TAG_DELIMITER);
    for c in tag.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push(TAG_DELIMITER);
    pattern.push('%');
    pattern
}
