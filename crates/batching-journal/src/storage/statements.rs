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

//! SQL text for the journal and metadata tables
//!
//! Statements are rendered once from [`TableNaming`] (table names cannot be bound as
//! parameters). Select statements list columns in a fixed order and rows are read
//! positionally:
//!
//! | index | column         |
//! |-------|----------------|
//! | 0     | ordering       |
//! | 1     | persistence_id |
//! | 2     | sequence_nr    |
//! | 3     | is_deleted     |
//! | 4     | manifest       |
//! | 5     | timestamp      |
//! | 6     | payload        |
//! | 7     | tags           |

use crate::config::TableNaming;

/// Rendered statements (SQLite dialect)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalStatements {
    /// `CREATE TABLE IF NOT EXISTS` for events
    pub create_journal_table: String,
    /// Index backing tag scans by ordering
    pub create_ordering_index: String,
    /// `CREATE TABLE IF NOT EXISTS` for metadata markers, one row per persistence id
    pub create_metadata_table: String,
    /// Insert one event; binds pid, seq, is_deleted, manifest, timestamp, payload, tags
    pub insert_event: String,
    /// Highest seq across both tables; binds pid twice
    pub highest_sequence_nr: String,
    /// Events of one stream in range; binds pid, from, to
    pub select_by_persistence_id: String,
    /// Events by tag; binds from_offset, to_offset, like pattern, limit
    pub select_by_tag: String,
    /// Delete a stream prefix; binds pid, to
    pub delete_events_to: String,
    /// Insert or replace a metadata marker; binds pid, seq
    pub upsert_metadata: String,
    /// Distinct stream ids
    pub select_persistence_ids: String,
}

impl JournalStatements {
    /// Render every statement for the given naming
    pub fn new(naming: &TableNaming) -> Self {
        let j = &naming.journal_columns;
        let m = &naming.metadata_columns;
        let journal = &naming.journal_table;
        let metadata = &naming.metadata_table;

        let columns = format!(
            "{}, {}, {}, {}, {}, {}, {}, {}",
            j.ordering, j.persistence_id, j.sequence_nr, j.is_deleted, j.manifest, j.timestamp, j.payload, j.tags
        );

        Self {
            create_journal_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {journal} (
                    {ordering} INTEGER PRIMARY KEY AUTOINCREMENT,
                    {pid} TEXT NOT NULL,
                    {seq} INTEGER NOT NULL,
                    {deleted} INTEGER NOT NULL DEFAULT 0,
                    {manifest} TEXT NOT NULL,
                    {timestamp} INTEGER NOT NULL,
                    {payload} BLOB NOT NULL,
                    {tags} TEXT,
                    UNIQUE ({pid}, {seq})
                )
                "#,
                journal = journal,
                ordering = j.ordering,
                pid = j.persistence_id,
                seq = j.sequence_nr,
                deleted = j.is_deleted,
                manifest = j.manifest,
                timestamp = j.timestamp,
                payload = j.payload,
                tags = j.tags,
            ),
            create_ordering_index: format!(
                "CREATE INDEX IF NOT EXISTS idx_{journal}_{tags} ON {journal}({tags}, {ordering})",
                journal = journal,
                tags = j.tags,
                ordering = j.ordering,
            ),
            create_metadata_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {metadata} (
                    {pid} TEXT NOT NULL PRIMARY KEY,
                    {seq} INTEGER NOT NULL
                )
                "#,
                metadata = metadata,
                pid = m.persistence_id,
                seq = m.sequence_nr,
            ),
            insert_event: format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                journal, j.persistence_id, j.sequence_nr, j.is_deleted, j.manifest, j.timestamp, j.payload, j.tags
            ),
            highest_sequence_nr: format!(
                "SELECT MAX(u.seq) FROM (\
                 SELECT MAX({jseq}) AS seq FROM {journal} WHERE {jpid} = ? \
                 UNION \
                 SELECT MAX({mseq}) AS seq FROM {metadata} WHERE {mpid} = ?\
                 ) AS u",
                jseq = j.sequence_nr,
                journal = journal,
                jpid = j.persistence_id,
                mseq = m.sequence_nr,
                metadata = metadata,
                mpid = m.persistence_id,
            ),
            select_by_persistence_id: format!(
                "SELECT {columns} FROM {journal} WHERE {pid} = ? AND {seq} >= ? AND {seq} <= ? ORDER BY {seq}",
                columns = columns,
                journal = journal,
                pid = j.persistence_id,
                seq = j.sequence_nr,
            ),
            select_by_tag: format!(
                "SELECT {columns} FROM {journal} WHERE {ordering} > ? AND {ordering} <= ? \
                 AND {tags} LIKE ? ESCAPE '\\' ORDER BY {ordering} LIMIT ?",
                columns = columns,
                journal = journal,
                ordering = j.ordering,
                tags = j.tags,
            ),
            delete_events_to: format!(
                "DELETE FROM {} WHERE {} = ? AND {} <= ?",
                journal, j.persistence_id, j.sequence_nr
            ),
            upsert_metadata: format!(
                "INSERT OR REPLACE INTO {} ({}, {}) VALUES (?, ?)",
                metadata, m.persistence_id, m.sequence_nr
            ),
            select_persistence_ids: format!(
                "SELECT DISTINCT {} FROM {}",
                j.persistence_id, journal
            ),
        }
    }
}
