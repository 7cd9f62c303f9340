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

//! Configuration for the batching journal
//!
//! ## Purpose
//! One serde-friendly struct covering everything the journal consumes:
//! - Connection string for the storage driver
//! - Concurrency and batching limits
//! - Circuit breaker thresholds
//! - Table and column naming
//!
//! ## Usage Example
//!
//! ```rust
//! use plexspaces_batching_journal::config::*;
//! use std::time::Duration;
//!
//! // Defaults: 64 concurrent chunks, 100 requests per chunk, transactional writes
//! let config = BatchingJournalConfig::default();
//!
//! // File-backed journal that creates its tables on startup
//! let config = BatchingJournalConfig::builder()
//!     .connection_string("/var/lib/plexspaces/journal.db")
//!     .auto_initialize(true)
//!     .max_concurrent_operations(8)
//!     .max_batch_size(200)
//!     .call_timeout(Duration::from_secs(5))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use plexspaces_circuit_breaker::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{JournalError, JournalResult};

/// Batching journal configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingJournalConfig {
    /// Storage connection string (":memory:" for a private in-memory database)
    pub connection_string: String,

    /// Maximum number of chunks executing against storage at once
    pub max_concurrent_operations: usize,

    /// Maximum number of requests per chunk
    ///
    /// Larger chunks trade latency for throughput.
    pub max_batch_size: usize,

    /// Maximum number of buffered requests (`None` = unbounded)
    ///
    /// When full, new requests are answered with `JournalError::BufferOverflow`.
    pub max_buffer_size: Option<usize>,

    /// Create journal and metadata tables on startup
    pub auto_initialize: bool,

    /// Run each non-read-only chunk inside one transaction
    pub transactional: bool,

    /// Publish successfully executed requests on a broadcast channel
    pub publish_executed_requests: bool,

    /// Capacity of the executed-requests broadcast channel
    pub executed_requests_capacity: usize,

    /// Circuit breaker guarding chunk execution
    pub circuit_breaker: CircuitBreakerSettings,

    /// Table and column names
    pub naming: TableNaming,
}

impl Default for BatchingJournalConfig {
    fn default() -> Self {
        Self {
            connection_string: ":memory:".to_string(),
            max_concurrent_operations: 64,
            max_batch_size: 100,
            max_buffer_size: None,
            auto_initialize: false,
            transactional: true,
            publish_executed_requests: false,
            executed_requests_capacity: 1024,
            circuit_breaker: CircuitBreakerSettings::default(),
            naming: TableNaming::default(),
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive chunk failures before the breaker opens
    pub max_failures: u32,
    /// Upper bound for one chunk execution
    pub call_timeout: Duration,
    /// Time the breaker stays open before one trial chunk
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            call_timeout: Duration::from_secs(20),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerSettings {
    /// Breaker configuration with a single half-open trial call
    pub fn to_breaker_config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            max_failures: self.max_failures,
            call_timeout: self.call_timeout,
            reset_timeout: self.reset_timeout,
            success_threshold: 1,
            max_half_open_requests: 1,
        }
    }
}

/// Journal table columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalColumns {
    /// Store-assigned global ordering (auto increment)
    pub ordering: String,
    /// Stream id
    pub persistence_id: String,
    /// Position within the stream
    pub sequence_nr: String,
    /// Logical delete flag
    pub is_deleted: String,
    /// Serializer manifest
    pub manifest: String,
    /// Write time (unix ms)
    pub timestamp: String,
    /// Serialized payload
    pub payload: String,
    /// Delimited tag string (`;a;b;`)
    pub tags: String,
}

impl Default for JournalColumns {
    fn default() -> Self {
        Self {
            ordering: "ordering".to_string(),
            persistence_id: "persistence_id".to_string(),
            sequence_nr: "sequence_nr".to_string(),
            is_deleted: "is_deleted".to_string(),
            manifest: "manifest".to_string(),
            timestamp: "timestamp".to_string(),
            payload: "payload".to_string(),
            tags: "tags".to_string(),
        }
    }
}

/// Metadata table columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataColumns {
    /// Stream id
    pub persistence_id: String,
    /// Highest sequence number at the time of a full delete
    pub sequence_nr: String,
}

impl Default for MetadataColumns {
    fn default() -> Self {
        Self {
            persistence_id: "persistence_id".to_string(),
            sequence_nr: "sequence_nr".to_string(),
        }
    }
}

/// Table naming conventions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNaming {
    /// Event table
    pub journal_table: String,
    /// Metadata marker table
    pub metadata_table: String,
    /// Event table columns
    pub journal_columns: JournalColumns,
    /// Metadata table columns
    pub metadata_columns: MetadataColumns,
}

impl Default for TableNaming {
    fn default() -> Self {
        Self {
            journal_table: "event_journal".to_string(),
            metadata_table: "metadata".to_string(),
            journal_columns: JournalColumns::default(),
            metadata_columns: MetadataColumns::default(),
        }
    }
}

impl TableNaming {
    fn identifiers(&self) -> Vec<&str> {
        let j = &self.journal_columns;
        let m = &self.metadata_columns;
        vec![
            &self.journal_table,
            &self.metadata_table,
            &j.ordering,
            &j.persistence_id,
            &j.sequence_nr,
            &j.is_deleted,
            &j.manifest,
            &j.timestamp,
            &j.payload,
            &j.tags,
            &m.persistence_id,
            &m.sequence_nr,
        ]
    }

    /// Names are spliced into SQL text, so only plain identifiers are accepted
    pub fn validate(&self) -> JournalResult<()> {
        for name in self.identifiers() {
            let mut chars = name.chars();
            let valid_start = chars
                .next()
                .map(|c| c.is_ascii_alphabetic() || c == '_')
                .unwrap_or(false);
            if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(JournalError::Configuration(format!(
                    "invalid SQL identifier '{}'",
                    name
                )));
            }
        }
        if self.journal_table == self.metadata_table {
            return Err(JournalError::Configuration(
                "journal and metadata tables must differ".to_string(),
            ));
        }
        Ok(())
    }
}

impl BatchingJournalConfig {
    /// Create a new builder
    pub fn builder() -> BatchingJournalConfigBuilder {
        BatchingJournalConfigBuilder {
            config: BatchingJournalConfig::default(),
        }
    }

    /// Small limits, tables created on start, fast breaker
    ///
    /// Enables:
    /// - Auto-initialize
    /// - 4 concurrent chunks of up to 16 requests
    /// - 5s call timeout, 1s reset timeout
    pub fn for_testing() -> Self {
        Self::builder()
            .auto_initialize(true)
            .max_concurrent_operations(4)
            .max_batch_size(16)
            .call_timeout(Duration::from_secs(5))
            .reset_timeout(Duration::from_secs(1))
            .build()
    }

    /// Check limits and naming
    pub fn validate(&self) -> JournalResult<()> {
        if self.max_concurrent_operations == 0 {
            return Err(JournalError::Configuration(
                "max_concurrent_operations must be at least 1".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(JournalError::Configuration(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_buffer_size == Some(0) {
            return Err(JournalError::Configuration(
                "max_buffer_size must be at least 1 when set".to_string(),
            ));
        }
        if self.publish_executed_requests && self.executed_requests_capacity == 0 {
            return Err(JournalError::Configuration(
                "executed_requests_capacity must be at least 1".to_string(),
            ));
        }
        self.circuit_breaker
            .to_breaker_config("journal")
            .validate()
            .map_err(|e| JournalError::Configuration(e.to_string()))?;
        self.naming.validate()
    }
}

/// Builder for BatchingJournalConfig with fluent API
pub struct BatchingJournalConfigBuilder {
    config: BatchingJournalConfig,
}

impl BatchingJournalConfigBuilder {
    /// Set connection string
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.config.connection_string = connection_string.into();
        self
    }

    /// Set concurrent chunk limit
    pub fn max_concurrent_operations(mut self, max: usize) -> Self {
        self.config.max_concurrent_operations = max;
        self
    }

    /// Set per-chunk request limit
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.config.max_batch_size = max;
        self
    }

    /// Bound the request buffer
    pub fn max_buffer_size(mut self, max: usize) -> Self {
        self.config.max_buffer_size = Some(max);
        self
    }

    /// Create tables on startup
    pub fn auto_initialize(mut self, enabled: bool) -> Self {
        self.config.auto_initialize = enabled;
        self
    }

    /// Wrap write chunks in transactions
    pub fn transactional(mut self, enabled: bool) -> Self {
        self.config.transactional = enabled;
        self
    }

    /// Publish executed requests
    pub fn publish_executed_requests(mut self, enabled: bool) -> Self {
        self.config.publish_executed_requests = enabled;
        self
    }

    /// Consecutive failures before the breaker opens
    pub fn max_failures(mut self, max_failures: u32) -> Self {
        self.config.circuit_breaker.max_failures = max_failures;
        self
    }

    /// Upper bound for one chunk
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.call_timeout = timeout;
        self
    }

    /// Open-state duration before a trial chunk
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.circuit_breaker.reset_timeout = timeout;
        self
    }

    /// Table and column names
    pub fn naming(mut self, naming: TableNaming) -> Self {
        self.config.naming = naming;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BatchingJournalConfig {
        self.config
    }
}
