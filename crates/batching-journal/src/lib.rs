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

//! # PlexSpaces Batching Journal
//!
//! ## Purpose
//! Write-ahead event journal for persistent actors. Accepts events, appends them to a
//! relational store in batches, replays them in order, and notifies subscribers when
//! streams, tags or the set of known persistence ids change.
//!
//! ## Architecture Context
//! ```text
//! ┌──────────────┐  JournalRequest   ┌─────────────────────────────────────────────┐
//! │ Persistent   │──────────────────>│ JournalEngine (single tokio task)           │
//! │ actors       │                   │   ├─ RequestBuffer   (FIFO, chunking)        │
//! │ (Recipient)  │<──────────────────│   ├─ ConcurrencyGate (tokens + breaker)      │
//! └──────────────┘  JournalResponse  │   └─ SubscriptionRegistry (pid/tag/all-ids)  │
//!                                    └───────────────┬─────────────────────────────┘
//!                                   spawn chunk      │      ▲ ChunkCompleted
//!                                                    v      │ (back through mailbox)
//!                                    ┌─────────────────────────────────────────────┐
//!                                    │ ChunkExecutor: one session per chunk,       │
//!                                    │ optional transaction, per-kind handlers     │
//!                                    └───────────────┬─────────────────────────────┘
//!                                                    v
//!                                    ┌─────────────────────────────────────────────┐
//!                                    │ StorageDriver: SqliteStorageDriver (sqlx),  │
//!                                    │                MemoryStorageDriver (tests)  │
//!                                    └─────────────────────────────────────────────┘
//! ```
//!
//! ## Key Components
//! - [`BatchingJournal`]: builder that validates config, initializes storage and spawns the engine
//! - [`JournalHandle`]: cloneable handle used to submit requests and subscriptions
//! - [`JournalRequest`] / [`JournalResponse`] / [`JournalNotification`]: the message protocol
//! - [`StorageDriver`]: storage capability (sessions, transactions, statements)
//! - [`EventSerializer`]: payload to bytes + manifest
//!
//! ## Examples
//!
//! ### Write and Replay
//! ```rust,no_run
//! use plexspaces_batching_journal::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Deposited { amount: u64 }
//!
//! # async fn example() -> JournalResult<()> {
//! let serializer = JsonEventSerializer::new().register::<Deposited>("deposited.v1");
//! let journal = BatchingJournal::builder(BatchingJournalConfig::for_testing(), MemoryStorageDriver::new())
//!     .serializer(serializer)
//!     .start()
//!     .await?;
//!
//! let (me, mut inbox) = Recipient::channel();
//! let write = AtomicWrite::new(vec![PersistentRepr::new("acct-1", 1, Payload::new(Deposited { amount: 5 }))])?;
//! journal.write_messages(me.clone(), vec![write])?;
//! journal.replay_messages(me, "acct-1", 1, i64::MAX, u64::MAX)?;
//!
//! while let Some(response) = inbox.recv().await {
//!     if let JournalResponse::RecoverySuccess { highest_sequence_nr } = response {
//!         assert_eq!(highest_sequence_nr, 1);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Principles
//!
//! ### Single Owner
//! All bookkeeping (buffer, subscriptions, tokens) lives in one task. Storage work runs on
//! spawned tasks and comes back as a `ChunkCompleted` command, so no lock guards engine state.
//!
//! ### Fail Silent Under Overload
//! A chunk that fails before its handlers run (breaker open, session cannot be opened,
//! commit failed, call timeout) produces no responses. Callers must apply their own
//! timeouts. Per-record and per-request failures are always answered with typed failures.
//!
//! ## Testing
//! ```bash
//! cargo test -p plexspaces-batching-journal
//! cargo test -p plexspaces-batching-journal --no-default-features   # memory driver only
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod storage;

mod buffer;
mod engine;
mod executor;
mod gate;
mod messages;
mod payload;
mod recipient;
mod serialization;
mod subscriptions;

pub use config::{BatchingJournalConfig, CircuitBreakerSettings, JournalColumns, MetadataColumns, TableNaming};
pub use engine::{BatchingJournal, BatchingJournalBuilder, JournalHandle, JournalStats};
pub use messages::{
    DeleteMessagesTo, JournalNotification, JournalRequest, JournalResponse, ReadHighestSequenceNr,
    ReplayMessages, ReplayTaggedMessages, RequestKind, SubscriptionKind, WriteMessages,
};
pub use payload::{AtomicWrite, Payload, PersistentRepr, Tagged};
pub use recipient::{Recipient, RecipientId, RecipientTerminated};
pub use serialization::{
    EventSerializer, IdentityEventAdapter, JsonEventSerializer, ReadEventAdapter, SerializedPayload,
};
pub use storage::memory::MemoryStorageDriver;
#[cfg(feature = "sqlite-backend")]
pub use storage::sqlite::SqliteStorageDriver;
pub use storage::{EventRow, StorageDriver, StorageSession, StoredEvent};

/// Journal errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JournalError {
    /// Statement-level storage failure (constraint violation, bad row, decode error)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Connection-level storage failure (cannot connect, I/O, pool exhausted)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Tag cannot be stored in the delimited tag column
    #[error("Invalid tag '{tag}': {reason}")]
    InvalidTag {
        /// Offending tag
        tag: String,
        /// Why it was refused
        reason: String,
    },

    /// Malformed write group
    #[error("Invalid write: {0}")]
    InvalidWrite(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Chunk refused or timed out by the circuit breaker
    #[error("Circuit breaker: {0}")]
    CircuitBreaker(String),

    /// Request refused because the buffer is full
    #[error("Journal buffer overflow: capacity={capacity}")]
    BufferOverflow {
        /// Configured `max_buffer_size`
        capacity: usize,
    },

    /// Journal engine has stopped
    #[error("Journal is shut down")]
    Shutdown,
}

impl JournalError {
    /// Errors that are not attributable to a single request or record
    ///
    /// A write handler running inside a transaction lets these escape so the whole
    /// chunk rolls back; every other error class is answered per record or per request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JournalError::Connection(_) | JournalError::CircuitBreaker(_) | JournalError::Shutdown
        )
    }
}

impl From<plexspaces_circuit_breaker::CallError<JournalError>> for JournalError {
    fn from(err: plexspaces_circuit_breaker::CallError<JournalError>) -> Self {
        use plexspaces_circuit_breaker::CallError;
        match err {
            CallError::Rejected(e) => JournalError::CircuitBreaker(e.to_string()),
            CallError::Timeout(after) => {
                JournalError::CircuitBreaker(format!("chunk timed out after {:?}", after))
            }
            CallError::Failed(e) => e,
        }
    }
}

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;
