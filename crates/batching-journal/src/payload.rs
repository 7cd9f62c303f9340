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

//! Event payloads and persistent representations
//!
//! ## Purpose
//! Application events are arbitrary Rust values. The journal carries them type-erased as
//! [`Payload`] and only touches their bytes through the [`crate::EventSerializer`].

use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::{JournalError, JournalResult};

/// Type-erased, cheaply cloneable event value
#[derive(Clone)]
pub struct Payload {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Payload {
    /// Wrap an event value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap an event value in a [`Tagged`] envelope
    ///
    /// ## Examples
    /// ```rust
    /// # use plexspaces_batching_journal::{Payload, Tagged};
    /// let payload = Payload::tagged("opened".to_string(), ["accounts", "audit"]);
    /// let tagged = payload.downcast_ref::<Tagged>().unwrap();
    /// assert_eq!(tagged.tags.len(), 2);
    /// ```
    pub fn tagged<T, I, S>(value: T, tags: I) -> Self
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Payload::new(Tagged::new(Payload::new(value), tags))
    }

    /// Borrow the wrapped value if it is a `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Whether the wrapped value is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// `TypeId` of the wrapped value (not of the `Arc`)
    pub fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.value)
    }

    /// Rust type name of the wrapped value, for diagnostics
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload<{}>", self.type_name)
    }
}

/// Tagged envelope: an event plus the tags it is indexed under
#[derive(Debug, Clone)]
pub struct Tagged {
    /// The underlying event
    pub payload: Payload,
    /// Tags written alongside the event
    pub tags: BTreeSet<String>,
}

impl Tagged {
    /// Create a tagged envelope
    pub fn new<I, S>(payload: Payload, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            payload,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// One event as written to or replayed from the journal
#[derive(Debug, Clone)]
pub struct PersistentRepr {
    /// Stream the event belongs to
    pub persistence_id: String,
    /// Position within the stream (monotonic per persistence id)
    pub sequence_nr: i64,
    /// Event value (may be a [`Tagged`] envelope on the write side)
    pub payload: Payload,
    /// Serializer manifest; filled in on replay
    pub manifest: String,
    /// Logical deletion flag as stored
    pub is_deleted: bool,
    /// Unix timestamp in milliseconds; 0 means "assign at write time"
    pub timestamp: i64,
}

impl PersistentRepr {
    /// Create a representation for writing
    pub fn new(persistence_id: impl Into<String>, sequence_nr: i64, payload: Payload) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            sequence_nr,
            payload,
            manifest: String::new(),
            is_deleted: false,
            timestamp: 0,
        }
    }

    /// Same record with a different payload (used by read adapters)
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Set an explicit write timestamp (unix ms)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Group of events for one persistence id written by a single request
///
/// ## Invariants
/// - At least one event
/// - Every event has the same persistence id
#[derive(Debug, Clone)]
pub struct AtomicWrite {
    persistence_id: String,
    payload: Vec<PersistentRepr>,
}

impl AtomicWrite {
    /// Validate and build a write group
    pub fn new(payload: Vec<PersistentRepr>) -> JournalResult<Self> {
        let first = payload
            .first()
            .ok_or_else(|| JournalError::InvalidWrite("atomic write must not be empty".to_string()))?;
        let persistence_id = first.persistence_id.clone();

        if let Some(other) = payload.iter().find(|p| p.persistence_id != persistence_id) {
            return Err(JournalError::InvalidWrite(format!(
                "atomic write mixes persistence ids '{}' and '{}'",
                persistence_id, other.persistence_id
            )));
        }

        Ok(Self {
            persistence_id,
            payload,
        })
    }

    /// Persistence id shared by every event in the group
    pub fn persistence_id(&self) -> &str {
        &self.persistence_id
    }

    /// Events in write order
    pub fn payload(&self) -> &[PersistentRepr] {
        &self.payload
    }

    /// Consume into the events
    pub fn into_payload(self) -> Vec<PersistentRepr> {
        self.payload
    }

    /// Highest sequence number in the group
    pub fn highest_sequence_nr(&self) -> i64 {
        self.payload.iter().map(|p| p.sequence_nr).max().unwrap_or(0)
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Always false for a validated group
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
