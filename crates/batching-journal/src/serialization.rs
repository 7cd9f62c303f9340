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

//! Payload serialization and read-side adaptation
//!
//! ## Purpose
//! The journal stores events as `(bytes, manifest)`. [`EventSerializer`] is the only place
//! that knows how application types map to bytes; [`ReadEventAdapter`] may reshape events
//! after they are read back (upcasting, splitting, dropping).
//!
//! ## Default Serializer
//! [`JsonEventSerializer`] is a registry of serde types keyed by manifest:
//! ```rust
//! # use plexspaces_batching_journal::*;
//! # use serde::{Deserialize, Serialize};
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Opened { owner: String }
//!
//! let serializer = JsonEventSerializer::new().register::<Opened>("opened.v1");
//! let stored = serializer.serialize(&Payload::new(Opened { owner: "ann".into() })).unwrap();
//! assert_eq!(stored.manifest, "opened.v1");
//!
//! let back = serializer.deserialize(&stored.bytes, &stored.manifest).unwrap();
//! assert_eq!(back.downcast_ref::<Opened>().unwrap().owner, "ann");
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::payload::{Payload, PersistentRepr};
use crate::{JournalError, JournalResult};

/// Serialized form of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPayload {
    /// Encoded bytes
    pub bytes: Vec<u8>,
    /// Type tag needed to decode `bytes`
    pub manifest: String,
}

/// Maps payloads to bytes and back
pub trait EventSerializer: Send + Sync + 'static {
    /// Encode a payload
    fn serialize(&self, payload: &Payload) -> JournalResult<SerializedPayload>;

    /// Decode bytes written under `manifest`
    fn deserialize(&self, bytes: &[u8], manifest: &str) -> JournalResult<Payload>;
}

type SerializeFn = Box<dyn Fn(&Payload) -> JournalResult<Vec<u8>> + Send + Sync>;
type DeserializeFn = Box<dyn Fn(&[u8]) -> JournalResult<Payload> + Send + Sync>;

/// JSON serializer for registered serde types
#[derive(Default)]
pub struct JsonEventSerializer {
    by_type: HashMap<TypeId, (String, SerializeFn)>,
    by_manifest: HashMap<String, DeserializeFn>,
}

impl JsonEventSerializer {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `manifest`
    ///
    /// Registering a second type under the same manifest replaces the decoder.
    pub fn register<T>(mut self, manifest: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let manifest = manifest.into();

        let encode: SerializeFn = Box::new(|payload: &Payload| {
            let value = payload.downcast_ref::<T>().ok_or_else(|| {
                JournalError::Serialization(format!(
                    "expected {}, got {}",
                    std::any::type_name::<T>(),
                    payload.type_name()
                ))
            })?;
            serde_json::to_vec(value).map_err(|e| JournalError::Serialization(e.to_string()))
        });
        let decode: DeserializeFn = Box::new(|bytes: &[u8]| {
            serde_json::from_slice::<T>(bytes)
                .map(Payload::new)
                .map_err(|e| JournalError::Serialization(e.to_string()))
        });

        self.by_type.insert(TypeId::of::<T>(), (manifest.clone(), encode));
        self.by_manifest.insert(manifest, decode);
        self
    }

    /// Whether a manifest has a decoder
    pub fn has_manifest(&self, manifest: &str) -> bool {
        self.by_manifest.contains_key(manifest)
    }
}

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, payload: &Payload) -> JournalResult<SerializedPayload> {
        let (manifest, encode) = self.by_type.get(&payload.value_type_id()).ok_or_else(|| {
            JournalError::Serialization(format!(
                "no serializer registered for {}",
                payload.type_name()
            ))
        })?;
        Ok(SerializedPayload {
            bytes: encode(payload)?,
            manifest: manifest.clone(),
        })
    }

    fn deserialize(&self, bytes: &[u8], manifest: &str) -> JournalResult<Payload> {
        let decode = self.by_manifest.get(manifest).ok_or_else(|| {
            JournalError::Serialization(format!("unknown manifest '{}'", manifest))
        })?;
        decode(bytes)
    }
}

/// Hook applied to every event read back from storage
///
/// One stored event may become zero, one or many delivered events.
pub trait ReadEventAdapter: Send + Sync + 'static {
    /// Adapt one replayed event
    fn adapt_from_journal(&self, persistent: PersistentRepr) -> Vec<PersistentRepr>;
}

/// Delivers events unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityEventAdapter;

impl ReadEventAdapter for IdentityEventAdapter {
    fn adapt_from_journal(&self, persistent: PersistentRepr) -> Vec<PersistentRepr> {
        vec![persistent]
    }
}
