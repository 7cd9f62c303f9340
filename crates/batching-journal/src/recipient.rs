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

//! Recipient - addressable mailbox handle for journal replies
//!
//! ## Purpose
//! The journal answers callers and notifies subscribers through `Recipient<M>`, a cloneable
//! wrapper around a `tokio::mpsc` sender with a stable identity. A closed channel means the
//! recipient has terminated (same convention as `ActorRef`: channel closed = actor gone).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

static NEXT_RECIPIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId(u64);

impl RecipientId {
    fn next() -> Self {
        RecipientId(NEXT_RECIPIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recipient-{}", self.0)
    }
}

/// Message could not be delivered because the recipient's mailbox is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Recipient terminated: {0}")]
pub struct RecipientTerminated(pub RecipientId);

/// Mailbox handle of an actor that receives `M`
///
/// Equality and hashing use the identity only, so a recipient can key subscription sets.
pub struct Recipient<M> {
    id: RecipientId,
    sender: mpsc::UnboundedSender<M>,
}

impl<M> Recipient<M> {
    /// Wrap an existing mailbox sender
    pub fn new(sender: mpsc::UnboundedSender<M>) -> Self {
        Self {
            id: RecipientId::next(),
            sender,
        }
    }

    /// Create a recipient together with its mailbox receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Stable identity
    pub fn id(&self) -> RecipientId {
        self.id
    }

    /// Fire-and-forget delivery
    pub fn tell(&self, message: M) -> Result<(), RecipientTerminated> {
        self.sender
            .send(message)
            .map_err(|_| RecipientTerminated(self.id))
    }

    /// Liveness check: false once the receiving side is dropped
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Resolves when the receiving side is dropped
    pub async fn terminated(&self) {
        self.sender.closed().await
    }
}

impl<M> Clone for Recipient<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sender: self.sender.clone(),
        }
    }
}

impl<M> PartialEq for Recipient<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<M> Eq for Recipient<M> {}

impl<M> Hash for Recipient<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<M> fmt::Debug for Recipient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
