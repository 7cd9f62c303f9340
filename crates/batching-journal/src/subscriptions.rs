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

//! Subscription registry
//!
//! ## Purpose
//! Tracks who listens to which stream, tag, or to the set of persistence ids, and turns
//! the effects of committed chunks into notifications.
//!
//! ## All-Ids Cache
//! The set of known persistence ids is only loaded from storage once somebody asks for it:
//!
//! ```text
//! Untracked --first all-ids subscriber--> Loading --load ok--> Loaded
//!     ^                                      |
//!     +-------------- load failed -----------+
//! ```
//!
//! Ids written while loading are merged into the loaded set, so nobody misses a stream.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::executor::ChunkEffects;
use crate::messages::{JournalNotification, SubscriptionKind};
use crate::recipient::{Recipient, RecipientId};
use crate::JournalResult;

type Subscribers = HashMap<RecipientId, Recipient<JournalNotification>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllIdsState {
    Untracked,
    Loading,
    Loaded,
}

/// What the engine must do after a subscription was recorded
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SubscribeOutcome {
    /// First subscription of this recipient: start watching for termination
    pub watch: bool,
    /// Start loading every persistence id from storage
    pub load_all_ids: bool,
}

#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
    by_persistence_id: HashMap<String, Subscribers>,
    by_tag: HashMap<String, Subscribers>,
    all_ids: Subscribers,
    watched: HashSet<RecipientId>,
    known_ids: BTreeSet<String>,
    all_ids_state: AllIdsState,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self {
            by_persistence_id: HashMap::new(),
            by_tag: HashMap::new(),
            all_ids: HashMap::new(),
            watched: HashSet::new(),
            known_ids: BTreeSet::new(),
            all_ids_state: AllIdsState::Untracked,
        }
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: SubscriptionKind,
        recipient: Recipient<JournalNotification>,
    ) -> SubscribeOutcome {
        let id = recipient.id();
        let mut outcome = SubscribeOutcome {
            watch: self.watched.insert(id),
            load_all_ids: false,
        };

        match kind {
            SubscriptionKind::PersistenceId(persistence_id) => {
                self.by_persistence_id
                    .entry(persistence_id)
                    .or_default()
                    .insert(id, recipient);
            }
            SubscriptionKind::Tag(tag) => {
                self.by_tag.entry(tag).or_default().insert(id, recipient);
            }
            SubscriptionKind::AllPersistenceIds => {
                match self.all_ids_state {
                    AllIdsState::Loaded => {
                        let snapshot = JournalNotification::CurrentPersistenceIds {
                            all_persistence_ids: self.known_ids.clone(),
                        };
                        if recipient.tell(snapshot).is_err() {
                            self.remove(id);
                            return SubscribeOutcome::default();
                        }
                    }
                    AllIdsState::Untracked => {
                        self.all_ids_state = AllIdsState::Loading;
                        outcome.load_all_ids = true;
                    }
                    AllIdsState::Loading => {}
                }
                self.all_ids.insert(id, recipient);
            }
        }

        self.record_gauge();
        outcome
    }

    /// Drop every subscription of a recipient
    pub fn remove(&mut self, id: RecipientId) {
        self.by_persistence_id.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        self.by_tag.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        self.all_ids.remove(&id);
        self.watched.remove(&id);
        self.record_gauge();
    }

    /// Complete an all-ids load started by [`Self::subscribe`]
    pub fn all_ids_loaded(&mut self, result: JournalResult<BTreeSet<String>>) {
        match result {
            Ok(ids) => {
                self.known_ids.extend(ids);
                self.all_ids_state = AllIdsState::Loaded;
                tracing::debug!(known_ids = self.known_ids.len(), "persistence ids loaded");

                let snapshot = JournalNotification::CurrentPersistenceIds {
                    all_persistence_ids: self.known_ids.clone(),
                };
                let dead = notify(&self.all_ids, &snapshot);
                self.prune(dead);
            }
            Err(e) => {
                self.all_ids_state = AllIdsState::Untracked;
                tracing::warn!(error = %e, "failed to load persistence ids");
            }
        }
    }

    /// Notify subscribers about a committed chunk
    pub fn apply(&mut self, effects: &ChunkEffects) {
        let mut dead = Vec::new();

        for persistence_id in &effects.persistence_ids {
            if self.known_ids.insert(persistence_id.clone()) {
                let added = JournalNotification::PersistenceIdAdded {
                    persistence_id: persistence_id.clone(),
                };
                dead.extend(notify(&self.all_ids, &added));
            }
        }

        for tag in &effects.tags {
            if let Some(subscribers) = self.by_tag.get(tag) {
                let appended = JournalNotification::TaggedEventAppended { tag: tag.clone() };
                dead.extend(notify(subscribers, &appended));
            }
        }

        for persistence_id in &effects.persistence_ids {
            if let Some(subscribers) = self.by_persistence_id.get(persistence_id) {
                let appended = JournalNotification::EventAppended {
                    persistence_id: persistence_id.clone(),
                };
                dead.extend(notify(subscribers, &appended));
            }
        }

        self.prune(dead);
    }

    /// Distinct subscribed recipients
    pub fn subscriber_count(&self) -> usize {
        self.watched.len()
    }

    pub fn known_id_count(&self) -> usize {
        self.known_ids.len()
    }

    #[cfg(test)]
    pub fn all_ids_state(&self) -> AllIdsState {
        self.all_ids_state
    }

    fn prune(&mut self, dead: Vec<RecipientId>) {
        for id in dead {
            tracing::debug!(recipient = %id, "removing terminated subscriber");
            self.remove(id);
        }
    }

    fn record_gauge(&self) {
        metrics::gauge!("plexspaces_journal_subscribers").set(self.watched.len() as f64);
    }
}

fn notify(subscribers: &Subscribers, notification: &JournalNotification) -> Vec<RecipientId> {
    subscribers
        .values()
        .filter(|recipient| recipient.tell(notification.clone()).is_err())
        .map(Recipient::id)
        .collect()
}
