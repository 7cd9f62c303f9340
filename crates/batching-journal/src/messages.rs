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

//! Journal protocol: requests, responses and subscriber notifications

use std::collections::BTreeSet;

use crate::payload::{AtomicWrite, PersistentRepr};
use crate::recipient::Recipient;
use crate::JournalError;

/// Persist one or more atomic write groups
#[derive(Debug, Clone)]
pub struct WriteMessages {
    /// Receives the summary and per-record responses
    pub target: Recipient<JournalResponse>,
    /// Write groups in submission order
    pub messages: Vec<AtomicWrite>,
}

/// Replay a range of one stream
#[derive(Debug, Clone)]
pub struct ReplayMessages {
    /// Receives replayed messages and the terminal response
    pub target: Recipient<JournalResponse>,
    /// Stream to replay
    pub persistence_id: String,
    /// First sequence number (inclusive)
    pub from_sequence_nr: i64,
    /// Last sequence number (inclusive), clamped to the highest stored
    pub to_sequence_nr: i64,
    /// Maximum number of delivered messages
    pub max: u64,
}

/// Look up the highest sequence number of a stream
#[derive(Debug, Clone)]
pub struct ReadHighestSequenceNr {
    /// Receives the answer
    pub target: Recipient<JournalResponse>,
    /// Stream to inspect
    pub persistence_id: String,
}

/// Hard-delete a stream prefix
#[derive(Debug, Clone)]
pub struct DeleteMessagesTo {
    /// Receives the answer
    pub target: Recipient<JournalResponse>,
    /// Stream to truncate
    pub persistence_id: String,
    /// Delete every event with `sequence_nr <= to_sequence_nr`
    pub to_sequence_nr: i64,
}

/// Replay events carrying a tag, ordered by global ordering
#[derive(Debug, Clone)]
pub struct ReplayTaggedMessages {
    /// Receives replayed messages and the terminal response
    pub reply_to: Recipient<JournalResponse>,
    /// Tag to match
    pub tag: String,
    /// Exclusive lower bound on global ordering
    pub from_offset: i64,
    /// Inclusive upper bound on global ordering
    pub to_offset: i64,
    /// Maximum number of rows
    pub max: u64,
}

/// A unit of work submitted to the journal
#[derive(Debug, Clone)]
pub enum JournalRequest {
    /// See [`WriteMessages`]
    WriteMessages(WriteMessages),
    /// See [`ReplayMessages`]
    ReplayMessages(ReplayMessages),
    /// See [`ReadHighestSequenceNr`]
    ReadHighestSequenceNr(ReadHighestSequenceNr),
    /// See [`DeleteMessagesTo`]
    DeleteMessagesTo(DeleteMessagesTo),
    /// See [`ReplayTaggedMessages`]
    ReplayTaggedMessages(ReplayTaggedMessages),
}

/// Request discriminant, used for metric labels and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Write
    Write,
    /// Replay by persistence id
    Replay,
    /// Read highest sequence number
    ReadHighest,
    /// Delete prefix
    Delete,
    /// Replay by tag
    ReplayTagged,
}

impl RequestKind {
    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Write => "write",
            RequestKind::Replay => "replay",
            RequestKind::ReadHighest => "read_highest",
            RequestKind::Delete => "delete",
            RequestKind::ReplayTagged => "replay_tagged",
        }
    }
}

impl JournalRequest {
    /// Discriminant
    pub fn kind(&self) -> RequestKind {
        match self {
            JournalRequest::WriteMessages(_) => RequestKind::Write,
            JournalRequest::ReplayMessages(_) => RequestKind::Replay,
            JournalRequest::ReadHighestSequenceNr(_) => RequestKind::ReadHighest,
            JournalRequest::DeleteMessagesTo(_) => RequestKind::Delete,
            JournalRequest::ReplayTaggedMessages(_) => RequestKind::ReplayTagged,
        }
    }

    /// Replay and read-highest never modify storage
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            JournalRequest::ReplayMessages(_) | JournalRequest::ReadHighestSequenceNr(_)
        )
    }

    /// Recipient of every response to this request
    pub fn reply_to(&self) -> &Recipient<JournalResponse> {
        match self {
            JournalRequest::WriteMessages(r) => &r.target,
            JournalRequest::ReplayMessages(r) => &r.target,
            JournalRequest::ReadHighestSequenceNr(r) => &r.target,
            JournalRequest::DeleteMessagesTo(r) => &r.target,
            JournalRequest::ReplayTaggedMessages(r) => &r.reply_to,
        }
    }

    /// The typed failure answer(s) for a request that will not be executed
    pub(crate) fn failure_responses(&self, cause: &JournalError) -> Vec<JournalResponse> {
        match self {
            JournalRequest::WriteMessages(r) => {
                let mut responses = vec![JournalResponse::WriteMessagesFailed {
                    cause: cause.clone(),
                    write_count: r.messages.iter().map(AtomicWrite::len).sum(),
                }];
                responses.extend(r.messages.iter().flat_map(|w| w.payload().iter()).map(|p| {
                    JournalResponse::WriteMessageRejected {
                        persistent: p.clone(),
                        cause: cause.clone(),
                    }
                }));
                responses
            }
            JournalRequest::ReplayMessages(_) | JournalRequest::ReplayTaggedMessages(_) => {
                vec![JournalResponse::ReplayMessagesFailure { cause: cause.clone() }]
            }
            JournalRequest::ReadHighestSequenceNr(_) => {
                vec![JournalResponse::ReadHighestSequenceNrFailure { cause: cause.clone() }]
            }
            JournalRequest::DeleteMessagesTo(r) => vec![JournalResponse::DeleteMessagesFailure {
                cause: cause.clone(),
                to_sequence_nr: r.to_sequence_nr,
            }],
        }
    }
}

impl From<WriteMessages> for JournalRequest {
    fn from(r: WriteMessages) -> Self {
        JournalRequest::WriteMessages(r)
    }
}

impl From<ReplayMessages> for JournalRequest {
    fn from(r: ReplayMessages) -> Self {
        JournalRequest::ReplayMessages(r)
    }
}

impl From<ReadHighestSequenceNr> for JournalRequest {
    fn from(r: ReadHighestSequenceNr) -> Self {
        JournalRequest::ReadHighestSequenceNr(r)
    }
}

impl From<DeleteMessagesTo> for JournalRequest {
    fn from(r: DeleteMessagesTo) -> Self {
        JournalRequest::DeleteMessagesTo(r)
    }
}

impl From<ReplayTaggedMessages> for JournalRequest {
    fn from(r: ReplayTaggedMessages) -> Self {
        JournalRequest::ReplayTaggedMessages(r)
    }
}

/// Answers delivered to the originating target
#[derive(Debug, Clone)]
pub enum JournalResponse {
    /// Every write group of the request was processed
    WriteMessagesSuccessful,
    /// The request as a whole failed
    WriteMessagesFailed {
        /// Failure cause
        cause: JournalError,
        /// Number of records in the request
        write_count: usize,
    },
    /// One record was stored
    WriteMessageSuccess {
        /// The record as submitted
        persistent: PersistentRepr,
    },
    /// One record was not stored; siblings are unaffected
    WriteMessageRejected {
        /// The record as submitted
        persistent: PersistentRepr,
        /// Failure cause
        cause: JournalError,
    },
    /// One replayed event
    ReplayedMessage {
        /// Deserialized and adapted event
        persistent: PersistentRepr,
    },
    /// Replay finished
    RecoverySuccess {
        /// Highest sequence number of the stream (or the highest seen, for tag replay)
        highest_sequence_nr: i64,
    },
    /// Replay aborted
    ReplayMessagesFailure {
        /// Failure cause
        cause: JournalError,
    },
    /// Highest sequence number lookup answer
    ReadHighestSequenceNrSuccess {
        /// Highest sequence number, 0 if the stream never existed
        highest_sequence_nr: i64,
    },
    /// Highest sequence number lookup failed
    ReadHighestSequenceNrFailure {
        /// Failure cause
        cause: JournalError,
    },
    /// Prefix deleted
    DeleteMessagesSuccess {
        /// Requested bound
        to_sequence_nr: i64,
    },
    /// Prefix deletion failed
    DeleteMessagesFailure {
        /// Failure cause
        cause: JournalError,
        /// Requested bound
        to_sequence_nr: i64,
    },
    /// One event replayed by tag
    ReplayedTaggedMessage {
        /// Deserialized event
        persistent: PersistentRepr,
        /// Tag that matched
        tag: String,
        /// Global ordering of the row
        offset: i64,
    },
}

/// Pushed to subscribers when journal contents change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalNotification {
    /// New events were appended to a stream
    EventAppended {
        /// Stream that changed
        persistence_id: String,
    },
    /// New events were written under a tag
    TaggedEventAppended {
        /// Tag that changed
        tag: String,
    },
    /// A stream was written for the first time
    PersistenceIdAdded {
        /// New stream
        persistence_id: String,
    },
    /// Every persistence id known to the journal
    CurrentPersistenceIds {
        /// Snapshot of known ids
        all_persistence_ids: BTreeSet<String>,
    },
}

/// What a subscriber wants to hear about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Appends to one stream
    PersistenceId(String),
    /// Appends under one tag
    Tag(String),
    /// New streams, preceded by a snapshot of every known stream
    AllPersistenceIds,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;

    fn write_request(target: Recipient<JournalResponse>) -> JournalRequest {
        let group = AtomicWrite::new(vec![
            PersistentRepr::new("p", 1, Payload::new(1u8)),
            PersistentRepr::new("p", 2, Payload::new(2u8)),
        ])
        .unwrap();
        WriteMessages {
            target,
            messages: vec![group],
        }
        .into()
    }

    #[test]
    fn test_read_only_classification() {
        let (target, _rx) = Recipient::channel();
        let replay: JournalRequest = ReplayMessages {
            target: target.clone(),
            persistence_id: "p".into(),
            from_sequence_nr: 1,
            to_sequence_nr: 10,
            max: 10,
        }
        .into();
        let highest: JournalRequest = ReadHighestSequenceNr {
            target: target.clone(),
            persistence_id: "p".into(),
        }
        .into();
        let tagged: JournalRequest = ReplayTaggedMessages {
            reply_to: target.clone(),
            tag: "t".into(),
            from_offset: 0,
            to_offset: 10,
            max: 10,
        }
        .into();

        assert!(replay.is_read_only());
        assert!(highest.is_read_only());
        assert!(!tagged.is_read_only());
        assert!(!write_request(target).is_read_only());
        assert_eq!(replay.kind().as_str(), "replay");
    }

    #[test]
    fn test_write_failure_responses_cover_every_record() {
        let (target, _rx) = Recipient::channel();
        let responses = write_request(target).failure_responses(&JournalError::Shutdown);

        assert_eq!(responses.len(), 3);
        assert!(matches!(
            responses[0],
            JournalResponse::WriteMessagesFailed { write_count: 2, .. }
        ));
        assert!(responses[1..]
            .iter()
            .all(|r| matches!(r, JournalResponse::WriteMessageRejected { .. })));
    }
}
