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

//! Chunk executor
//!
//! ## Purpose
//! Runs every request of a chunk against one storage session, in order.
//!
//! ## Failure Tiers
//! - Per record (serialization, invalid tag, constraint violation): `WriteMessageRejected`,
//!   siblings continue
//! - Per request (replay, read-highest, delete, tagged replay): typed failure response
//! - Infrastructure (session open, commit, and connection errors of a transactional
//!   write): the chunk fails as a unit and nothing is answered
//!
//! ## Outbox
//! In a transaction, responses are held back and delivered after commit, so a rolled back
//! chunk never reports success. Outside a transaction they are delivered as produced.

use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::buffer::Chunk;
use crate::messages::{
    DeleteMessagesTo, JournalRequest, JournalResponse, ReadHighestSequenceNr, ReplayMessages,
    ReplayTaggedMessages, WriteMessages,
};
use crate::payload::{PersistentRepr, Tagged};
use crate::recipient::Recipient;
use crate::serialization::{EventSerializer, ReadEventAdapter};
use crate::storage::{encode_tags, EventRow, StorageDriver, StorageSession, StoredEvent};
use crate::{JournalError, JournalResult};

/// Side effects of a committed chunk, applied by the engine
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ChunkEffects {
    /// Persistence ids written, first-write order, no duplicates
    pub persistence_ids: Vec<String>,
    /// Tags written
    pub tags: BTreeSet<String>,
}

impl ChunkEffects {
    pub fn record_persistence_id(&mut self, persistence_id: &str) {
        if !self.persistence_ids.iter().any(|id| id == persistence_id) {
            self.persistence_ids.push(persistence_id.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.persistence_ids.is_empty() && self.tags.is_empty()
    }
}

struct Outbox {
    deferred: bool,
    pending: Vec<(Recipient<JournalResponse>, JournalResponse)>,
    executed: Vec<JournalRequest>,
}

impl Outbox {
    fn new(deferred: bool) -> Self {
        Self {
            deferred,
            pending: Vec::new(),
            executed: Vec::new(),
        }
    }

    fn send(&mut self, target: &Recipient<JournalResponse>, response: JournalResponse) {
        if self.deferred {
            self.pending.push((target.clone(), response));
        } else {
            deliver(target, response);
        }
    }

    fn flush(self, executed: Option<&broadcast::Sender<Arc<JournalRequest>>>) {
        for (target, response) in self.pending {
            deliver(&target, response);
        }
        if let Some(sender) = executed {
            for request in self.executed {
                // no receivers is fine
                let _ = sender.send(Arc::new(request));
            }
        }
    }
}

fn deliver(target: &Recipient<JournalResponse>, response: JournalResponse) {
    if target.tell(response).is_err() {
        tracing::debug!(recipient = %target.id(), "journal response dropped, recipient terminated");
    }
}

/// Executes chunks against a storage driver
pub(crate) struct ChunkExecutor {
    driver: Arc<dyn StorageDriver>,
    serializer: Arc<dyn EventSerializer>,
    adapter: Arc<dyn ReadEventAdapter>,
    transactional: bool,
    executed: Option<broadcast::Sender<Arc<JournalRequest>>>,
}

impl ChunkExecutor {
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        serializer: Arc<dyn EventSerializer>,
        adapter: Arc<dyn ReadEventAdapter>,
        transactional: bool,
        executed: Option<broadcast::Sender<Arc<JournalRequest>>>,
    ) -> Self {
        Self {
            driver,
            serializer,
            adapter,
            transactional,
            executed,
        }
    }

    /// Run one chunk
    ///
    /// ## Errors
    /// Infrastructure failures only; every other failure is answered in-band.
    pub async fn execute(&self, chunk: Chunk) -> JournalResult<ChunkEffects> {
        let transactional = self.transactional && !chunk.read_only;
        let mut session = self.driver.open_session(transactional).await?;
        let mut outbox = Outbox::new(transactional);
        let mut effects = ChunkEffects::default();

        for request in chunk.requests {
            let handled = match &request {
                JournalRequest::WriteMessages(r) => {
                    self.write_messages(session.as_mut(), r, &mut outbox, &mut effects)
                        .await
                }
                JournalRequest::ReplayMessages(r) => {
                    self.replay_messages(session.as_mut(), r, &mut outbox).await;
                    Ok(())
                }
                JournalRequest::ReadHighestSequenceNr(r) => {
                    self.read_highest(session.as_mut(), r, &mut outbox).await;
                    Ok(())
                }
                JournalRequest::DeleteMessagesTo(r) => {
                    self.delete_messages_to(session.as_mut(), r, &mut outbox).await;
                    Ok(())
                }
                JournalRequest::ReplayTaggedMessages(r) => {
                    self.replay_tagged(session.as_mut(), r, &mut outbox).await;
                    Ok(())
                }
            };

            if let Err(e) = handled {
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(chunk_id = chunk.id, error = %rollback, "journal rollback failed");
                }
                return Err(e);
            }
            if self.executed.is_some() {
                outbox.executed.push(request);
            }
        }

        session.commit().await?;
        outbox.flush(self.executed.as_ref());
        Ok(effects)
    }

    async fn write_messages(
        &self,
        session: &mut dyn StorageSession,
        request: &WriteMessages,
        outbox: &mut Outbox,
        effects: &mut ChunkEffects,
    ) -> JournalResult<()> {
        let transactional = session.is_transactional();
        let mut failure: Option<JournalError> = None;
        let mut per_record = Vec::new();
        let mut written = ChunkEffects::default();

        for persistent in request.messages.iter().flat_map(|w| w.payload()) {
            if let Some(cause) = &failure {
                per_record.push(rejected(persistent, cause.clone()));
                continue;
            }

            match self.write_one(session, persistent).await {
                Ok(tags) => {
                    written.record_persistence_id(&persistent.persistence_id);
                    written.tags.extend(tags);
                    per_record.push(JournalResponse::WriteMessageSuccess {
                        persistent: persistent.clone(),
                    });
                }
                Err(e) if e.is_infrastructure() => {
                    if transactional {
                        return Err(e);
                    }
                    tracing::warn!(
                        persistence_id = %persistent.persistence_id,
                        sequence_nr = persistent.sequence_nr,
                        error = %e,
                        "journal write failed, rejecting remaining records"
                    );
                    per_record.push(rejected(persistent, e.clone()));
                    failure = Some(e);
                }
                Err(e) => {
                    tracing::debug!(
                        persistence_id = %persistent.persistence_id,
                        sequence_nr = persistent.sequence_nr,
                        error = %e,
                        "journal record rejected"
                    );
                    per_record.push(rejected(persistent, e));
                }
            }
        }

        let rejected_count = per_record
            .iter()
            .filter(|r| matches!(r, JournalResponse::WriteMessageRejected { .. }))
            .count();
        if rejected_count > 0 {
            metrics::counter!("plexspaces_journal_records_rejected_total").increment(rejected_count as u64);
        }

        let summary = match failure {
            None => JournalResponse::WriteMessagesSuccessful,
            Some(cause) => JournalResponse::WriteMessagesFailed {
                cause,
                write_count: per_record.len(),
            },
        };
        outbox.send(&request.target, summary);
        for response in per_record {
            outbox.send(&request.target, response);
        }

        for persistence_id in &written.persistence_ids {
            effects.record_persistence_id(persistence_id);
        }
        effects.tags.extend(written.tags);
        Ok(())
    }

    async fn write_one(
        &self,
        session: &mut dyn StorageSession,
        persistent: &PersistentRepr,
    ) -> JournalResult<BTreeSet<String>> {
        let (payload, tags) = match persistent.payload.downcast_ref::<Tagged>() {
            Some(tagged) => (&tagged.payload, tagged.tags.clone()),
            None => (&persistent.payload, BTreeSet::new()),
        };
        let encoded_tags = encode_tags(&tags)?;
        let serialized = self.serializer.serialize(payload)?;
        let timestamp = if persistent.timestamp > 0 {
            persistent.timestamp
        } else {
            chrono::Utc::now().timestamp_millis()
        };

        let row = EventRow {
            persistence_id: persistent.persistence_id.clone(),
            sequence_nr: persistent.sequence_nr,
            is_deleted: false,
            manifest: serialized.manifest,
            timestamp,
            payload: serialized.bytes,
            tags: encoded_tags,
        };
        session.insert_event(&row).await?;
        Ok(tags)
    }

    async fn replay_messages(
        &self,
        session: &mut dyn StorageSession,
        request: &ReplayMessages,
        outbox: &mut Outbox,
    ) {
        let response = match self.try_replay(session, request, outbox).await {
            Ok(highest_sequence_nr) => JournalResponse::RecoverySuccess { highest_sequence_nr },
            Err(cause) => {
                tracing::warn!(persistence_id = %request.persistence_id, error = %cause, "journal replay failed");
                JournalResponse::ReplayMessagesFailure { cause }
            }
        };
        outbox.send(&request.target, response);
    }

    async fn try_replay(
        &self,
        session: &mut dyn StorageSession,
        request: &ReplayMessages,
        outbox: &mut Outbox,
    ) -> JournalResult<i64> {
        let highest = session.highest_sequence_nr(&request.persistence_id).await?;
        let to = request.to_sequence_nr.min(highest);
        if request.max == 0 || request.from_sequence_nr > to {
            return Ok(highest);
        }

        let mut delivered = 0u64;
        let mut rows = session
            .events_by_persistence_id(&request.persistence_id, request.from_sequence_nr, to)
            .await?;
        while delivered < request.max {
            let Some(row) = rows.next().await else {
                break;
            };
            let row = row?;
            if row.is_deleted {
                continue;
            }
            for persistent in self.adapter.adapt_from_journal(self.to_persistent(row)?) {
                if delivered >= request.max {
                    break;
                }
                outbox.send(&request.target, JournalResponse::ReplayedMessage { persistent });
                delivered += 1;
            }
        }
        Ok(highest)
    }

    async fn read_highest(
        &self,
        session: &mut dyn StorageSession,
        request: &ReadHighestSequenceNr,
        outbox: &mut Outbox,
    ) {
        let response = match session.highest_sequence_nr(&request.persistence_id).await {
            Ok(highest_sequence_nr) => JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr },
            Err(cause) => JournalResponse::ReadHighestSequenceNrFailure { cause },
        };
        outbox.send(&request.target, response);
    }

    async fn delete_messages_to(
        &self,
        session: &mut dyn StorageSession,
        request: &DeleteMessagesTo,
        outbox: &mut Outbox,
    ) {
        let to_sequence_nr = request.to_sequence_nr;
        let response = match try_delete(session, &request.persistence_id, to_sequence_nr).await {
            Ok(deleted) => {
                tracing::debug!(persistence_id = %request.persistence_id, to_sequence_nr, deleted, "journal prefix deleted");
                JournalResponse::DeleteMessagesSuccess { to_sequence_nr }
            }
            Err(cause) => JournalResponse::DeleteMessagesFailure { cause, to_sequence_nr },
        };
        outbox.send(&request.target, response);
    }

    async fn replay_tagged(
        &self,
        session: &mut dyn StorageSession,
        request: &ReplayTaggedMessages,
        outbox: &mut Outbox,
    ) {
        let response = match self.try_replay_tagged(session, request, outbox).await {
            Ok(highest_sequence_nr) => JournalResponse::RecoverySuccess { highest_sequence_nr },
            Err(cause) => {
                tracing::warn!(tag = %request.tag, error = %cause, "journal tag replay failed");
                JournalResponse::ReplayMessagesFailure { cause }
            }
        };
        outbox.send(&request.reply_to, response);
    }

    async fn try_replay_tagged(
        &self,
        session: &mut dyn StorageSession,
        request: &ReplayTaggedMessages,
        outbox: &mut Outbox,
    ) -> JournalResult<i64> {
        let span = u64::try_from(request.to_offset.saturating_sub(request.from_offset)).unwrap_or(0);
        let limit = i64::try_from(span.min(request.max)).unwrap_or(i64::MAX);
        let mut highest = 0;
        if limit == 0 {
            return Ok(highest);
        }

        let mut rows = session
            .events_by_tag(&request.tag, request.from_offset, request.to_offset, limit)
            .await?;
        while let Some(row) = rows.next().await {
            let row = row?;
            let offset = row.ordering;
            highest = highest.max(row.sequence_nr);
            if row.is_deleted {
                continue;
            }
            for persistent in self.adapter.adapt_from_journal(self.to_persistent(row)?) {
                outbox.send(
                    &request.reply_to,
                    JournalResponse::ReplayedTaggedMessage {
                        persistent,
                        tag: request.tag.clone(),
                        offset,
                    },
                );
            }
        }
        Ok(highest)
    }

    fn to_persistent(&self, row: StoredEvent) -> JournalResult<PersistentRepr> {
        let payload = self.serializer.deserialize(&row.payload, &row.manifest)?;
        Ok(PersistentRepr {
            persistence_id: row.persistence_id,
            sequence_nr: row.sequence_nr,
            payload,
            manifest: row.manifest,
            is_deleted: row.is_deleted,
            timestamp: row.timestamp,
        })
    }
}

fn rejected(persistent: &PersistentRepr, cause: JournalError) -> JournalResponse {
    JournalResponse::WriteMessageRejected {
        persistent: persistent.clone(),
        cause,
    }
}

async fn try_delete(
    session: &mut dyn StorageSession,
    persistence_id: &str,
    to_sequence_nr: i64,
) -> JournalResult<u64> {
    let highest = session.highest_sequence_nr(persistence_id).await?;
    let deleted = session.delete_events_to(persistence_id, to_sequence_nr).await?;
    // keep the highest sequence number readable once the whole stream is gone
    if highest > 0 && highest <= to_sequence_nr {
        session.upsert_metadata(persistence_id, highest).await?;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RequestBuffer;
    use crate::payload::{AtomicWrite, Payload};
    use crate::serialization::{IdentityEventAdapter, JsonEventSerializer};
    use crate::storage::memory::MemoryStorageDriver;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn executor(driver: &MemoryStorageDriver, transactional: bool) -> ChunkExecutor {
        ChunkExecutor::new(
            Arc::new(driver.clone()),
            Arc::new(JsonEventSerializer::new().register::<String>("string")),
            Arc::new(IdentityEventAdapter),
            transactional,
            None,
        )
    }

    fn chunk(requests: Vec<JournalRequest>) -> Chunk {
        let mut buffer = RequestBuffer::new(requests.len().max(1), None);
        for request in requests {
            buffer.push(request).unwrap();
        }
        buffer.next_chunk().unwrap()
    }

    fn write(target: &Recipient<JournalResponse>, pid: &str, seqs: &[i64]) -> JournalRequest {
        let reprs = seqs
            .iter()
            .map(|seq| PersistentRepr::new(pid, *seq, Payload::new(format!("{}-{}", pid, seq))))
            .collect();
        WriteMessages {
            target: target.clone(),
            messages: vec![AtomicWrite::new(reprs).unwrap()],
        }
        .into()
    }

    fn drain(rx: &mut UnboundedReceiver<JournalResponse>) -> Vec<JournalResponse> {
        let mut out = Vec::new();
        while let Ok(response) = rx.try_recv() {
            out.push(response);
        }
        out
    }

    #[tokio::test]
    async fn test_write_then_replay_in_one_chunk() {
        let driver = MemoryStorageDriver::new();
        let (target, mut rx) = Recipient::channel();

        let effects = executor(&driver, true)
            .execute(chunk(vec![
                write(&target, "a", &[1, 2]),
                ReplayMessages {
                    target: target.clone(),
                    persistence_id: "a".into(),
                    from_sequence_nr: 1,
                    to_sequence_nr: i64::MAX,
                    max: u64::MAX,
                }
                .into(),
            ]))
            .await
            .unwrap();

        assert_eq!(effects.persistence_ids, vec!["a".to_string()]);
        let responses = drain(&mut rx);
        assert!(matches!(responses[0], JournalResponse::WriteMessagesSuccessful));
        assert!(matches!(responses[1], JournalResponse::WriteMessageSuccess { .. }));
        assert!(matches!(responses[2], JournalResponse::WriteMessageSuccess { .. }));
        assert!(matches!(responses[3], JournalResponse::ReplayedMessage { .. }));
        assert!(matches!(responses[4], JournalResponse::ReplayedMessage { .. }));
        assert!(matches!(
            responses[5],
            JournalResponse::RecoverySuccess { highest_sequence_nr: 2 }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_record_is_rejected_individually() {
        let driver = MemoryStorageDriver::new();
        let (target, mut rx) = Recipient::channel();
        let exec = executor(&driver, true);

        exec.execute(chunk(vec![write(&target, "a", &[1])])).await.unwrap();
        drain(&mut rx);

        exec.execute(chunk(vec![write(&target, "a", &[1, 2])])).await.unwrap();
        let responses = drain(&mut rx);
        assert!(matches!(responses[0], JournalResponse::WriteMessagesSuccessful));
        assert!(matches!(
            responses[1],
            JournalResponse::WriteMessageRejected { cause: JournalError::Storage(_), .. }
        ));
        assert!(matches!(responses[2], JournalResponse::WriteMessageSuccess { .. }));
        assert_eq!(driver.event_count().await, 2);
    }

    #[tokio::test]
    async fn test_unregistered_payload_is_rejected() {
        let driver = MemoryStorageDriver::new();
        let (target, mut rx) = Recipient::channel();
        let request: JournalRequest = WriteMessages {
            target: target.clone(),
            messages: vec![AtomicWrite::new(vec![PersistentRepr::new("a", 1, Payload::new(7u32))]).unwrap()],
        }
        .into();

        executor(&driver, true).execute(chunk(vec![request])).await.unwrap();
        let responses = drain(&mut rx);
        assert!(matches!(
            responses[1],
            JournalResponse::WriteMessageRejected { cause: JournalError::Serialization(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_connection_error_rolls_back_transactional_chunk() {
        let driver = MemoryStorageDriver::new();
        driver.fail_inserts_for("poison", JournalError::Connection("injected".into())).await;
        let (target, mut rx) = Recipient::channel();

        let result = executor(&driver, true)
            .execute(chunk(vec![write(&target, "ok", &[1]), write(&target, "poison", &[1])]))
            .await;

        assert!(matches!(result, Err(JournalError::Connection(_))));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(driver.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_error_without_transaction_rejects_rest() {
        let driver = MemoryStorageDriver::new();
        driver.fail_inserts_for("poison", JournalError::Connection("injected".into())).await;
        let (target, mut rx) = Recipient::channel();

        let effects = executor(&driver, false)
            .execute(chunk(vec![write(&target, "ok", &[1]), write(&target, "poison", &[1, 2])]))
            .await
            .unwrap();

        assert_eq!(effects.persistence_ids, vec!["ok".to_string()]);
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 5);
        assert!(matches!(responses[0], JournalResponse::WriteMessagesSuccessful));
        assert!(matches!(
            responses[2],
            JournalResponse::WriteMessagesFailed { write_count: 2, .. }
        ));
        assert!(matches!(responses[3], JournalResponse::WriteMessageRejected { .. }));
        assert!(matches!(responses[4], JournalResponse::WriteMessageRejected { .. }));
    }

    #[tokio::test]
    async fn test_session_open_failure_fails_chunk() {
        let driver = MemoryStorageDriver::new();
        driver.fail_session_opens(Some(JournalError::Connection("down".into()))).await;
        let (target, mut rx) = Recipient::channel();

        let result = executor(&driver, true)
            .execute(chunk(vec![ReadHighestSequenceNr {
                target,
                persistence_id: "a".into(),
            }
            .into()]))
            .await;

        assert!(result.is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_delete_writes_marker_only_for_full_delete() {
        let driver = MemoryStorageDriver::new();
        let (target, mut rx) = Recipient::channel();
        let exec = executor(&driver, true);
        exec.execute(chunk(vec![write(&target, "a", &[1, 2, 3])])).await.unwrap();
        drain(&mut rx);

        let delete = |to| -> JournalRequest {
            DeleteMessagesTo {
                target: target.clone(),
                persistence_id: "a".into(),
                to_sequence_nr: to,
            }
            .into()
        };
        let highest = || -> JournalRequest {
            ReadHighestSequenceNr {
                target: target.clone(),
                persistence_id: "a".into(),
            }
            .into()
        };

        exec.execute(chunk(vec![delete(1), highest(), delete(3), highest()]))
            .await
            .unwrap();
        let responses = drain(&mut rx);
        assert!(matches!(responses[0], JournalResponse::DeleteMessagesSuccess { to_sequence_nr: 1 }));
        assert!(matches!(
            responses[1],
            JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr: 3 }
        ));
        assert!(matches!(responses[2], JournalResponse::DeleteMessagesSuccess { to_sequence_nr: 3 }));
        assert!(matches!(
            responses[3],
            JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr: 3 }
        ));
        assert_eq!(driver.event_count().await, 0);
    }

    #[tokio::test]
    async fn test_executed_requests_published_after_commit() {
        let driver = MemoryStorageDriver::new();
        let (sender, mut published) = broadcast::channel(8);
        let exec = ChunkExecutor::new(
            Arc::new(driver.clone()),
            Arc::new(JsonEventSerializer::new().register::<String>("string")),
            Arc::new(IdentityEventAdapter),
            true,
            Some(sender),
        );
        let (target, _rx) = Recipient::channel();

        exec.execute(chunk(vec![write(&target, "a", &[1])])).await.unwrap();
        let request = published.try_recv().unwrap();
        assert_eq!(request.kind(), crate::messages::RequestKind::Write);
    }
}
