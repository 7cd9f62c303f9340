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

//! Shared helpers for batching journal integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use plexspaces_batching_journal::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const SILENCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccountEvent {
    Opened { owner: String },
    Deposited { amount: u64 },
    Withdrawn { amount: u64 },
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn serializer() -> JsonEventSerializer {
    JsonEventSerializer::new().register::<AccountEvent>("account-event.v1")
}

pub async fn start_journal<D: StorageDriver>(config: BatchingJournalConfig, driver: D) -> JournalHandle {
    init_tracing();
    BatchingJournal::builder(config, driver)
        .serializer(serializer())
        .start()
        .await
        .expect("journal should start")
}

pub fn deposit(pid: &str, seq: i64) -> PersistentRepr {
    PersistentRepr::new(pid, seq, Payload::new(AccountEvent::Deposited { amount: seq as u64 * 10 }))
}

pub fn group(pid: &str, seqs: impl IntoIterator<Item = i64>) -> AtomicWrite {
    AtomicWrite::new(seqs.into_iter().map(|seq| deposit(pid, seq)).collect()).expect("valid group")
}

/// Next message or panic after `RESPONSE_TIMEOUT`
pub async fn next<M>(rx: &mut UnboundedReceiver<M>) -> M {
    timeout(RESPONSE_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

/// Nothing arrives within `SILENCE` (a closed channel counts as silence)
pub async fn assert_silent<M: Debug>(rx: &mut UnboundedReceiver<M>) {
    if let Ok(Some(message)) = timeout(SILENCE, rx.recv()).await {
        panic!("expected no message, got {:?}", message);
    }
}

/// Write groups and collect the summary plus one response per record
pub async fn write(journal: &JournalHandle, groups: Vec<AtomicWrite>) -> Vec<JournalResponse> {
    let records: usize = groups.iter().map(AtomicWrite::len).sum();
    let (me, mut rx) = Recipient::channel();
    journal.write_messages(me, groups).unwrap();

    let mut responses = Vec::with_capacity(records + 1);
    for _ in 0..=records {
        responses.push(next(&mut rx).await);
    }
    responses
}

/// Write groups and assert every record succeeded
pub async fn write_ok(journal: &JournalHandle, groups: Vec<AtomicWrite>) {
    let responses = write(journal, groups).await;
    assert!(
        matches!(responses[0], JournalResponse::WriteMessagesSuccessful),
        "unexpected summary: {:?}",
        responses[0]
    );
    for response in &responses[1..] {
        assert!(
            matches!(response, JournalResponse::WriteMessageSuccess { .. }),
            "unexpected record response: {:?}",
            response
        );
    }
}

/// Replay and collect messages up to `RecoverySuccess`
pub async fn replay(
    journal: &JournalHandle,
    pid: &str,
    from: i64,
    to: i64,
    max: u64,
) -> (Vec<PersistentRepr>, i64) {
    let (me, mut rx) = Recipient::channel();
    journal.replay_messages(me, pid, from, to, max).unwrap();

    let mut replayed = Vec::new();
    loop {
        match next(&mut rx).await {
            JournalResponse::ReplayedMessage { persistent } => replayed.push(persistent),
            JournalResponse::RecoverySuccess { highest_sequence_nr } => return (replayed, highest_sequence_nr),
            other => panic!("unexpected replay response: {:?}", other),
        }
    }
}

/// Tag replay, returning `(sequence_nr, offset)` pairs and the final highest
pub async fn replay_tagged(
    journal: &JournalHandle,
    tag: &str,
    from_offset: i64,
    to_offset: i64,
    max: u64,
) -> (Vec<(i64, i64)>, i64) {
    let (me, mut rx) = Recipient::channel();
    journal
        .replay_tagged_messages(me, tag, from_offset, to_offset, max)
        .unwrap();

    let mut replayed = Vec::new();
    loop {
        match next(&mut rx).await {
            JournalResponse::ReplayedTaggedMessage { persistent, tag: matched, offset } => {
                assert_eq!(matched, tag);
                replayed.push((persistent.sequence_nr, offset));
            }
            JournalResponse::RecoverySuccess { highest_sequence_nr } => return (replayed, highest_sequence_nr),
            other => panic!("unexpected tag replay response: {:?}", other),
        }
    }
}

pub async fn highest(journal: &JournalHandle, pid: &str) -> i64 {
    let (me, mut rx) = Recipient::channel();
    journal.read_highest_sequence_nr(me, pid).unwrap();
    match next(&mut rx).await {
        JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr } => highest_sequence_nr,
        other => panic!("unexpected response: {:?}", other),
    }
}

pub async fn delete_to(journal: &JournalHandle, pid: &str, to: i64) {
    let (me, mut rx) = Recipient::channel();
    journal.delete_messages_to(me, pid, to).unwrap();
    match next(&mut rx).await {
        JournalResponse::DeleteMessagesSuccess { to_sequence_nr } => assert_eq!(to_sequence_nr, to),
        other => panic!("unexpected response: {:?}", other),
    }
}

/// Poll stats until `condition` holds
pub async fn wait_for_stats(journal: &JournalHandle, condition: impl Fn(&JournalStats) -> bool) -> JournalStats {
    let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
    loop {
        let stats = journal.stats().await.unwrap();
        if condition(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stats condition not reached: {:?}",
            stats
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wraps a driver, delays every session open and tracks simultaneous sessions
#[derive(Clone)]
pub struct SlowDriver<D> {
    inner: D,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<D: StorageDriver> SlowDriver<D> {
    pub fn new(inner: D, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct ActiveSession(Arc<AtomicUsize>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SlowSession {
    inner: Box<dyn StorageSession>,
    _active: ActiveSession,
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for SlowDriver<D> {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn initialize(&self) -> JournalResult<()> {
        self.inner.initialize().await
    }

    async fn open_session(&self, transactional: bool) -> JournalResult<Box<dyn StorageSession>> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let active = ActiveSession(self.active.clone());

        tokio::time::sleep(self.delay).await;
        let inner = self.inner.open_session(transactional).await?;
        Ok(Box::new(SlowSession { inner, _active: active }))
    }

    async fn all_persistence_ids(&self) -> JournalResult<BTreeSet<String>> {
        self.inner.all_persistence_ids().await
    }
}

#[async_trait]
impl StorageSession for SlowSession {
    fn is_transactional(&self) -> bool {
        self.inner.is_transactional()
    }

    async fn insert_event(&mut self, row: &EventRow) -> JournalResult<()> {
        self.inner.insert_event(row).await
    }

    async fn highest_sequence_nr(&mut self, persistence_id: &str) -> JournalResult<i64> {
        self.inner.highest_sequence_nr(persistence_id).await
    }

    async fn events_by_persistence_id<'a>(
        &'a mut self,
        persistence_id: &'a str,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        self.inner
            .events_by_persistence_id(persistence_id, from_sequence_nr, to_sequence_nr)
            .await
    }

    async fn events_by_tag<'a>(
        &'a mut self,
        tag: &'a str,
        from_offset: i64,
        to_offset: i64,
        limit: i64,
    ) -> JournalResult<BoxStream<'a, JournalResult<StoredEvent>>> {
        self.inner.events_by_tag(tag, from_offset, to_offset, limit).await
    }

    async fn delete_events_to(&mut self, persistence_id: &str, to_sequence_nr: i64) -> JournalResult<u64> {
        self.inner.delete_events_to(persistence_id, to_sequence_nr).await
    }

    async fn upsert_metadata(&mut self, persistence_id: &str, sequence_nr: i64) -> JournalResult<()> {
        self.inner.upsert_metadata(persistence_id, sequence_nr).await
    }

    async fn commit(self: Box<Self>) -> JournalResult<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> JournalResult<()> {
        self.inner.rollback().await
    }
}
