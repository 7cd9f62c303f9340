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

//! Journal engine: the single task that owns buffer, gate and subscriptions
//!
//! ## Purpose
//! Receives [`JournalCommand`]s from handles, chunk tasks and watcher tasks, and is the
//! only place journal bookkeeping is mutated.
//!
//! ## Dispatch
//! ```text
//! Request ──> RequestBuffer ──TryDispatch──> token? ──> spawn(breaker.call(execute(chunk)))
//!                  ^                                              │
//!                  └──────── ChunkCompleted (token returned) <────┘
//! ```
//! `TryDispatch` runs after every enqueue and every completion, and keeps admitting
//! chunks while tokens and requests remain.
//!
//! ## Shutdown
//! Cancelling the token (explicitly or by dropping the last [`JournalHandle`]) stops the
//! engine, aborts in-flight chunks (their sessions roll back on drop) and stops watchers.
//! Buffered requests are dropped without responses.

use plexspaces_circuit_breaker::CircuitBreaker;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, Level};

use crate::buffer::{Chunk, RequestBuffer};
use crate::config::BatchingJournalConfig;
use crate::executor::{ChunkEffects, ChunkExecutor};
use crate::gate::ConcurrencyGate;
use crate::messages::{
    DeleteMessagesTo, JournalNotification, JournalRequest, JournalResponse, ReadHighestSequenceNr,
    ReplayMessages, ReplayTaggedMessages, SubscriptionKind, WriteMessages,
};
use crate::payload::AtomicWrite;
use crate::recipient::{Recipient, RecipientId};
use crate::serialization::{EventSerializer, IdentityEventAdapter, JsonEventSerializer, ReadEventAdapter};
use crate::storage::StorageDriver;
use crate::subscriptions::SubscriptionRegistry;
use crate::{JournalError, JournalResult};

/// Outcome of one chunk, reported back to the engine
#[derive(Debug)]
pub(crate) struct ChunkCompletion {
    pub chunk_id: u64,
    pub size: usize,
    pub read_only: bool,
    pub elapsed: Duration,
    pub outcome: JournalResult<ChunkEffects>,
}

/// Engine mailbox
#[derive(Debug)]
pub(crate) enum JournalCommand {
    Request(JournalRequest),
    Subscribe {
        kind: SubscriptionKind,
        recipient: Recipient<JournalNotification>,
    },
    Unsubscribe(RecipientId),
    Terminated(RecipientId),
    ChunkCompleted(ChunkCompletion),
    AllPersistenceIdsLoaded(JournalResult<BTreeSet<String>>),
    Stats(oneshot::Sender<JournalStats>),
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Requests waiting for a chunk
    pub buffered_requests: usize,
    /// Free concurrency tokens
    pub remaining_tokens: usize,
    /// Configured token count
    pub max_concurrent_operations: usize,
    /// Chunks handed to the executor since start
    pub chunks_dispatched: u64,
    /// Chunks that failed as a unit (breaker, session, commit, timeout)
    pub chunks_failed: u64,
    /// Distinct subscribed recipients
    pub subscribers: usize,
    /// Persistence ids in the all-ids cache
    pub known_persistence_ids: usize,
}

/// Entry point for starting a journal
pub struct BatchingJournal;

impl BatchingJournal {
    /// Builder over a storage driver
    pub fn builder<D: StorageDriver>(config: BatchingJournalConfig, driver: D) -> BatchingJournalBuilder {
        BatchingJournalBuilder {
            config,
            driver: Arc::new(driver),
            serializer: Arc::new(JsonEventSerializer::new()),
            adapter: Arc::new(IdentityEventAdapter),
        }
    }
}

/// Assembles and starts a journal engine
pub struct BatchingJournalBuilder {
    config: BatchingJournalConfig,
    driver: Arc<dyn StorageDriver>,
    serializer: Arc<dyn EventSerializer>,
    adapter: Arc<dyn ReadEventAdapter>,
}

impl BatchingJournalBuilder {
    /// Payload serializer (default: empty [`JsonEventSerializer`])
    pub fn serializer(mut self, serializer: impl EventSerializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Read-side adapter (default: [`IdentityEventAdapter`])
    pub fn event_adapter(mut self, adapter: impl ReadEventAdapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    /// Validate config, optionally create tables, and spawn the engine
    ///
    /// ## Errors
    /// - `JournalError::Configuration` for an invalid config
    /// - storage errors from table creation when `auto_initialize` is set
    pub async fn start(self) -> JournalResult<JournalHandle> {
        let config = self.config;
        config.validate()?;

        if config.auto_initialize {
            if let Err(e) = self.driver.initialize().await {
                tracing::error!(driver = self.driver.name(), error = %e, "journal initialization failed");
                return Err(e);
            }
        }

        let executed = config
            .publish_executed_requests
            .then(|| broadcast::channel(config.executed_requests_capacity).0);
        let executor = Arc::new(ChunkExecutor::new(
            self.driver.clone(),
            self.serializer,
            self.adapter,
            config.transactional,
            executed.clone(),
        ));
        let breaker = CircuitBreaker::new(config.circuit_breaker.to_breaker_config("batching-journal"));

        let (commands, mailbox) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let engine = JournalEngine {
            buffer: RequestBuffer::new(config.max_batch_size, config.max_buffer_size),
            gate: ConcurrencyGate::new(config.max_concurrent_operations),
            registry: SubscriptionRegistry::new(),
            watchers: HashMap::new(),
            executor,
            driver: self.driver,
            breaker,
            commands: commands.clone(),
            shutdown: shutdown.clone(),
            capacity: config.max_buffer_size,
            chunks_dispatched: 0,
            chunks_failed: 0,
        };

        tracing::info!(
            driver = engine.driver.name(),
            max_concurrent_operations = config.max_concurrent_operations,
            max_batch_size = config.max_batch_size,
            transactional = config.transactional,
            "batching journal started"
        );
        tokio::spawn(engine.run(mailbox));

        Ok(JournalHandle {
            commands,
            executed,
            _guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
        })
    }
}

/// Cloneable handle to a running journal
///
/// Dropping the last clone shuts the journal down.
#[derive(Clone)]
pub struct JournalHandle {
    commands: mpsc::UnboundedSender<JournalCommand>,
    shutdown: CancellationToken,
    executed: Option<broadcast::Sender<Arc<JournalRequest>>>,
    _guard: Arc<DropGuard>,
}

impl JournalHandle {
    fn command(&self, command: JournalCommand) -> JournalResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(JournalError::Shutdown);
        }
        self.commands.send(command).map_err(|_| JournalError::Shutdown)
    }

    /// Enqueue any request
    pub fn send(&self, request: impl Into<JournalRequest>) -> JournalResult<()> {
        self.command(JournalCommand::Request(request.into()))
    }

    /// Persist write groups; answers go to `target`
    pub fn write_messages(&self, target: Recipient<JournalResponse>, messages: Vec<AtomicWrite>) -> JournalResult<()> {
        self.send(WriteMessages { target, messages })
    }

    /// Replay `[from, to]` of a stream, at most `max` messages
    pub fn replay_messages(
        &self,
        target: Recipient<JournalResponse>,
        persistence_id: impl Into<String>,
        from_sequence_nr: i64,
        to_sequence_nr: i64,
        max: u64,
    ) -> JournalResult<()> {
        self.send(ReplayMessages {
            target,
            persistence_id: persistence_id.into(),
            from_sequence_nr,
            to_sequence_nr,
            max,
        })
    }

    /// Ask for the highest sequence number of a stream
    pub fn read_highest_sequence_nr(
        &self,
        target: Recipient<JournalResponse>,
        persistence_id: impl Into<String>,
    ) -> JournalResult<()> {
        self.send(ReadHighestSequenceNr {
            target,
            persistence_id: persistence_id.into(),
        })
    }

    /// Delete every event of a stream up to `to_sequence_nr`
    pub fn delete_messages_to(
        &self,
        target: Recipient<JournalResponse>,
        persistence_id: impl Into<String>,
        to_sequence_nr: i64,
    ) -> JournalResult<()> {
        self.send(DeleteMessagesTo {
            target,
            persistence_id: persistence_id.into(),
            to_sequence_nr,
        })
    }

    /// Replay events tagged `tag` with `from_offset < ordering <= to_offset`
    pub fn replay_tagged_messages(
        &self,
        reply_to: Recipient<JournalResponse>,
        tag: impl Into<String>,
        from_offset: i64,
        to_offset: i64,
        max: u64,
    ) -> JournalResult<()> {
        self.send(ReplayTaggedMessages {
            reply_to,
            tag: tag.into(),
            from_offset,
            to_offset,
            max,
        })
    }

    /// Start delivering notifications of `kind` to `recipient`
    pub fn subscribe(&self, kind: SubscriptionKind, recipient: Recipient<JournalNotification>) -> JournalResult<()> {
        self.command(JournalCommand::Subscribe { kind, recipient })
    }

    /// Remove every subscription of a recipient
    pub fn unsubscribe(&self, recipient: RecipientId) -> JournalResult<()> {
        self.command(JournalCommand::Unsubscribe(recipient))
    }

    /// Snapshot of engine counters
    pub async fn stats(&self) -> JournalResult<JournalStats> {
        let (tx, rx) = oneshot::channel();
        self.command(JournalCommand::Stats(tx))?;
        rx.await.map_err(|_| JournalError::Shutdown)
    }

    /// Receiver of successfully executed requests (`None` unless enabled in config)
    pub fn executed_requests(&self) -> Option<broadcast::Receiver<Arc<JournalRequest>>> {
        self.executed.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Stop the engine; in-flight chunks are aborted
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the journal has been shut down
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

struct JournalEngine {
    buffer: RequestBuffer,
    gate: ConcurrencyGate,
    registry: SubscriptionRegistry,
    /// Stop tokens of the per-recipient termination watchers
    watchers: HashMap<RecipientId, CancellationToken>,
    executor: Arc<ChunkExecutor>,
    driver: Arc<dyn StorageDriver>,
    breaker: CircuitBreaker,
    commands: mpsc::UnboundedSender<JournalCommand>,
    shutdown: CancellationToken,
    capacity: Option<usize>,
    chunks_dispatched: u64,
    chunks_failed: u64,
}

impl JournalEngine {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<JournalCommand>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = mailbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        if !self.buffer.is_empty() {
            tracing::warn!(
                buffered_requests = self.buffer.len(),
                "journal stopped with buffered requests"
            );
        }
        tracing::info!(
            chunks_dispatched = self.chunks_dispatched,
            chunks_failed = self.chunks_failed,
            "batching journal stopped"
        );
    }

    fn handle(&mut self, command: JournalCommand) {
        match command {
            JournalCommand::Request(request) => self.enqueue(request),
            JournalCommand::Subscribe { kind, recipient } => {
                let outcome = self.registry.subscribe(kind, recipient.clone());
                if outcome.watch {
                    self.watch(recipient);
                }
                if outcome.load_all_ids {
                    self.load_all_persistence_ids();
                }
            }
            JournalCommand::Unsubscribe(id) => {
                self.registry.remove(id);
                self.unwatch(id);
            }
            JournalCommand::Terminated(id) => {
                tracing::debug!(recipient = %id, "subscriber terminated");
                self.registry.remove(id);
                self.unwatch(id);
            }
            JournalCommand::ChunkCompleted(completion) => self.complete(completion),
            JournalCommand::AllPersistenceIdsLoaded(result) => self.registry.all_ids_loaded(result),
            JournalCommand::Stats(reply) => {
                // caller may have given up
                let _ = reply.send(self.stats());
            }
        }
    }

    fn enqueue(&mut self, request: JournalRequest) {
        metrics::counter!("plexspaces_journal_requests_total", "kind" => request.kind().as_str()).increment(1);

        if let Err(request) = self.buffer.push(request) {
            let cause = JournalError::BufferOverflow {
                capacity: self.capacity.unwrap_or_default(),
            };
            tracing::warn!(kind = request.kind().as_str(), error = %cause, "journal request refused");
            metrics::counter!("plexspaces_journal_buffer_overflow_total").increment(1);

            let target = request.reply_to();
            for response in request.failure_responses(&cause) {
                if target.tell(response).is_err() {
                    break;
                }
            }
            return;
        }
        self.try_dispatch();
    }

    fn try_dispatch(&mut self) {
        while !self.buffer.is_empty() && self.gate.try_acquire() {
            match self.buffer.next_chunk() {
                Some(chunk) => self.admit(chunk),
                None => {
                    self.gate.release();
                    break;
                }
            }
        }
        metrics::gauge!("plexspaces_journal_buffered_requests").set(self.buffer.len() as f64);
    }

    fn admit(&mut self, chunk: Chunk) {
        let chunk_id = chunk.id;
        let size = chunk.len();
        let read_only = chunk.read_only;
        self.chunks_dispatched += 1;
        tracing::debug!(
            chunk_id,
            size,
            read_only,
            remaining_tokens = self.gate.remaining(),
            "dispatching journal chunk"
        );

        let executor = self.executor.clone();
        let breaker = self.breaker.clone();
        let shutdown = self.shutdown.clone();
        let commands = self.commands.clone();
        let span = tracing::span!(Level::DEBUG, "journal.chunk", chunk_id, size, read_only);

        tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Err(JournalError::Shutdown),
                    result = breaker.call(executor.execute(chunk)) => result.map_err(JournalError::from),
                };
                let completion = ChunkCompletion {
                    chunk_id,
                    size,
                    read_only,
                    elapsed: started.elapsed(),
                    outcome,
                };
                if commands.send(JournalCommand::ChunkCompleted(completion)).is_err() {
                    tracing::debug!(chunk_id, "journal engine gone before chunk completed");
                }
            }
            .instrument(span),
        );
    }

    fn complete(&mut self, completion: ChunkCompletion) {
        self.gate.release();
        metrics::histogram!("plexspaces_journal_chunk_duration_seconds").record(completion.elapsed.as_secs_f64());

        match completion.outcome {
            Ok(effects) => {
                metrics::counter!("plexspaces_journal_chunks_total", "outcome" => "success").increment(1);
                tracing::debug!(
                    chunk_id = completion.chunk_id,
                    size = completion.size,
                    elapsed_ms = completion.elapsed.as_millis() as u64,
                    "journal chunk completed"
                );
                if !effects.is_empty() {
                    self.registry.apply(&effects);
                }
            }
            Err(e) => {
                self.chunks_failed += 1;
                metrics::counter!("plexspaces_journal_chunks_total", "outcome" => "failure").increment(1);
                tracing::warn!(
                    chunk_id = completion.chunk_id,
                    size = completion.size,
                    read_only = completion.read_only,
                    error = %e,
                    "journal chunk failed, requests left unanswered"
                );
            }
        }

        self.try_dispatch();
    }

    fn watch(&mut self, recipient: Recipient<JournalNotification>) {
        let commands = self.commands.clone();
        let stop = self.shutdown.child_token();
        if let Some(previous) = self.watchers.insert(recipient.id(), stop.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = recipient.terminated() => {
                    // engine may already be gone
                    let _ = commands.send(JournalCommand::Terminated(recipient.id()));
                }
            }
        });
    }

    fn unwatch(&mut self, id: RecipientId) {
        if let Some(stop) = self.watchers.remove(&id) {
            stop.cancel();
        }
    }

    fn load_all_persistence_ids(&self) {
        let driver = self.driver.clone();
        let commands = self.commands.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = driver.all_persistence_ids() => result,
            };
            let _ = commands.send(JournalCommand::AllPersistenceIdsLoaded(result));
        });
    }

    fn stats(&self) -> JournalStats {
        JournalStats {
            buffered_requests: self.buffer.len(),
            remaining_tokens: self.gate.remaining(),
            max_concurrent_operations: self.gate.max(),
            chunks_dispatched: self.chunks_dispatched,
            chunks_failed: self.chunks_failed,
            subscribers: self.registry.subscriber_count(),
            known_persistence_ids: self.registry.known_id_count(),
        }
    }
}
