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

//! Concurrency, backpressure and circuit breaker tests
//!
//! Tests verify that:
//! - No more than `max_concurrent_operations` chunks touch storage at once
//! - Requests arriving while chunks are in flight are batched together
//! - A bounded buffer refuses overflow with typed failures
//! - An open breaker fails chunks silently without opening sessions

mod common;

use common::*;
use plexspaces_batching_journal::*;
use std::time::Duration;

fn config(max_concurrent: usize, max_batch: usize) -> BatchingJournalConfig {
    BatchingJournalConfig::builder()
        .auto_initialize(true)
        .max_concurrent_operations(max_concurrent)
        .max_batch_size(max_batch)
        .build()
}

#[tokio::test]
async fn test_concurrent_chunks_never_exceed_limit() {
    let driver = SlowDriver::new(MemoryStorageDriver::new(), Duration::from_millis(100));
    let journal = start_journal(config(2, 1), driver.clone()).await;

    let (me, mut rx) = Recipient::channel();
    for i in 0..8 {
        journal.read_highest_sequence_nr(me.clone(), format!("p-{}", i)).unwrap();
    }
    for _ in 0..8 {
        assert!(matches!(
            next(&mut rx).await,
            JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr: 0 }
        ));
    }

    assert_eq!(driver.peak(), 2);
    let stats = wait_for_stats(&journal, |s| s.remaining_tokens == 2).await;
    assert_eq!(stats.chunks_dispatched, 8);
    assert_eq!(driver.active(), 0);
}

#[tokio::test]
async fn test_requests_buffered_behind_busy_gate_share_a_chunk() {
    let driver = SlowDriver::new(MemoryStorageDriver::new(), Duration::from_millis(100));
    let journal = start_journal(config(1, 10), driver.clone()).await;

    let (me, mut rx) = Recipient::channel();
    for i in 0..6 {
        journal.read_highest_sequence_nr(me.clone(), format!("p-{}", i)).unwrap();
    }
    for _ in 0..6 {
        next(&mut rx).await;
    }

    // first request runs alone, the other five wait and go out together
    let stats = wait_for_stats(&journal, |s| s.remaining_tokens == 1).await;
    assert_eq!(stats.chunks_dispatched, 2);
    assert_eq!(driver.peak(), 1);
}

#[tokio::test]
async fn test_buffer_overflow_is_answered_immediately() {
    let driver = SlowDriver::new(MemoryStorageDriver::new(), Duration::from_millis(300));
    let config = BatchingJournalConfig::builder()
        .auto_initialize(true)
        .max_concurrent_operations(1)
        .max_buffer_size(1)
        .build();
    let journal = start_journal(config, driver).await;

    let (in_flight, mut in_flight_rx) = Recipient::channel();
    let (buffered, mut buffered_rx) = Recipient::channel();
    let (refused, mut refused_rx) = Recipient::channel();

    journal.read_highest_sequence_nr(in_flight, "a").unwrap();
    journal.read_highest_sequence_nr(buffered, "b").unwrap();
    journal.write_messages(refused, vec![group("c", [1, 2])]).unwrap();

    assert!(matches!(
        next(&mut refused_rx).await,
        JournalResponse::WriteMessagesFailed {
            cause: JournalError::BufferOverflow { capacity: 1 },
            write_count: 2
        }
    ));
    for _ in 0..2 {
        assert!(matches!(
            next(&mut refused_rx).await,
            JournalResponse::WriteMessageRejected { cause: JournalError::BufferOverflow { .. }, .. }
        ));
    }

    assert!(matches!(
        next(&mut in_flight_rx).await,
        JournalResponse::ReadHighestSequenceNrSuccess { .. }
    ));
    assert!(matches!(
        next(&mut buffered_rx).await,
        JournalResponse::ReadHighestSequenceNrSuccess { .. }
    ));
}

#[tokio::test]
async fn test_open_breaker_fails_chunks_without_touching_storage() {
    let driver = MemoryStorageDriver::new();
    driver
        .fail_session_opens(Some(JournalError::Connection("database unavailable".into())))
        .await;
    let config = BatchingJournalConfig::builder()
        .auto_initialize(true)
        .max_failures(1)
        .reset_timeout(Duration::from_secs(60))
        .build();
    let journal = start_journal(config, driver.clone()).await;

    let (me, mut rx) = Recipient::channel();
    journal.read_highest_sequence_nr(me.clone(), "acct-1").unwrap();
    assert_silent(&mut rx).await;
    wait_for_stats(&journal, |s| s.chunks_failed == 1).await;
    assert_eq!(driver.session_opens(), 1);

    // storage is back, but the breaker stays open until the reset timeout
    driver.clear_faults().await;
    journal.read_highest_sequence_nr(me.clone(), "acct-1").unwrap();
    assert_silent(&mut rx).await;

    let stats = wait_for_stats(&journal, |s| s.chunks_failed == 2).await;
    assert_eq!(stats.remaining_tokens, stats.max_concurrent_operations);
    assert_eq!(driver.session_opens(), 1);
}

#[tokio::test]
async fn test_breaker_recovers_after_reset_timeout() {
    let driver = MemoryStorageDriver::new();
    driver
        .fail_session_opens(Some(JournalError::Connection("database unavailable".into())))
        .await;
    let config = BatchingJournalConfig::builder()
        .auto_initialize(true)
        .max_failures(1)
        .reset_timeout(Duration::from_millis(200))
        .build();
    let journal = start_journal(config, driver.clone()).await;

    let (me, mut rx) = Recipient::channel();
    journal.read_highest_sequence_nr(me.clone(), "acct-1").unwrap();
    wait_for_stats(&journal, |s| s.chunks_failed == 1).await;

    driver.clear_faults().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    journal.read_highest_sequence_nr(me, "acct-1").unwrap();
    assert!(matches!(
        next(&mut rx).await,
        JournalResponse::ReadHighestSequenceNrSuccess { highest_sequence_nr: 0 }
    ));
}

#[tokio::test]
async fn test_slow_chunk_times_out_silently() {
    let driver = SlowDriver::new(MemoryStorageDriver::new(), Duration::from_millis(500));
    let config = BatchingJournalConfig::builder()
        .auto_initialize(true)
        .call_timeout(Duration::from_millis(50))
        .build();
    let journal = start_journal(config, driver.clone()).await;

    let (me, mut rx) = Recipient::channel();
    journal.read_highest_sequence_nr(me, "acct-1").unwrap();
    assert_silent(&mut rx).await;

    let stats = wait_for_stats(&journal, |s| s.chunks_failed == 1).await;
    assert_eq!(stats.remaining_tokens, stats.max_concurrent_operations);
    assert_eq!(driver.active(), 0);
}
