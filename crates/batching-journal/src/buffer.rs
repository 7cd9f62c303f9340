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

//! FIFO request buffer and chunking

use std::collections::VecDeque;

use crate::messages::JournalRequest;

/// Requests executed together in one storage session
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Monotonic id for logs
    pub id: u64,
    /// Requests in arrival order
    pub requests: Vec<JournalRequest>,
    /// Every request is a replay or a read-highest
    pub read_only: bool,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Pending requests in arrival order
#[derive(Debug)]
pub(crate) struct RequestBuffer {
    queue: VecDeque<JournalRequest>,
    max_batch_size: usize,
    capacity: Option<usize>,
    next_chunk_id: u64,
}

impl RequestBuffer {
    pub fn new(max_batch_size: usize, capacity: Option<usize>) -> Self {
        Self {
            queue: VecDeque::new(),
            max_batch_size: max_batch_size.max(1),
            capacity,
            next_chunk_id: 1,
        }
    }

    /// Append a request, handing it back when the buffer is full
    pub fn push(&mut self, request: JournalRequest) -> Result<(), JournalRequest> {
        if let Some(capacity) = self.capacity {
            if self.queue.len() >= capacity {
                return Err(request);
            }
        }
        self.queue.push_back(request);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Remove up to `max_batch_size` requests from the front
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        if self.queue.is_empty() {
            return None;
        }
        let take = self.queue.len().min(self.max_batch_size);
        let requests: Vec<JournalRequest> = self.queue.drain(..take).collect();
        let read_only = requests.iter().all(JournalRequest::is_read_only);

        let id = self.next_chunk_id;
        self.next_chunk_id += 1;

        Some(Chunk {
            id,
            requests,
            read_only,
        })
    }
}
