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

//! Token bucket bounding in-flight chunks
//!
//! Owned by the engine task, so plain integers suffice. One token is taken when a chunk
//! is dispatched and returned when its completion arrives, whatever the outcome.

#[derive(Debug)]
pub(crate) struct ConcurrencyGate {
    max: usize,
    remaining: usize,
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self { max, remaining: max }
    }

    /// Take a token if one is available
    pub fn try_acquire(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Return a token
    pub fn release(&mut self) {
        if self.remaining < self.max {
            self.remaining += 1;
        } else {
            tracing::warn!(max = self.max, "journal gate released more tokens than acquired");
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn max(&self) -> usize {
        self.max
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.max - self.remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_bounded() {
        let mut gate = ConcurrencyGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert_eq!(gate.in_flight(), 2);

        gate.release();
        assert_eq!(gate.remaining(), 1);
        assert!(gate.try_acquire());
    }

    #[test]
    fn test_release_never_exceeds_max() {
        let mut gate = ConcurrencyGate::new(1);
        gate.release();
        assert_eq!(gate.remaining(), 1);
        assert_eq!(gate.max(), 1);
    }
}
