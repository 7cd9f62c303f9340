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

//! # PlexSpaces Circuit Breaker
//!
//! ## Purpose
//! Failure isolation for calls into slow or failing dependencies (databases, remote
//! services). A tripped breaker fails calls immediately instead of letting them pile up
//! behind a dependency that is already struggling.
//!
//! ### State Machine
//! ```text
//!   ┌─────────┐  max_failures consecutive  ┌──────────┐
//!   │ Closed  │───────────────────────────>│   Open   │
//!   │         │<──────────┐                │          │
//!   └─────────┘           │                └────┬─────┘
//!                trial ok │                     │ reset_timeout elapsed
//!                         │                ┌────▼──────┐
//!                         └────────────────│ Half-Open │── trial failed ──> Open
//!                                          └───────────┘
//! ```
//!
//! ## Key Components
//! - [`CircuitBreaker`][]: shared breaker handle (cheap to clone)
//! - [`CircuitBreakerConfig`][]: `max_failures`, `call_timeout`, `reset_timeout`
//! - [`CircuitState`][]: Closed, Open, Half-Open
//! - [`CircuitBreakerMetrics`][]: counters snapshot for monitoring
//!
//! ## Examples
//!
//! ### Guarding a Storage Call
//! ```rust,no_run
//! # use plexspaces_circuit_breaker::*;
//! # use std::time::Duration;
//! # async fn example() {
//! let circuit = CircuitBreaker::new(CircuitBreakerConfig {
//!     name: "journal".to_string(),
//!     max_failures: 5,
//!     call_timeout: Duration::from_secs(20),
//!     reset_timeout: Duration::from_secs(60),
//!     ..Default::default()
//! });
//!
//! match circuit.call(async { Ok::<_, String>(42) }).await {
//!     Ok(value) => println!("value: {}", value),
//!     Err(CallError::Rejected(e)) => println!("fail fast: {}", e),
//!     Err(CallError::Timeout(after)) => println!("timed out after {:?}", after),
//!     Err(CallError::Failed(e)) => println!("call failed: {}", e),
//! }
//! # }
//! ```
//!
//! ## Known Limitations
//! - **No Distributed State**: each instance keeps local counters
//! - **Consecutive Failures Only**: no sliding window or error-rate detection

#![warn(missing_docs)]
#![warn(clippy::all)]

mod circuit_breaker;

pub use circuit_breaker::*;
