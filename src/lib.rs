// Kestrel
// Copyright (C) 2024  Kestrel contributors
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Core of a chain synchronization engine for proof-of-authority finalized
//! chains.
//!
//! This library brings a freshly started node from its last known finalized
//! block up to the head of the chain, and contains the two primitives this
//! process is built upon:
//!
//! - The [`finality`] module: decoding and verification of GRANDPA
//!   justifications, and generation/verification of warp sync proofs (chains
//!   of authority-set handoff proofs).
//! - The [`storage`] module: a transactional overlay over a state trie,
//!   staging the mutations performed while blocks are being imported.
//!
//! The [`sync`] module ties everything together: two syncing strategies (warp
//! sync followed by full sync) and the service that schedules them, dispatches
//! their requests to remote peers, and routes the responses back.
//!
//! The library doesn't contain any networking or database code. Instead, the
//! traits in [`network`] and [`chain`] must be implemented by the embedder and
//! passed to the components defined here. Similarly, no logging subscriber is
//! ever installed; diagnostics are emitted as `tracing` events.
//!
//! All wire-visible data structures use the SCALE encoding of the reference
//! ecosystem. Block numbers are held in memory as `u64`; the number of bytes
//! they occupy on the wire varies per chain and is passed around as a
//! `block_number_bytes` parameter.

pub mod chain;
pub mod finality;
pub mod header;
pub mod informant;
pub mod network;
pub mod storage;
pub mod sync;

mod util;
