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

//! Access to the locally stored chain.
//!
//! The synchronization engine doesn't directly own a database. Instead, the
//! embedder provides implementations of the traits below, backed by whatever
//! storage layer the node uses.

use crate::header::{GrandpaAuthority, Header};
use crate::network::BlockData;

/// Access to the blocks, headers and justifications known locally.
///
/// Implementations must be safe to call from multiple threads; the sync
/// service, the strategies and the warp sync proof provider all share one
/// instance.
pub trait BlockState: Send + Sync {
    /// Returns the header of the best (non-finalized) block.
    fn best_block_header(&self) -> Header;

    /// Returns the number of the best block.
    fn best_block_number(&self) -> u64 {
        self.best_block_header().number
    }

    /// Returns the header of the highest finalized block.
    fn highest_finalized_header(&self) -> Header;

    /// Returns the header of the block with the given hash, if known.
    fn header(&self, hash: &[u8; 32]) -> Option<Header>;

    /// Returns the header of the canonical block at the given height, if
    /// known.
    fn header_by_number(&self, number: u64) -> Option<Header>;

    /// Returns the encoded justification stored for the given block, if any.
    fn justification(&self, hash: &[u8; 32]) -> Option<Vec<u8>>;

    /// Returns `true` if the header of the given block is known locally.
    fn has_header(&self, hash: &[u8; 32]) -> bool {
        self.header(hash).is_some()
    }

    /// Atomically inserts the parts of `block` that aren't stored yet.
    fn compare_and_set_block_data(&self, block: &BlockData) -> Result<(), ImportError>;
}

/// Error potentially returned by [`BlockState::compare_and_set_block_data`].
#[derive(Debug, derive_more::Display, Clone)]
pub enum ImportError {
    /// The parent of the block isn't known locally.
    UnknownParent,
    /// The block data is inconsistent, for instance a body that doesn't
    /// match the extrinsics root of its header.
    InconsistentBlock,
    /// The underlying storage layer failed.
    Storage,
}

/// Access to the history of GRANDPA authority sets.
pub trait AuthoritySetState: Send + Sync {
    /// Returns the id of the authority set that will finalize the children
    /// of the highest finalized block.
    fn current_set_id(&self) -> u64;

    /// Returns the members of the authority set with the given id, if known.
    fn authorities(&self, set_id: u64) -> Option<Vec<GrandpaAuthority>>;

    /// Returns, in ascending order, the numbers of the finalized blocks
    /// strictly after `number` whose enactment changed the authority set.
    fn authority_set_changes_after(&self, number: u64) -> Vec<u64>;
}
