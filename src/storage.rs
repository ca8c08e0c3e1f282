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

//! Staging of state trie mutations during block execution.
//!
//! While a block is being imported, the runtime performs storage writes that
//! must be discardable as a whole: a failed extrinsic rolls back its own
//! writes, and the runtime may open arbitrarily nested transactions. The
//! [`overlay::TrieState`] type wraps the state trie of the chain and buffers
//! all mutations in a stack of [`diff::StorageDiff`]s until the outermost
//! transaction commits.

pub mod diff;
pub mod overlay;
