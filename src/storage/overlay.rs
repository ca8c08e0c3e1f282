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

//! Transactional view over the state trie.
//!
//! [`TrieState`] wraps a [`Trie`] and maintains a stack of
//! [`StorageDiff`]s, one per open transaction. Reads consult the top of the
//! stack before falling back to the trie; writes only touch the top of the
//! stack. Committing the outermost transaction flushes everything into the
//! trie; rolling back discards the top diff.
//!
//! Opening a transaction snapshots the current top of the stack, so the top
//! diff always contains the full set of mutations staged since the
//! outermost transaction began. Committing a nested transaction therefore
//! reduces to merging the top diff into its parent.
//!
//! All methods lock an internal reader-writer lock; concurrent readers are
//! allowed, writers are exclusive.

use super::diff::StorageDiff;

use parking_lot::RwLock;

/// The state trie the overlay stages mutations for.
///
/// Keys anchoring a child trie must be handled by [`Trie::remove`] as well:
/// removing such a key drops the whole child trie.
pub trait Trie {
    /// Returns the value associated with the given key.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Inserts a key/value pair, overwriting any previous value.
    fn insert(&mut self, key: &[u8], value: &[u8]);

    /// Removes a key and its value. Also drops the child trie anchored at
    /// `key`, if any.
    fn remove(&mut self, key: &[u8]);

    /// Returns the first key strictly greater than `key`, in lexicographic
    /// order.
    fn next_key(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Returns, in lexicographic order, every key starting with `prefix`.
    fn prefixed_keys(&self, prefix: &[u8]) -> Vec<Vec<u8>>;

    /// Removes every key starting with `prefix`, up to `limit` removals.
    /// Returns the number of keys removed and whether none remain.
    fn clear_prefix(&mut self, prefix: &[u8], limit: Option<u32>) -> (u32, bool);

    /// Returns the Merkle root of the trie.
    fn root(&mut self) -> [u8; 32];

    /// Returns the value associated with `key` inside the child trie
    /// anchored at `child_key`.
    fn child_get(&self, child_key: &[u8], key: &[u8]) -> Option<Vec<u8>>;

    /// Inserts a key/value pair inside a child trie, creating the child trie
    /// if it doesn't exist yet.
    fn child_insert(&mut self, child_key: &[u8], key: &[u8], value: &[u8]);

    /// Removes a key from a child trie.
    fn child_remove(&mut self, child_key: &[u8], key: &[u8]);

    /// Returns the first key strictly greater than `key` inside a child
    /// trie.
    fn child_next_key(&self, child_key: &[u8], key: &[u8]) -> Option<Vec<u8>>;

    /// Drops the child trie anchored at `child_key` and all its content.
    fn delete_child(&mut self, child_key: &[u8]);
}

/// Transactional overlay over a [`Trie`].
pub struct TrieState<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    state: T,
    /// One diff per open transaction, innermost last. Each diff is a
    /// superset of its parent, see the module documentation.
    transactions: Vec<StorageDiff>,
}

impl<T: Trie> TrieState<T> {
    /// Wraps the given trie.
    pub fn new(state: T) -> TrieState<T> {
        TrieState {
            inner: RwLock::new(Inner {
                state,
                transactions: Vec::new(),
            }),
        }
    }

    /// Begins a new transaction. All mutations performed until the matching
    /// [`TrieState::commit_transaction`] or
    /// [`TrieState::rollback_transaction`] are staged together.
    pub fn start_transaction(&self) {
        let mut inner = self.inner.write();
        let snapshot = inner.transactions.last().cloned().unwrap_or_default();
        inner.transactions.push(snapshot);
    }

    /// Discards every mutation staged since the matching
    /// [`TrieState::start_transaction`].
    ///
    /// # Panic
    ///
    /// Panics if no transaction is open.
    pub fn rollback_transaction(&self) {
        let mut inner = self.inner.write();
        assert!(
            inner.transactions.pop().is_some(),
            "no open transaction to rollback"
        );
    }

    /// Commits the innermost transaction: merges it into its parent, or, if
    /// it is the outermost one, flushes every staged mutation into the
    /// trie.
    ///
    /// # Panic
    ///
    /// Panics if no transaction is open.
    pub fn commit_transaction(&self) {
        let mut inner = self.inner.write();
        let committed = match inner.transactions.pop() {
            Some(diff) => diff,
            None => panic!("no open transaction to commit"),
        };

        match inner.transactions.last_mut() {
            Some(parent) => parent.merge(committed),
            None => committed.apply_to_trie(&mut inner.state),
        }
    }

    /// Number of transactions currently open.
    pub fn open_transactions(&self) -> usize {
        self.inner.read().transactions.len()
    }

    /// Returns the Merkle root of the trie.
    ///
    /// # Panic
    ///
    /// Panics if a transaction is still open, as the staged mutations
    /// wouldn't be reflected in the returned root.
    pub fn root(&self) -> [u8; 32] {
        let mut inner = self.inner.write();
        assert!(
            inner.transactions.is_empty(),
            "root computed with an open transaction"
        );
        inner.state.root()
    }

    /// Sets the value of the given key.
    pub fn put(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.write();
        match inner.transactions.last_mut() {
            Some(top) => top.upsert(key, value),
            None => inner.state.insert(key, value),
        }
    }

    /// Returns the value of the given key, taking staged mutations into
    /// account.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        if let Some(top) = inner.transactions.last() {
            if let Some(staged) = top.get(key) {
                return staged.map(|value| value.to_vec());
            }
        }
        inner.state.get(key)
    }

    /// Returns `true` if the given key has a value.
    pub fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Deletes the given key.
    pub fn delete(&self, key: &[u8]) {
        let mut inner = self.inner.write();
        match inner.transactions.last_mut() {
            Some(top) => top.delete(key),
            None => inner.state.remove(key),
        }
    }

    /// Returns the first key strictly greater than `key`, merging the
    /// staged mutations with the trie content.
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        let top = match inner.transactions.last() {
            Some(top) => top,
            None => return inner.state.next_key(key),
        };

        let in_diff = top.next_key_after(key).map(|k| k.to_vec());

        // First key of the trie after `key` that the diff doesn't delete.
        let mut in_state = None;
        let mut cursor = key.to_vec();
        while let Some(next) = inner.state.next_key(&cursor) {
            if !top.is_deleted(&next) {
                in_state = Some(next);
                break;
            }
            cursor = next;
        }

        match (in_diff, in_state) {
            (Some(a), Some(b)) => Some(if a < b { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    /// Deletes every key starting with `prefix`.
    pub fn clear_prefix(&self, prefix: &[u8]) {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        match inner.transactions.last_mut() {
            Some(top) => {
                let state_keys = inner.state.prefixed_keys(prefix);
                let _ = top.clear_prefix(prefix, &state_keys, None);
            }
            None => {
                let _ = inner.state.clear_prefix(prefix, None);
            }
        }
    }

    /// Deletes keys starting with `prefix` until `limit` deletions have
    /// been performed. Returns `(loops, deleted, all_deleted)`.
    pub fn clear_prefix_limit(&self, prefix: &[u8], limit: u32) -> (u32, u32, bool) {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        match inner.transactions.last_mut() {
            Some(top) => {
                let state_keys = inner.state.prefixed_keys(prefix);
                top.clear_prefix(prefix, &state_keys, Some(limit))
            }
            None => {
                let (deleted, all_deleted) = inner.state.clear_prefix(prefix, Some(limit));
                (0, deleted, all_deleted)
            }
        }
    }

    /// Sets the value of a key inside a child trie.
    pub fn set_child_storage(&self, child_key: &[u8], key: &[u8], value: &[u8]) {
        let mut inner = self.inner.write();
        match inner.transactions.last_mut() {
            Some(top) => top.upsert_child(child_key, key, value),
            None => inner.state.child_insert(child_key, key, value),
        }
    }

    /// Returns the value of a key inside a child trie.
    ///
    /// A staged deletion of the whole child trie hides all its content,
    /// including content staged before the deletion.
    pub fn get_child_storage(&self, child_key: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        if let Some(top) = inner.transactions.last() {
            if top.is_deleted(child_key) {
                return None;
            }
            if let Some(child_diff) = top.child(child_key) {
                if let Some(staged) = child_diff.get(key) {
                    return staged.map(|value| value.to_vec());
                }
            }
        }
        inner.state.child_get(child_key, key)
    }

    /// Deletes a key inside a child trie.
    pub fn clear_child_storage(&self, child_key: &[u8], key: &[u8]) {
        let mut inner = self.inner.write();
        match inner.transactions.last_mut() {
            Some(top) => top.delete_from_child(child_key, key),
            None => inner.state.child_remove(child_key, key),
        }
    }

    /// Deletes a whole child trie. Overrides any operation staged for that
    /// child.
    pub fn delete_child(&self, child_key: &[u8]) {
        let mut inner = self.inner.write();
        match inner.transactions.last_mut() {
            Some(top) => top.delete(child_key),
            None => inner.state.delete_child(child_key),
        }
    }

    /// Returns the first key strictly greater than `key` inside a child
    /// trie, merging the staged mutations with the trie content.
    ///
    /// Returns `None` if the child trie is staged for deletion.
    pub fn child_next_key(&self, child_key: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        let top = match inner.transactions.last() {
            Some(top) => top,
            None => return inner.state.child_next_key(child_key, key),
        };

        if top.is_deleted(child_key) {
            return None;
        }

        let child_diff = match top.child(child_key) {
            Some(child_diff) => child_diff,
            None => return inner.state.child_next_key(child_key, key),
        };

        let in_diff = child_diff.next_key_after(key).map(|k| k.to_vec());

        let mut in_state = None;
        let mut cursor = key.to_vec();
        while let Some(next) = inner.state.child_next_key(child_key, &cursor) {
            if !child_diff.is_deleted(&next) {
                in_state = Some(next);
                break;
            }
            cursor = next;
        }

        match (in_diff, in_state) {
            (Some(a), Some(b)) => Some(if a < b { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}
