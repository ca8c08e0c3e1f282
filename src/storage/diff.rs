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

//! "Diff" between a storage and the next.
//!
//! A [`StorageDiff`] records a set of staged mutations over a base storage:
//! upserted key/value pairs, deleted keys, and, symmetrically, a sub-diff
//! per touched child trie. It additionally maintains the sorted list of all
//! mutated keys, so that `next_key`-style iteration can merge the diff with
//! the base storage without scanning it.
//!
//! A FNV hasher is used for the maps because storage keys are produced by
//! hashing and are assumed to be uniformly distributed.

use super::overlay::Trie;

use core::fmt;

#[derive(Clone, Default)]
pub struct StorageDiff {
    /// Keys whose value is overwritten by this diff.
    upserts: hashbrown::HashMap<Vec<u8>, Vec<u8>, fnv::FnvBuildHasher>,

    /// Keys deleted by this diff. Never overlaps with
    /// [`StorageDiff::upserts`].
    deletes: hashbrown::HashSet<Vec<u8>, fnv::FnvBuildHasher>,

    /// Sorted union of the keys of [`StorageDiff::upserts`] and
    /// [`StorageDiff::deletes`].
    sorted_keys: Vec<Vec<u8>>,

    /// Staged mutations of child tries, keyed by child trie key.
    child_change_set: hashbrown::HashMap<Vec<u8>, StorageDiff, fnv::FnvBuildHasher>,
}

impl StorageDiff {
    /// Builds a new empty diff.
    pub fn empty() -> StorageDiff {
        StorageDiff::default()
    }

    /// Returns `true` if the diff stages no mutation at all.
    pub fn is_empty(&self) -> bool {
        self.sorted_keys.is_empty() && self.child_change_set.is_empty()
    }

    /// Records an upsert of the given key.
    pub fn upsert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        self.deletes.remove(&key);
        self.index_insert(&key);
        self.upserts.insert(key, value.into());
    }

    /// Records the deletion of the given key, dropping any staged upsert for
    /// it.
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.upserts.remove(&key);
        self.index_insert(&key);
        self.deletes.insert(key);
    }

    /// Returns the diff entry for the given key.
    ///
    /// Returns `None` if the diff doesn't stage anything for this key,
    /// `Some(None)` if it stages a deletion, and `Some(Some(value))` if it
    /// stages an upsert.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        if self.deletes.contains(key) {
            return Some(None);
        }
        self.upserts.get(key).map(|value| Some(&value[..]))
    }

    /// Returns `true` if the diff stages a deletion of the given key.
    pub fn is_deleted(&self, key: &[u8]) -> bool {
        self.deletes.contains(key)
    }

    /// Returns the first mutated key strictly greater than `key`, whether it
    /// is an upsert or a deletion.
    pub fn next_key_after(&self, key: &[u8]) -> Option<&[u8]> {
        let index = match self
            .sorted_keys
            .binary_search_by(|entry| entry.as_slice().cmp(key))
        {
            Ok(index) => index + 1,
            Err(index) => index,
        };
        self.sorted_keys.get(index).map(|k| &k[..])
    }

    /// Records the deletion of every key starting with `prefix`.
    ///
    /// `state_keys` must be the ordered list of keys with that prefix that
    /// exist in the base storage this diff applies to. Keys staged as
    /// upserts by this diff are deleted as well.
    ///
    /// `limit`, if provided, caps the number of deletions. Returns
    /// `(loops, deleted, all_deleted)` where `loops` counts all the keys
    /// processed, `deleted` counts the ones that existed in the base
    /// storage, and `all_deleted` is `false` if the limit interrupted the
    /// sweep.
    pub fn clear_prefix(
        &mut self,
        prefix: &[u8],
        state_keys: &[Vec<u8>],
        limit: Option<u32>,
    ) -> (u32, u32, bool) {
        // Merged ordered list of candidates, with a flag indicating whether
        // the key exists in the base storage.
        let mut candidates: Vec<(Vec<u8>, bool)> = state_keys
            .iter()
            .filter(|key| key.starts_with(prefix))
            .map(|key| (key.clone(), true))
            .collect();
        for key in self.upserts.keys().filter(|key| key.starts_with(prefix)) {
            if !state_keys.contains(key) {
                candidates.push((key.clone(), false));
            }
        }
        candidates.sort();

        let mut loops = 0u32;
        let mut deleted = 0u32;
        for (key, in_state) in candidates {
            if self.deletes.contains(&key) {
                continue;
            }
            if limit.map_or(false, |limit| deleted >= limit) {
                return (loops, deleted, false);
            }

            self.delete(key);
            loops += 1;
            if in_state {
                deleted += 1;
            }
        }

        (loops, deleted, true)
    }

    /// Records an upsert inside the child trie identified by `child_key`.
    pub fn upsert_child(
        &mut self,
        child_key: impl Into<Vec<u8>>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) {
        self.child_change_set
            .entry(child_key.into())
            .or_default()
            .upsert(key, value);
    }

    /// Records a deletion inside the child trie identified by `child_key`.
    pub fn delete_from_child(&mut self, child_key: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) {
        self.child_change_set
            .entry(child_key.into())
            .or_default()
            .delete(key);
    }

    /// Returns the sub-diff staged for the child trie identified by
    /// `child_key`, if any.
    pub fn child(&self, child_key: &[u8]) -> Option<&StorageDiff> {
        self.child_change_set.get(child_key)
    }

    /// Applies the given diff on top of this one. Upserts overwrite, deletes
    /// accumulate, and child diffs are merged recursively.
    pub fn merge(&mut self, other: StorageDiff) {
        for (key, value) in other.upserts {
            self.upsert(key, value);
        }
        for key in other.deletes {
            self.delete(key);
        }
        for (child_key, child_diff) in other.child_change_set {
            match self.child_change_set.entry(child_key) {
                hashbrown::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().merge(child_diff)
                }
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(child_diff);
                }
            }
        }
    }

    /// Flushes every staged mutation into the given trie.
    ///
    /// A deletion of a child trie key at this diff's level overrides all
    /// operations staged for that child.
    pub(crate) fn apply_to_trie<T: Trie>(self, trie: &mut T) {
        let StorageDiff {
            upserts,
            deletes,
            child_change_set,
            ..
        } = self;

        for (key, value) in upserts {
            trie.insert(&key, &value);
        }

        for (child_key, child_diff) in child_change_set {
            if deletes.contains(&child_key) {
                continue;
            }
            for (key, value) in child_diff.upserts {
                trie.child_insert(&child_key, &key, &value);
            }
            for key in child_diff.deletes {
                trie.child_remove(&child_key, &key);
            }
        }

        for key in deletes {
            trie.remove(&key);
        }
    }

    /// Iterates over the staged upserts, in no particular order.
    pub fn upserts_unordered(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.upserts.iter().map(|(k, v)| (&k[..], &v[..]))
    }

    /// Iterates over the staged deletions, in no particular order.
    pub fn deletes_unordered(&self) -> impl Iterator<Item = &[u8]> {
        self.deletes.iter().map(|k| &k[..])
    }

    fn index_insert(&mut self, key: &[u8]) {
        if let Err(index) = self
            .sorted_keys
            .binary_search_by(|entry| entry.as_slice().cmp(key))
        {
            self.sorted_keys.insert(index, key.to_vec());
        }
    }

    /// Checks the internal invariant tying [`StorageDiff::sorted_keys`] to
    /// the maps. Test-only.
    #[cfg(test)]
    fn assert_invariant(&self) {
        let mut expected: Vec<&[u8]> = self
            .upserts
            .keys()
            .chain(self.deletes.iter())
            .map(|k| &k[..])
            .collect();
        expected.sort();
        expected.dedup();
        assert_eq!(
            self.sorted_keys.iter().map(|k| &k[..]).collect::<Vec<_>>(),
            expected
        );
        assert!(self.upserts.keys().all(|k| !self.deletes.contains(k)));
    }
}

impl fmt::Debug for StorageDiff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StorageDiff")
            .field("upserts", &self.upserts.len())
            .field("deletes", &self.deletes.len())
            .field("children", &self.child_change_set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::StorageDiff;

    #[test]
    fn upsert_then_delete() {
        let mut diff = StorageDiff::empty();
        diff.upsert(&b"a"[..], &b"1"[..]);
        diff.assert_invariant();
        assert_eq!(diff.get(b"a"), Some(Some(&b"1"[..])));

        diff.delete(&b"a"[..]);
        diff.assert_invariant();
        assert_eq!(diff.get(b"a"), Some(None));

        diff.upsert(&b"a"[..], &b"2"[..]);
        diff.assert_invariant();
        assert_eq!(diff.get(b"a"), Some(Some(&b"2"[..])));
        assert_eq!(diff.get(b"b"), None);
    }

    #[test]
    fn next_key_includes_deletions() {
        let mut diff = StorageDiff::empty();
        diff.upsert(&b"a"[..], &b"1"[..]);
        diff.delete(&b"c"[..]);
        diff.upsert(&b"e"[..], &b"2"[..]);

        assert_eq!(diff.next_key_after(b""), Some(&b"a"[..]));
        assert_eq!(diff.next_key_after(b"a"), Some(&b"c"[..]));
        assert_eq!(diff.next_key_after(b"b"), Some(&b"c"[..]));
        assert_eq!(diff.next_key_after(b"c"), Some(&b"e"[..]));
        assert_eq!(diff.next_key_after(b"e"), None);
    }

    #[test]
    fn clear_prefix_sweeps_state_and_upserts() {
        let mut diff = StorageDiff::empty();
        diff.upsert(&b"p1"[..], &b"x"[..]);
        diff.upsert(&b"q"[..], &b"y"[..]);

        let state_keys = vec![b"p0".to_vec(), b"p2".to_vec()];
        let (loops, deleted, all_deleted) = diff.clear_prefix(b"p", &state_keys, None);
        diff.assert_invariant();

        // "p0" and "p2" existed in the state, "p1" only in the diff.
        assert_eq!((loops, deleted, all_deleted), (3, 2, true));
        assert_eq!(diff.get(b"p0"), Some(None));
        assert_eq!(diff.get(b"p1"), Some(None));
        assert_eq!(diff.get(b"p2"), Some(None));
        assert_eq!(diff.get(b"q"), Some(Some(&b"y"[..])));
    }

    #[test]
    fn clear_prefix_respects_limit() {
        let mut diff = StorageDiff::empty();
        let state_keys = vec![b"p0".to_vec(), b"p1".to_vec(), b"p2".to_vec()];

        let (loops, deleted, all_deleted) = diff.clear_prefix(b"p", &state_keys, Some(2));
        assert_eq!((loops, deleted, all_deleted), (2, 2, false));
        assert_eq!(diff.get(b"p2"), None);
    }

    #[test]
    fn merge_overwrites_and_accumulates() {
        let mut base = StorageDiff::empty();
        base.upsert(&b"a"[..], &b"1"[..]);
        base.upsert(&b"b"[..], &b"1"[..]);
        base.upsert_child(&b"child"[..], &b"k"[..], &b"1"[..]);

        let mut top = StorageDiff::empty();
        top.upsert(&b"a"[..], &b"2"[..]);
        top.delete(&b"b"[..]);
        top.delete_from_child(&b"child"[..], &b"k"[..]);

        base.merge(top);
        base.assert_invariant();

        assert_eq!(base.get(b"a"), Some(Some(&b"2"[..])));
        assert_eq!(base.get(b"b"), Some(None));
        assert_eq!(base.child(b"child").unwrap().get(b"k"), Some(None));
    }
}
