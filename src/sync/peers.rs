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

//! Per-peer view of the chain head.

use crate::network::PeerId;

use parking_lot::Mutex;

/// Last known best block of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    /// Hash of the peer's best block.
    pub best_hash: [u8; 32],
    /// Number of the peer's best block.
    pub best_number: u64,
}

/// Best blocks claimed by the connected peers, fed by block announcements
/// and handshakes.
///
/// Shared between the strategies; interior locking makes the methods
/// callable with a shared reference.
pub struct PeerViewSet {
    views: Mutex<hashbrown::HashMap<PeerId, PeerView, fnv::FnvBuildHasher>>,
}

impl PeerViewSet {
    /// Builds a new, empty set.
    pub fn new() -> PeerViewSet {
        PeerViewSet {
            views: Mutex::new(Default::default()),
        }
    }

    /// Records the best block claimed by the given peer.
    pub fn update(&self, who: &PeerId, best_hash: [u8; 32], best_number: u64) {
        self.views.lock().insert(
            who.clone(),
            PeerView {
                best_hash,
                best_number,
            },
        );
    }

    /// Forgets everything about the given peer.
    pub fn remove(&self, who: &PeerId) {
        self.views.lock().remove(who);
    }

    /// Returns the view recorded for the given peer.
    pub fn view(&self, who: &PeerId) -> Option<PeerView> {
        self.views.lock().get(who).copied()
    }

    /// Highest best-block number any peer has claimed. Returns 0 when no
    /// view has been recorded yet.
    pub fn target(&self) -> u64 {
        self.views
            .lock()
            .values()
            .map(|view| view.best_number)
            .max()
            .unwrap_or(0)
    }

    /// Number of peers a view is recorded for.
    pub fn len(&self) -> usize {
        self.views.lock().len()
    }

    /// Returns `true` if no view has been recorded.
    pub fn is_empty(&self) -> bool {
        self.views.lock().is_empty()
    }
}

impl Default for PeerViewSet {
    fn default() -> PeerViewSet {
        PeerViewSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PeerViewSet;
    use crate::network::PeerId;

    #[test]
    fn target_is_highest_claim() {
        let views = PeerViewSet::new();
        assert_eq!(views.target(), 0);

        let alice = PeerId::from_bytes(&b"alice"[..]);
        let bob = PeerId::from_bytes(&b"bob"[..]);

        views.update(&alice, [1; 32], 10);
        views.update(&bob, [2; 32], 7);
        assert_eq!(views.target(), 10);

        // A peer revising its claim downwards lowers the target.
        views.update(&alice, [3; 32], 5);
        assert_eq!(views.target(), 7);

        views.remove(&bob);
        assert_eq!(views.target(), 5);
        assert_eq!(views.len(), 1);
    }
}
