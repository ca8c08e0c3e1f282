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

//! Pool of peers requests are dispatched to.
//!
//! Peers become workers when they send a block-announces handshake, and stop
//! being workers when they disconnect or when a strategy bans them. The pool
//! is the only writer of its worker set; request dispatch reads a snapshot
//! of it and never holds the lock across a network round trip.

use super::{SyncTask, SyncTaskResult};
use crate::network::PeerId;

use futures::future;
use parking_lot::Mutex;

/// Thread-safe set of worker peers, plus the dispatch logic.
pub struct SyncWorkerPool {
    inner: Mutex<Pool>,
}

#[derive(Default)]
struct Pool {
    workers: hashbrown::HashSet<PeerId, fnv::FnvBuildHasher>,
    /// Peers that misbehaved; never re-admitted as workers.
    ignored: hashbrown::HashSet<PeerId, fnv::FnvBuildHasher>,
}

impl SyncWorkerPool {
    /// Builds a new, empty pool.
    pub fn new() -> SyncWorkerPool {
        SyncWorkerPool {
            inner: Mutex::new(Pool::default()),
        }
    }

    /// Admits a peer as a worker, typically because it sent a
    /// block-announces handshake. Ignored peers are not re-admitted;
    /// returns `false` in that case.
    pub fn add_worker(&self, who: &PeerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.ignored.contains(who) {
            return false;
        }
        inner.workers.insert(who.clone());
        true
    }

    /// Removes a worker, typically because it disconnected. It may be
    /// re-admitted later.
    pub fn remove_worker(&self, who: &PeerId) {
        self.inner.lock().workers.remove(who);
    }

    /// Removes a worker and refuses to ever re-admit it.
    pub fn ignore_peer(&self, who: &PeerId) {
        let mut inner = self.inner.lock();
        inner.workers.remove(who);
        inner.ignored.insert(who.clone());
    }

    /// Number of peers currently usable as workers.
    pub fn total_workers(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// Dispatches each task to a worker and waits for all the responses.
    ///
    /// Tasks are spread over distinct workers, wrapping around if there are
    /// more tasks than workers. Returns an empty list when no worker is
    /// available. The pool's lock is not held while waiting.
    pub async fn submit_requests(&self, tasks: Vec<SyncTask>) -> Vec<SyncTaskResult> {
        let workers = {
            let inner = self.inner.lock();
            inner.workers.iter().cloned().collect::<Vec<_>>()
        };
        if workers.is_empty() {
            return Vec::new();
        }

        let dispatches = tasks
            .into_iter()
            .zip(workers.into_iter().cycle())
            .map(|(task, who)| {
                let request = task.request_maker.request(who.clone(), task.request);
                async move {
                    match request.await {
                        Ok(response) => SyncTaskResult {
                            who,
                            completed: true,
                            response: Some(response),
                            error: None,
                        },
                        Err(error) => SyncTaskResult {
                            who,
                            completed: false,
                            response: None,
                            error: Some(error),
                        },
                    }
                }
            })
            .collect::<Vec<_>>();

        future::join_all(dispatches).await
    }
}

impl Default for SyncWorkerPool {
    fn default() -> SyncWorkerPool {
        SyncWorkerPool::new()
    }
}
