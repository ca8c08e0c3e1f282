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

//! Full syncing strategy.
//!
//! Downloads the blocks between the local best block and the highest block
//! any peer claims, in ascending batches fanned out over the worker pool,
//! and imports them in order.

use super::{validate_block_results, Change, Error, ProcessOutcome, Strategy, SyncTask, SyncTaskResult};
use crate::chain::BlockState;
use crate::informant::HashDisplay;
use crate::network::{
    rep, BlockAnnounce, BlockAnnounceHandshake, BlocksRequestConfig, BlocksRequestDirection,
    BlocksRequestFields, BlocksRequestStart, PeerId, Request, RequestMaker,
};
use crate::sync::peers::PeerViewSet;

use std::sync::Arc;

/// Maximum number of blocks requested at once from a single peer.
const MAX_BLOCKS_PER_REQUEST: u64 = 128;

/// Maximum number of block requests emitted in a single tick.
const MAX_PARALLEL_REQUESTS: u64 = 8;

/// Configuration for a [`FullSyncStrategy`].
pub struct Config {
    /// Views of the connected peers, shared with the other strategies.
    pub peers: Arc<PeerViewSet>,

    /// Hashes of blocks known to be bad.
    pub bad_blocks: Vec<[u8; 32]>,

    /// Sub-protocol block requests are sent through.
    pub block_request_maker: Arc<dyn RequestMaker>,

    /// Access to the locally stored chain.
    pub block_state: Arc<dyn BlockState>,

    /// Number of bytes used to encode block numbers on the wire.
    pub block_number_bytes: usize,
}

/// Strategy that downloads and imports every block up to the peers' best.
pub struct FullSyncStrategy {
    peers: Arc<PeerViewSet>,
    bad_blocks: Vec<[u8; 32]>,
    block_request_maker: Arc<dyn RequestMaker>,
    block_state: Arc<dyn BlockState>,
    block_number_bytes: usize,
}

impl FullSyncStrategy {
    /// Builds a new full sync strategy.
    pub fn new(config: Config) -> FullSyncStrategy {
        FullSyncStrategy {
            peers: config.peers,
            bad_blocks: config.bad_blocks,
            block_request_maker: config.block_request_maker,
            block_state: config.block_state,
            block_number_bytes: config.block_number_bytes,
        }
    }
}

impl Strategy for FullSyncStrategy {
    fn on_block_announce(
        &mut self,
        who: PeerId,
        announce: &BlockAnnounce,
    ) -> (Option<Change>, Result<(), Error>) {
        let announce_hash = announce.header.hash(self.block_number_bytes);

        if self.bad_blocks.contains(&announce_hash) {
            tracing::debug!(
                peer = %who,
                block = announce.header.number,
                hash = %HashDisplay(&announce_hash),
                "announce of a known bad block",
            );
            return (
                Some(Change {
                    who,
                    rep: rep::BAD_BLOCK_ANNOUNCEMENT,
                }),
                Err(Error::BadBlockReceived),
            );
        }

        if announce.is_best {
            self.peers
                .update(&who, announce_hash, announce.header.number);
        }

        (
            Some(Change {
                who,
                rep: rep::GOSSIP_SUCCESS,
            }),
            Ok(()),
        )
    }

    fn on_block_announce_handshake(
        &mut self,
        who: PeerId,
        handshake: &BlockAnnounceHandshake,
    ) -> Result<(), Error> {
        self.peers
            .update(&who, handshake.best_hash, handshake.best_number);
        Ok(())
    }

    fn next_actions(&mut self) -> Result<Vec<SyncTask>, Error> {
        let best_number = self.block_state.best_block_number();
        let target = self.peers.target();
        if best_number >= target {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut start = best_number + 1;
        while start <= target && (tasks.len() as u64) < MAX_PARALLEL_REQUESTS {
            let desired_count = std::cmp::min(MAX_BLOCKS_PER_REQUEST, target - start + 1);
            tasks.push(SyncTask {
                request: Request::Blocks(BlocksRequestConfig {
                    start: BlocksRequestStart::Number(start),
                    direction: BlocksRequestDirection::Ascending,
                    desired_count: u32::try_from(desired_count).unwrap(),
                    fields: BlocksRequestFields {
                        header: true,
                        body: true,
                        justification: true,
                    },
                }),
                request_maker: self.block_request_maker.clone(),
            });
            start += desired_count;
        }

        Ok(tasks)
    }

    fn process(&mut self, results: Vec<SyncTaskResult>) -> Result<ProcessOutcome, Error> {
        let mut outcome = ProcessOutcome::empty();

        let (reputation_changes, peers_to_ban, validated) =
            validate_block_results(results, &self.bad_blocks, self.block_number_bytes);
        outcome.reputation_changes = reputation_changes;
        outcome.peers_to_ban = peers_to_ban;

        // Import the validated batches in ascending order so that parents
        // are imported before their children.
        let mut batches = validated;
        batches.sort_by_key(|(_, blocks)| {
            blocks
                .first()
                .and_then(|block| block.header.as_ref())
                .map_or(u64::MAX, |header| header.number)
        });

        for (who, blocks) in batches {
            for block in &blocks {
                if let Err(err) = self.block_state.compare_and_set_block_data(block) {
                    tracing::warn!(
                        peer = %who,
                        hash = %HashDisplay(&block.hash),
                        error = %err,
                        "failed to import block",
                    );
                    outcome.reputation_changes.push(Change {
                        who: who.clone(),
                        rep: rep::BAD_BLOCK_RECEIVED,
                    });
                    outcome.peers_to_ban.push(who.clone());
                    break;
                }
            }
        }

        outcome.done = self.is_synced();
        Ok(outcome)
    }

    fn show_metrics(&self) {
        let best = self.block_state.best_block_header();
        tracing::info!(
            best = best.number,
            best_hash = %HashDisplay(&best.hash(self.block_number_bytes)),
            target = self.peers.target(),
            "full sync progress",
        );
    }

    fn is_synced(&self) -> bool {
        self.block_state.best_block_number() >= self.peers.target()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, FullSyncStrategy};
    use crate::chain::{BlockState, ImportError};
    use crate::header::{Digest, Header};
    use crate::network::{
        rep, BlockData, BlocksRequestStart, PeerId, Request, RequestError, RequestMaker, Response,
    };
    use crate::sync::peers::PeerViewSet;
    use crate::sync::{Strategy as _, SyncTaskResult};

    use futures::future::BoxFuture;
    use futures::FutureExt as _;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const BLOCK_NUMBER_BYTES: usize = 4;

    fn header(number: u64, parent_hash: [u8; 32]) -> Header {
        Header {
            parent_hash,
            number,
            state_root: [0; 32],
            extrinsics_root: [0; 32],
            digest: Digest::empty(),
        }
    }

    struct NeverMaker;

    impl RequestMaker for NeverMaker {
        fn request(
            &self,
            _who: PeerId,
            _request: Request,
        ) -> BoxFuture<'static, Result<Response, RequestError>> {
            async { Err(RequestError::Timeout) }.boxed()
        }
    }

    /// Chain that records imported blocks and tracks its best number.
    struct RecordingChain {
        best_number: Mutex<u64>,
        imported: Mutex<Vec<[u8; 32]>>,
        reject_imports: bool,
    }

    impl RecordingChain {
        fn new(best_number: u64) -> RecordingChain {
            RecordingChain {
                best_number: Mutex::new(best_number),
                imported: Mutex::new(Vec::new()),
                reject_imports: false,
            }
        }
    }

    impl BlockState for RecordingChain {
        fn best_block_header(&self) -> Header {
            header(*self.best_number.lock(), [0; 32])
        }

        fn highest_finalized_header(&self) -> Header {
            header(0, [0; 32])
        }

        fn header(&self, _hash: &[u8; 32]) -> Option<Header> {
            None
        }

        fn header_by_number(&self, _number: u64) -> Option<Header> {
            None
        }

        fn justification(&self, _hash: &[u8; 32]) -> Option<Vec<u8>> {
            None
        }

        fn compare_and_set_block_data(&self, block: &BlockData) -> Result<(), ImportError> {
            if self.reject_imports {
                return Err(ImportError::Storage);
            }
            self.imported.lock().push(block.hash);
            if let Some(block_header) = &block.header {
                let mut best = self.best_number.lock();
                if block_header.number > *best {
                    *best = block_header.number;
                }
            }
            Ok(())
        }
    }

    fn strategy(chain: Arc<RecordingChain>) -> (FullSyncStrategy, Arc<PeerViewSet>) {
        let peers = Arc::new(PeerViewSet::new());
        let strategy = FullSyncStrategy::new(Config {
            peers: peers.clone(),
            bad_blocks: Vec::new(),
            block_request_maker: Arc::new(NeverMaker),
            block_state: chain,
            block_number_bytes: BLOCK_NUMBER_BYTES,
        });
        (strategy, peers)
    }

    #[test]
    fn no_requests_when_caught_up() {
        let (mut strategy, peers) = strategy(Arc::new(RecordingChain::new(50)));
        peers.update(&PeerId::from_bytes(&b"peer"[..]), [1; 32], 50);

        assert!(strategy.next_actions().unwrap().is_empty());
        assert!(strategy.is_synced());
    }

    #[test]
    fn requests_cover_the_gap_in_batches() {
        let (mut strategy, peers) = strategy(Arc::new(RecordingChain::new(0)));
        peers.update(&PeerId::from_bytes(&b"peer"[..]), [1; 32], 300);

        let tasks = strategy.next_actions().unwrap();
        assert_eq!(tasks.len(), 3);

        let starts: Vec<u64> = tasks
            .iter()
            .map(|task| match &task.request {
                Request::Blocks(config) => match config.start {
                    BlocksRequestStart::Number(number) => number,
                    _ => panic!("expected a number-anchored request"),
                },
                _ => panic!("expected a blocks request"),
            })
            .collect();
        assert_eq!(starts, vec![1, 129, 257]);

        match &tasks[2].request {
            Request::Blocks(config) => assert_eq!(config.desired_count, 44),
            _ => unreachable!(),
        }
    }

    #[test]
    fn imports_validated_blocks_in_order() {
        let chain = Arc::new(RecordingChain::new(0));
        let (mut strategy, peers) = strategy(chain.clone());
        let peer = PeerId::from_bytes(&b"peer"[..]);
        peers.update(&peer, [1; 32], 2);

        let block_1_header = header(1, [0; 32]);
        let block_1 = BlockData {
            hash: block_1_header.hash(BLOCK_NUMBER_BYTES),
            header: Some(block_1_header.clone()),
            body: Some(Vec::new()),
            justification: None,
        };
        let block_2_header = header(2, block_1.hash);
        let block_2 = BlockData {
            hash: block_2_header.hash(BLOCK_NUMBER_BYTES),
            header: Some(block_2_header),
            body: Some(Vec::new()),
            justification: None,
        };

        let outcome = strategy
            .process(vec![SyncTaskResult {
                who: peer,
                completed: true,
                response: Some(Response::Blocks(vec![block_1.clone(), block_2.clone()])),
                error: None,
            }])
            .unwrap();

        assert!(outcome.reputation_changes.is_empty());
        assert_eq!(*chain.imported.lock(), vec![block_1.hash, block_2.hash]);
        assert!(strategy.is_synced());
        assert!(outcome.done);
    }

    #[test]
    fn failed_import_bans_the_sender() {
        let mut chain = RecordingChain::new(0);
        chain.reject_imports = true;
        let chain = Arc::new(chain);
        let (mut strategy, peers) = strategy(chain);
        let peer = PeerId::from_bytes(&b"peer"[..]);
        peers.update(&peer, [1; 32], 1);

        let block_1_header = header(1, [0; 32]);
        let block_1 = BlockData {
            hash: block_1_header.hash(BLOCK_NUMBER_BYTES),
            header: Some(block_1_header),
            body: Some(Vec::new()),
            justification: None,
        };

        let outcome = strategy
            .process(vec![SyncTaskResult {
                who: peer.clone(),
                completed: true,
                response: Some(Response::Blocks(vec![block_1])),
                error: None,
            }])
            .unwrap();

        assert_eq!(outcome.reputation_changes.len(), 1);
        assert_eq!(outcome.reputation_changes[0].rep, rep::BAD_BLOCK_RECEIVED);
        assert_eq!(outcome.peers_to_ban, vec![peer]);
    }
}
