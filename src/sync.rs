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

//! Chain synchronization.
//!
//! Synchronizing is driven by a [`service::SyncService`] that ticks
//! periodically. Each tick, the service asks the current [`Strategy`] for
//! the requests it wants to emit, dispatches them to remote peers through a
//! [`worker_pool::SyncWorkerPool`], and feeds the responses back into the
//! strategy. A strategy turns peer misbehavior into reputation changes and
//! bans rather than errors; only local inconsistencies abort a tick.
//!
//! Two strategies exist: [`warp::WarpSyncStrategy`] chains authority-set
//! handoff proofs to reach the head of the chain in a few requests, and
//! [`full::FullSyncStrategy`] downloads and imports every remaining block.
//! When the warp strategy reports completion, the service swaps in the full
//! strategy.

use crate::header::hash_from_scale_encoded_header;
use crate::network::{
    rep, BlockAnnounce, BlockAnnounceHandshake, BlockData, PeerId, ReputationChange, Request,
    RequestError, RequestMaker, Response,
};

use std::sync::Arc;

pub mod full;
pub mod peers;
pub mod service;
pub mod warp;
pub mod worker_pool;

/// A request a strategy wants the worker pool to dispatch.
pub struct SyncTask {
    /// The request to send.
    pub request: Request,
    /// Sub-protocol handle the request must be sent through.
    pub request_maker: Arc<dyn RequestMaker>,
}

/// Outcome of dispatching one [`SyncTask`].
pub struct SyncTaskResult {
    /// Peer the request was sent to.
    pub who: PeerId,
    /// `true` if a response arrived, even a nonsensical one.
    pub completed: bool,
    /// The decoded response, when one arrived.
    pub response: Option<Response>,
    /// The failure, when none did.
    pub error: Option<RequestError>,
}

/// A reputation adjustment to apply to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Peer to adjust.
    pub who: PeerId,
    /// Adjustment to apply.
    pub rep: ReputationChange,
}

/// What a strategy concluded from a batch of results.
pub struct ProcessOutcome {
    /// `true` if the strategy finished its work and the service should move
    /// on to the follow-up strategy, if one is configured.
    pub done: bool,
    /// Reputation adjustments to apply.
    pub reputation_changes: Vec<Change>,
    /// Peers the worker pool should stop dispatching requests to.
    pub peers_to_ban: Vec<PeerId>,
}

impl ProcessOutcome {
    fn empty() -> ProcessOutcome {
        ProcessOutcome {
            done: false,
            reputation_changes: Vec::new(),
            peers_to_ban: Vec::new(),
        }
    }
}

/// Capability set common to all syncing strategies.
///
/// Methods are synchronous; the service serializes every call behind its
/// strategy lock.
pub trait Strategy: Send {
    /// Called for every block announcement received from a peer.
    ///
    /// Returns an optional reputation adjustment together with the outcome;
    /// a misbehaving peer typically gets both a negative adjustment and an
    /// error.
    fn on_block_announce(
        &mut self,
        who: PeerId,
        announce: &BlockAnnounce,
    ) -> (Option<Change>, Result<(), Error>);

    /// Called for every block-announces handshake received from a peer.
    fn on_block_announce_handshake(
        &mut self,
        who: PeerId,
        handshake: &BlockAnnounceHandshake,
    ) -> Result<(), Error>;

    /// Returns the requests the strategy wants dispatched this tick. May be
    /// empty.
    fn next_actions(&mut self) -> Result<Vec<SyncTask>, Error>;

    /// Feeds the results of the previously emitted requests back into the
    /// strategy.
    fn process(&mut self, results: Vec<SyncTaskResult>) -> Result<ProcessOutcome, Error>;

    /// Logs a progress line describing the state of the strategy.
    fn show_metrics(&self);

    /// Returns `true` once the strategy considers the node caught up with
    /// the head of the chain.
    fn is_synced(&self) -> bool;

    /// Completion payload of the strategy, if it produces one. The warp
    /// strategy hands over the target block it downloaded.
    fn result(&mut self) -> Option<BlockData> {
        None
    }
}

/// Error potentially returned by [`Strategy`] methods.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// A peer announced or sent a block that is in the bad-blocks list.
    #[display(fmt = "Bad block received")]
    BadBlockReceived,
    /// The warp sync proof provider failed locally.
    #[display(fmt = "Warp sync proof provider error: {}", _0)]
    WarpProof(crate::finality::warp_sync::Error),
}

/// Sink the service exports its synchronization state to.
///
/// Injected rather than registered globally so that tests and embedders can
/// observe the gauge without a metrics registry.
pub trait MetricsSink: Send + Sync {
    /// Called every tick with whether the node is synced.
    fn set_is_synced(&self, synced: bool);
}

/// [`MetricsSink`] that discards everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_is_synced(&self, _synced: bool) {}
}

/// Validates a batch of block-request results, shared by the warp and full
/// strategies.
///
/// Results are partitioned into reputation changes plus peers to ban on one
/// side, and validated block data on the other. A response is rejected when
/// it is of the wrong kind, contains a block from `bad_blocks`, a header
/// that doesn't match its announced hash, or headers that aren't
/// parent-linked in order.
pub(crate) fn validate_block_results(
    results: Vec<SyncTaskResult>,
    bad_blocks: &[[u8; 32]],
    block_number_bytes: usize,
) -> (Vec<Change>, Vec<PeerId>, Vec<(PeerId, Vec<BlockData>)>) {
    let mut reputation_changes = Vec::new();
    let mut peers_to_ban = Vec::new();
    let mut validated = Vec::new();

    for result in results {
        if !result.completed {
            continue;
        }

        let blocks = match result.response {
            Some(Response::Blocks(blocks)) => blocks,
            _ => {
                reputation_changes.push(Change {
                    who: result.who.clone(),
                    rep: rep::UNEXPECTED_RESPONSE,
                });
                peers_to_ban.push(result.who);
                continue;
            }
        };

        if !block_chain_is_valid(&blocks, bad_blocks, block_number_bytes) {
            reputation_changes.push(Change {
                who: result.who.clone(),
                rep: rep::BAD_BLOCK_RECEIVED,
            });
            peers_to_ban.push(result.who);
            continue;
        }

        validated.push((result.who, blocks));
    }

    (reputation_changes, peers_to_ban, validated)
}

fn block_chain_is_valid(
    blocks: &[BlockData],
    bad_blocks: &[[u8; 32]],
    block_number_bytes: usize,
) -> bool {
    for (index, block) in blocks.iter().enumerate() {
        if bad_blocks.contains(&block.hash) {
            return false;
        }

        if let Some(block_header) = &block.header {
            let encoded = block_header.scale_encoding_vec(block_number_bytes);
            if hash_from_scale_encoded_header(&encoded) != block.hash {
                return false;
            }

            if index != 0 && block_header.parent_hash != blocks[index - 1].hash {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::{validate_block_results, SyncTaskResult};
    use crate::header::{Digest, Header};
    use crate::network::{rep, BlockData, PeerId, Response};

    fn header(number: u64, parent_hash: [u8; 32]) -> Header {
        Header {
            parent_hash,
            number,
            state_root: [0; 32],
            extrinsics_root: [0; 32],
            digest: Digest::empty(),
        }
    }

    fn block(header: Header) -> BlockData {
        BlockData {
            hash: header.hash(4),
            header: Some(header),
            body: Some(Vec::new()),
            justification: None,
        }
    }

    fn completed(who: &PeerId, response: Response) -> SyncTaskResult {
        SyncTaskResult {
            who: who.clone(),
            completed: true,
            response: Some(response),
            error: None,
        }
    }

    #[test]
    fn accepts_parent_linked_chain() {
        let peer = PeerId::from_bytes(&b"peer"[..]);
        let block_1 = block(header(1, [0; 32]));
        let block_2 = block(header(2, block_1.hash));

        let (reps, bans, validated) = validate_block_results(
            vec![completed(&peer, Response::Blocks(vec![block_1, block_2]))],
            &[],
            4,
        );

        assert!(reps.is_empty());
        assert!(bans.is_empty());
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].1.len(), 2);
    }

    #[test]
    fn rejects_unlinked_chain() {
        let peer = PeerId::from_bytes(&b"peer"[..]);
        let block_1 = block(header(1, [0; 32]));
        let block_2 = block(header(2, [0x77; 32]));

        let (reps, bans, validated) = validate_block_results(
            vec![completed(&peer, Response::Blocks(vec![block_1, block_2]))],
            &[],
            4,
        );

        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].rep, rep::BAD_BLOCK_RECEIVED);
        assert_eq!(bans, vec![peer]);
        assert!(validated.is_empty());
    }

    #[test]
    fn rejects_wrong_response_kind() {
        let peer = PeerId::from_bytes(&b"peer"[..]);
        let proof = crate::finality::warp_sync::WarpSyncProof::empty();

        let (reps, bans, validated) = validate_block_results(
            vec![completed(&peer, Response::WarpProof(proof))],
            &[],
            4,
        );

        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].rep, rep::UNEXPECTED_RESPONSE);
        assert_eq!(bans, vec![peer]);
        assert!(validated.is_empty());
    }

    #[test]
    fn rejects_bad_block() {
        let peer = PeerId::from_bytes(&b"peer"[..]);
        let block_1 = block(header(1, [0; 32]));
        let bad = block_1.hash;

        let (reps, bans, validated) = validate_block_results(
            vec![completed(&peer, Response::Blocks(vec![block_1]))],
            &[bad],
            4,
        );

        assert_eq!(reps.len(), 1);
        assert_eq!(bans, vec![peer]);
        assert!(validated.is_empty());
    }

    #[test]
    fn rejects_header_hash_mismatch() {
        let peer = PeerId::from_bytes(&b"peer"[..]);
        let mut block_1 = block(header(1, [0; 32]));
        block_1.hash = [0x55; 32];

        let (_, bans, validated) = validate_block_results(
            vec![completed(&peer, Response::Blocks(vec![block_1]))],
            &[],
            4,
        );

        assert_eq!(bans, vec![peer]);
        assert!(validated.is_empty());
    }

    #[test]
    fn skips_failed_results() {
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let (reps, bans, validated) = validate_block_results(
            vec![SyncTaskResult {
                who: peer,
                completed: false,
                response: None,
                error: Some(crate::network::RequestError::Timeout),
            }],
            &[],
            4,
        );

        assert!(reps.is_empty());
        assert!(bans.is_empty());
        assert!(validated.is_empty());
    }
}
