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

//! Warp syncing strategy.
//!
//! Requests warp sync proofs anchored at the last known finalized block,
//! verifies them, and walks the resulting authority sets until a responder
//! marks its proof as finished. At that point only the head block itself is
//! downloaded; everything in between is covered by the handoff proofs.

use super::{validate_block_results, Change, Error, ProcessOutcome, Strategy, SyncTask, SyncTaskResult};
use crate::chain::BlockState;
use crate::finality::warp_sync::{self, VerificationResult, WarpSyncProofProvider};
use crate::header::{GrandpaAuthority, Header};
use crate::informant::HashDisplay;
use crate::network::{
    rep, BlockAnnounce, BlockAnnounceHandshake, BlockData, BlocksRequestConfig,
    BlocksRequestDirection, BlocksRequestFields, BlocksRequestStart, PeerId, Request,
    RequestMaker, Response,
};
use crate::sync::peers::PeerViewSet;

use std::sync::Arc;
use std::time::Instant;

/// Source of warp sync proof verification, as seen by the strategy.
///
/// Implemented by [`WarpSyncProofProvider`]; tests substitute their own.
pub trait WarpProofProvider: Send + Sync {
    /// Returns the authority set the verification walk starts from.
    fn current_authorities(&self) -> Result<Vec<GrandpaAuthority>, warp_sync::Error>;

    /// Verifies an encoded proof against the given starting set.
    fn verify(
        &self,
        encoded_proof: &[u8],
        set_id: u64,
        authorities: &[GrandpaAuthority],
    ) -> Result<VerificationResult, warp_sync::Error>;
}

impl<B, A> WarpProofProvider for WarpSyncProofProvider<B, A>
where
    B: BlockState,
    A: crate::chain::AuthoritySetState,
{
    fn current_authorities(&self) -> Result<Vec<GrandpaAuthority>, warp_sync::Error> {
        WarpSyncProofProvider::current_authorities(self)
    }

    fn verify(
        &self,
        encoded_proof: &[u8],
        set_id: u64,
        authorities: &[GrandpaAuthority],
    ) -> Result<VerificationResult, warp_sync::Error> {
        WarpSyncProofProvider::verify(self, encoded_proof, set_id, authorities)
    }
}

/// Phase the warp sync is in. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarpSyncPhase {
    /// Requesting and verifying warp sync proofs.
    WarpProof,
    /// Downloading the block the last proof stopped at.
    TargetBlock,
    /// Nothing left to do.
    Completed,
}

/// Configuration for a [`WarpSyncStrategy`].
pub struct Config {
    /// Views of the connected peers, shared with the other strategies.
    pub peers: Arc<PeerViewSet>,

    /// Hashes of blocks known to be bad.
    pub bad_blocks: Vec<[u8; 32]>,

    /// Sub-protocol warp proof requests are sent through.
    pub warp_sync_request_maker: Arc<dyn RequestMaker>,

    /// Sub-protocol block requests are sent through.
    pub block_request_maker: Arc<dyn RequestMaker>,

    /// Verifier of the received proofs.
    pub provider: Arc<dyn WarpProofProvider>,

    /// Access to the locally stored chain.
    pub block_state: Arc<dyn BlockState>,

    /// Number of bytes used to encode block numbers on the wire.
    pub block_number_bytes: usize,
}

/// Strategy that warps to the head of the chain through authority-set
/// handoff proofs.
pub struct WarpSyncStrategy {
    peers: Arc<PeerViewSet>,
    bad_blocks: Vec<[u8; 32]>,
    warp_sync_request_maker: Arc<dyn RequestMaker>,
    block_request_maker: Arc<dyn RequestMaker>,
    provider: Arc<dyn WarpProofProvider>,
    block_state: Arc<dyn BlockState>,
    block_number_bytes: usize,

    phase: WarpSyncPhase,
    started_at: Instant,
    synced_fragments: usize,
    set_id: u64,
    authorities: Vec<GrandpaAuthority>,
    last_block: Option<Header>,
    result: Option<BlockData>,
}

impl WarpSyncStrategy {
    /// Builds a new warp sync strategy, seeded with the current authority
    /// set of the provider.
    pub fn new(config: Config) -> Result<WarpSyncStrategy, Error> {
        let authorities = config
            .provider
            .current_authorities()
            .map_err(Error::WarpProof)?;

        Ok(WarpSyncStrategy {
            peers: config.peers,
            bad_blocks: config.bad_blocks,
            warp_sync_request_maker: config.warp_sync_request_maker,
            block_request_maker: config.block_request_maker,
            provider: config.provider,
            block_state: config.block_state,
            block_number_bytes: config.block_number_bytes,
            phase: WarpSyncPhase::WarpProof,
            started_at: Instant::now(),
            synced_fragments: 0,
            set_id: 0,
            authorities,
            last_block: None,
            result: None,
        })
    }

    /// Phase the strategy currently is in.
    pub fn phase(&self) -> WarpSyncPhase {
        self.phase
    }

    fn last_block_header(&mut self) -> Header {
        match &self.last_block {
            Some(header) => header.clone(),
            None => {
                let header = self.block_state.highest_finalized_header();
                self.last_block = Some(header.clone());
                header
            }
        }
    }

    fn validate_warp_proof_results(
        &mut self,
        results: Vec<SyncTaskResult>,
    ) -> (Vec<Change>, Vec<PeerId>, Option<VerificationResult>) {
        let mut reputation_changes = Vec::new();
        let mut peers_to_ban = Vec::new();

        let mut best_fragments = 0;
        let mut best_result: Option<VerificationResult> = None;

        for result in results {
            if !result.completed {
                continue;
            }

            let proof = match result.response {
                Some(Response::WarpProof(proof)) => proof,
                _ => {
                    reputation_changes.push(Change {
                        who: result.who.clone(),
                        rep: rep::UNEXPECTED_RESPONSE,
                    });
                    peers_to_ban.push(result.who);
                    continue;
                }
            };

            let encoded = proof.scale_encoding_vec(self.block_number_bytes);
            match self
                .provider
                .verify(&encoded, self.set_id, &self.authorities)
            {
                Ok(verification) => {
                    if proof.is_finished || proof.fragments.len() > best_fragments {
                        best_fragments = proof.fragments.len();
                        best_result = Some(verification);
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = %result.who, error = %err, "bad warp proof response");
                    reputation_changes.push(Change {
                        who: result.who.clone(),
                        rep: rep::BAD_WARP_PROOF,
                    });
                    peers_to_ban.push(result.who);
                }
            }
        }

        self.synced_fragments += best_fragments;
        (reputation_changes, peers_to_ban, best_result)
    }
}

impl Strategy for WarpSyncStrategy {
    /// While warping, block announcements only feed the peer views; blocks
    /// themselves are not requested from announcements.
    fn on_block_announce(
        &mut self,
        who: PeerId,
        announce: &BlockAnnounce,
    ) -> (Option<Change>, Result<(), Error>) {
        let announce_hash = announce.header.hash(self.block_number_bytes);

        tracing::debug!(
            peer = %who,
            block = announce.header.number,
            hash = %HashDisplay(&announce_hash),
            is_best = announce.is_best,
            "received block announce",
        );

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
        self.started_at = Instant::now();
        let last_block = self.last_block_header();

        let task = match self.phase {
            WarpSyncPhase::WarpProof => SyncTask {
                request: Request::WarpProof {
                    begin: last_block.hash(self.block_number_bytes),
                },
                request_maker: self.warp_sync_request_maker.clone(),
            },
            WarpSyncPhase::TargetBlock => SyncTask {
                request: Request::Blocks(BlocksRequestConfig {
                    start: BlocksRequestStart::Hash(last_block.hash(self.block_number_bytes)),
                    direction: BlocksRequestDirection::Ascending,
                    desired_count: 1,
                    fields: BlocksRequestFields {
                        header: true,
                        body: true,
                        justification: true,
                    },
                }),
                request_maker: self.block_request_maker.clone(),
            },
            WarpSyncPhase::Completed => return Ok(Vec::new()),
        };

        Ok(vec![task])
    }

    fn process(&mut self, results: Vec<SyncTaskResult>) -> Result<ProcessOutcome, Error> {
        let mut outcome = ProcessOutcome::empty();

        match self.phase {
            WarpSyncPhase::WarpProof => {
                tracing::debug!("processing warp sync proof results");

                let (reputation_changes, peers_to_ban, verification) =
                    self.validate_warp_proof_results(results);
                outcome.reputation_changes = reputation_changes;
                outcome.peers_to_ban = peers_to_ban;

                if let Some(verification) = verification {
                    self.last_block = Some(verification.header);

                    if verification.completed {
                        tracing::debug!(
                            block = self.last_block.as_ref().unwrap().number,
                            "finished processing proofs, downloading target block",
                        );
                        self.phase = WarpSyncPhase::TargetBlock;
                    } else {
                        tracing::debug!("partial warp sync proof received");
                        self.set_id = verification.set_id;
                        self.authorities = verification.authority_list;
                    }
                }
            }

            WarpSyncPhase::TargetBlock => {
                tracing::debug!("processing warp sync target block results");

                let (reputation_changes, peers_to_ban, validated) =
                    validate_block_results(results, &self.bad_blocks, self.block_number_bytes);
                outcome.reputation_changes = reputation_changes;
                outcome.peers_to_ban = peers_to_ban;

                if let Some(block) = validated
                    .into_iter()
                    .flat_map(|(_, blocks)| blocks)
                    .next()
                {
                    self.result = Some(block);
                    self.phase = WarpSyncPhase::Completed;
                }
            }

            WarpSyncPhase::Completed => {}
        }

        outcome.done = self.is_synced();
        Ok(outcome)
    }

    fn show_metrics(&self) {
        let last_block = match &self.last_block {
            Some(header) => header.clone(),
            None => return,
        };

        match self.phase {
            WarpSyncPhase::WarpProof => {
                tracing::info!(
                    fragments = self.synced_fragments,
                    best = last_block.number,
                    best_hash = %HashDisplay(&last_block.hash(self.block_number_bytes)),
                    elapsed_seconds = self.started_at.elapsed().as_secs_f64(),
                    "warping: downloading finality proofs",
                );
            }
            WarpSyncPhase::TargetBlock => {
                tracing::info!(
                    target = last_block.number,
                    target_hash = %HashDisplay(&last_block.hash(self.block_number_bytes)),
                    "warping: downloading target block",
                );
            }
            WarpSyncPhase::Completed => {}
        }
    }

    fn is_synced(&self) -> bool {
        self.phase == WarpSyncPhase::Completed
    }

    fn result(&mut self) -> Option<BlockData> {
        self.result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, WarpProofProvider, WarpSyncPhase, WarpSyncStrategy};
    use crate::chain::{BlockState, ImportError};
    use crate::finality::warp_sync::{self, VerificationResult, WarpSyncFragment, WarpSyncProof};
    use crate::finality::justification::decode::{Commit, GrandpaJustification};
    use crate::header::{Digest, GrandpaAuthority, Header};
    use crate::network::{
        rep, BlockAnnounce, BlockData, PeerId, Request, RequestError, RequestMaker, Response,
    };
    use crate::sync::peers::PeerViewSet;
    use crate::sync::{Strategy as _, SyncTaskResult};

    use futures::future::BoxFuture;
    use futures::FutureExt as _;
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

    struct StaticChain {
        finalized: Header,
    }

    impl BlockState for StaticChain {
        fn best_block_header(&self) -> Header {
            self.finalized.clone()
        }

        fn highest_finalized_header(&self) -> Header {
            self.finalized.clone()
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

        fn compare_and_set_block_data(&self, _block: &BlockData) -> Result<(), ImportError> {
            Ok(())
        }
    }

    /// Provider whose verification outcome is scripted per call.
    struct ScriptedProvider {
        outcomes: parking_lot::Mutex<Vec<Result<VerificationResult, ()>>>,
    }

    impl WarpProofProvider for ScriptedProvider {
        fn current_authorities(&self) -> Result<Vec<GrandpaAuthority>, warp_sync::Error> {
            Ok(vec![GrandpaAuthority {
                public_key: [1; 32],
                weight: 1,
            }])
        }

        fn verify(
            &self,
            _encoded_proof: &[u8],
            _set_id: u64,
            _authorities: &[GrandpaAuthority],
        ) -> Result<VerificationResult, warp_sync::Error> {
            match self.outcomes.lock().remove(0) {
                Ok(result) => Ok(result),
                Err(()) => Err(warp_sync::Error::EmptyProof),
            }
        }
    }

    fn strategy_with(
        outcomes: Vec<Result<VerificationResult, ()>>,
        bad_blocks: Vec<[u8; 32]>,
    ) -> (WarpSyncStrategy, Arc<PeerViewSet>) {
        let peers = Arc::new(PeerViewSet::new());
        let strategy = WarpSyncStrategy::new(Config {
            peers: peers.clone(),
            bad_blocks,
            warp_sync_request_maker: Arc::new(NeverMaker),
            block_request_maker: Arc::new(NeverMaker),
            provider: Arc::new(ScriptedProvider {
                outcomes: parking_lot::Mutex::new(outcomes),
            }),
            block_state: Arc::new(StaticChain {
                finalized: header(0, [0; 32]),
            }),
            block_number_bytes: BLOCK_NUMBER_BYTES,
        })
        .unwrap();
        (strategy, peers)
    }

    fn dummy_proof(fragments: usize, is_finished: bool) -> WarpSyncProof {
        let mut proof = WarpSyncProof::empty();
        for number in 0..fragments {
            proof.add_fragment(
                WarpSyncFragment {
                    header: header(u64::try_from(number).unwrap() + 1, [0; 32]),
                    justification: GrandpaJustification {
                        round: 1,
                        commit: Commit {
                            target_hash: [0; 32],
                            target_number: u64::try_from(number).unwrap() + 1,
                            precommits: Vec::new(),
                        },
                        vote_ancestries: Vec::new(),
                    },
                },
                BLOCK_NUMBER_BYTES,
            );
        }
        proof.is_finished = is_finished;
        proof
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
    fn good_block_announce_updates_view() {
        let (mut strategy, peers) = strategy_with(Vec::new(), Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let announce = BlockAnnounce {
            header: header(1024, [7; 32]),
            is_best: true,
        };

        let (change, result) = strategy.on_block_announce(peer.clone(), &announce);
        assert!(result.is_ok());
        assert_eq!(change.unwrap().rep, rep::GOSSIP_SUCCESS);
        assert_eq!(peers.target(), 1024);
    }

    #[test]
    fn bad_block_announce_is_penalized() {
        let announce_header = header(1024, [7; 32]);
        let bad_hash = announce_header.hash(BLOCK_NUMBER_BYTES);
        let (mut strategy, peers) = strategy_with(Vec::new(), vec![bad_hash]);
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let announce = BlockAnnounce {
            header: announce_header,
            is_best: true,
        };

        let (change, result) = strategy.on_block_announce(peer.clone(), &announce);
        assert!(matches!(result, Err(crate::sync::Error::BadBlockReceived)));
        let change = change.unwrap();
        assert_eq!(change.who, peer);
        assert_eq!(change.rep, rep::BAD_BLOCK_ANNOUNCEMENT);

        // The peer view must not have been updated.
        assert_eq!(peers.target(), 0);
    }

    #[test]
    fn handshake_updates_view() {
        let (mut strategy, peers) = strategy_with(Vec::new(), Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        strategy
            .on_block_announce_handshake(
                peer,
                &crate::network::BlockAnnounceHandshake {
                    roles: 1,
                    best_number: 17,
                    best_hash: [1; 32],
                    genesis_hash: [2; 32],
                },
            )
            .unwrap();

        assert_eq!(peers.target(), 17);
    }

    #[test]
    fn emits_one_request_per_phase() {
        let (mut strategy, _) = strategy_with(Vec::new(), Vec::new());

        let tasks = strategy.next_actions().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(tasks[0].request, Request::WarpProof { .. }));

        strategy.phase = WarpSyncPhase::TargetBlock;
        let tasks = strategy.next_actions().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(matches!(tasks[0].request, Request::Blocks(_)));

        strategy.phase = WarpSyncPhase::Completed;
        assert!(strategy.next_actions().unwrap().is_empty());
    }

    #[test]
    fn full_proof_moves_to_target_block() {
        let target_header = header(90, [3; 32]);
        let verification = VerificationResult {
            set_id: 9,
            authority_list: vec![GrandpaAuthority {
                public_key: [9; 32],
                weight: 1,
            }],
            header: target_header.clone(),
            completed: true,
        };
        let (mut strategy, _) = strategy_with(vec![Ok(verification)], Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let outcome = strategy
            .process(vec![completed(
                &peer,
                Response::WarpProof(dummy_proof(3, true)),
            )])
            .unwrap();

        assert!(!outcome.done);
        assert!(outcome.reputation_changes.is_empty());
        assert_eq!(strategy.phase(), WarpSyncPhase::TargetBlock);
        assert_eq!(strategy.last_block, Some(target_header));
    }

    #[test]
    fn partial_proof_stays_in_warp_proof_phase() {
        let verification = VerificationResult {
            set_id: 4,
            authority_list: vec![GrandpaAuthority {
                public_key: [4; 32],
                weight: 1,
            }],
            header: header(40, [3; 32]),
            completed: false,
        };
        let (mut strategy, _) = strategy_with(vec![Ok(verification)], Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let outcome = strategy
            .process(vec![completed(
                &peer,
                Response::WarpProof(dummy_proof(3, false)),
            )])
            .unwrap();

        assert!(!outcome.done);
        assert_eq!(strategy.phase(), WarpSyncPhase::WarpProof);
        assert_eq!(strategy.set_id, 4);
        assert_eq!(strategy.authorities[0].public_key, [4; 32]);
    }

    #[test]
    fn invalid_proof_bans_peer() {
        let (mut strategy, _) = strategy_with(vec![Err(())], Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let outcome = strategy
            .process(vec![completed(
                &peer,
                Response::WarpProof(dummy_proof(1, true)),
            )])
            .unwrap();

        assert_eq!(outcome.reputation_changes.len(), 1);
        assert_eq!(outcome.reputation_changes[0].rep, rep::BAD_WARP_PROOF);
        assert_eq!(outcome.peers_to_ban, vec![peer]);
        assert_eq!(strategy.phase(), WarpSyncPhase::WarpProof);
    }

    #[test]
    fn wrong_response_kind_bans_peer() {
        let (mut strategy, _) = strategy_with(Vec::new(), Vec::new());
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let outcome = strategy
            .process(vec![completed(&peer, Response::Blocks(Vec::new()))])
            .unwrap();

        assert_eq!(outcome.reputation_changes.len(), 1);
        assert_eq!(outcome.reputation_changes[0].rep, rep::UNEXPECTED_RESPONSE);
        assert_eq!(outcome.peers_to_ban, vec![peer]);
    }

    #[test]
    fn target_block_completes_the_strategy() {
        let (mut strategy, _) = strategy_with(Vec::new(), Vec::new());
        strategy.phase = WarpSyncPhase::TargetBlock;
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let target = header(90, [3; 32]);
        let block = BlockData {
            hash: target.hash(BLOCK_NUMBER_BYTES),
            header: Some(target),
            body: Some(Vec::new()),
            justification: None,
        };

        let outcome = strategy
            .process(vec![completed(&peer, Response::Blocks(vec![block.clone()]))])
            .unwrap();

        assert!(outcome.done);
        assert!(strategy.is_synced());
        assert_eq!(strategy.phase(), WarpSyncPhase::Completed);
        assert_eq!(strategy.result(), Some(block));
    }

    #[test]
    fn phase_never_goes_backwards() {
        // Processing stray warp proof results after the phase moved on must
        // not regress the phase.
        let (mut strategy, _) = strategy_with(Vec::new(), Vec::new());
        strategy.phase = WarpSyncPhase::Completed;
        let peer = PeerId::from_bytes(&b"peer"[..]);

        let before = strategy.phase();
        let _ = strategy
            .process(vec![completed(
                &peer,
                Response::WarpProof(dummy_proof(1, false)),
            )])
            .unwrap();
        assert!(strategy.phase() >= before);
    }
}
