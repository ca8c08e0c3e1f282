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

//! Generation and verification of warp sync proofs.
//!
//! A warp sync proof is a chain of `(header, justification)` fragments, one
//! per authority-set handoff. Each header carries a digest scheduling the
//! next authority set, and each justification proves, under the set
//! resulting from the previous fragments, that this header is finalized.
//! Walking the fragments therefore transfers trust from an old known
//! authority set to the current one without downloading the blocks in
//! between.

use crate::chain::{AuthoritySetState, BlockState};
use crate::finality::justification::{decode, verify};
use crate::header::{self, GrandpaAuthority, Header};
use crate::util;

use std::sync::Arc;

/// Maximum size, in bytes, of an encoded warp sync proof.
pub const MAX_WARP_SYNC_PROOF_SIZE: usize = 8 * 1024 * 1024;

/// One authority-set handoff of a warp sync proof.
#[derive(Debug, Clone)]
pub struct WarpSyncFragment {
    /// The last block that the authority set of the previous fragments
    /// finalized. Contains a digest signalling a change from which the next
    /// authority set is fetched, except possibly in the terminal fragment of
    /// a finished proof.
    pub header: Header,

    /// A justification proving the finality of [`WarpSyncFragment::header`].
    pub justification: decode::GrandpaJustification,
}

impl WarpSyncFragment {
    /// Returns the SCALE encoding of the fragment.
    pub fn scale_encoding_vec(&self, block_number_bytes: usize) -> Vec<u8> {
        let mut out = self.header.scale_encoding_vec(block_number_bytes);
        out.extend_from_slice(&self.justification.scale_encoding_vec(block_number_bytes));
        out
    }
}

/// A chain of authority-set handoff proofs.
#[derive(Debug, Clone)]
pub struct WarpSyncProof {
    /// Handoff proofs, in ascending block number order.
    pub fragments: Vec<WarpSyncFragment>,

    /// `true` if the last fragment proves the finality of the head of the
    /// chain, in other words if no further proof needs to be requested.
    pub is_finished: bool,

    /// Total encoded size of the fragments accumulated so far. Not
    /// transmitted; only maintained while a proof is being generated.
    proofs_length: usize,
}

impl WarpSyncProof {
    /// Builds a new, empty and unfinished proof.
    pub fn empty() -> WarpSyncProof {
        WarpSyncProof {
            fragments: Vec::new(),
            is_finished: false,
            proofs_length: 0,
        }
    }

    /// Attempt to decode a SCALE-encoded warp sync proof.
    pub fn decode(
        scale_encoded: &[u8],
        block_number_bytes: usize,
    ) -> Result<WarpSyncProof, Error> {
        match nom::combinator::all_consuming(nom_warp_sync_proof::<nom::error::Error<&[u8]>>(
            block_number_bytes,
        ))(scale_encoded)
        {
            Ok((_, proof)) => Ok(proof),
            Err(_) => Err(Error::InvalidProofEncoding),
        }
    }

    /// Returns the SCALE encoding of the proof.
    pub fn scale_encoding_vec(&self, block_number_bytes: usize) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(util::encode_scale_compact_usize(self.fragments.len()).as_ref());
        for fragment in &self.fragments {
            out.extend_from_slice(&fragment.scale_encoding_vec(block_number_bytes));
        }
        out.push(u8::from(self.is_finished));
        out
    }

    /// Appends a fragment to the proof, unless doing so would make the
    /// encoded proof reach [`MAX_WARP_SYNC_PROOF_SIZE`]. Returns `true` if
    /// the limit was reached, in which case the fragment has not been
    /// appended.
    pub fn add_fragment(
        &mut self,
        fragment: WarpSyncFragment,
        block_number_bytes: usize,
    ) -> bool {
        let encoded_len = fragment.scale_encoding_vec(block_number_bytes).len();
        if self.proofs_length + encoded_len >= MAX_WARP_SYNC_PROOF_SIZE {
            return true;
        }

        self.proofs_length += encoded_len;
        self.fragments.push(fragment);
        false
    }

    /// Number right above the last block this proof covers. Returns 0 when
    /// the proof is empty, which deliberately lets the `>=` guard of the
    /// generation accept any terminal justification in that case.
    pub fn last_proof_block_number(&self) -> u64 {
        match self.fragments.last() {
            Some(fragment) => fragment.justification.commit.target_number + 1,
            None => 0,
        }
    }
}

/// Outcome of the successful verification of a warp sync proof.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// Id of the authority set resulting from the walk.
    pub set_id: u64,
    /// Members of that authority set.
    pub authority_list: Vec<GrandpaAuthority>,
    /// Header of the last block the proof covers.
    pub header: Header,
    /// `true` if the proof was marked as finished, in other words if
    /// [`VerificationResult::header`] is the finalized head of the chain
    /// according to the responder.
    pub completed: bool,
}

/// A hard-coded `(block, authority set)` override.
///
/// When a fragment designates a block listed here, the verification adopts
/// the recorded authority set *without verifying the fragment's
/// justification*. This makes every hard fork entry a trust anchor: an
/// incorrect entry allows an attacker to take over the warp sync. Entries
/// must only come from the chain specification.
#[derive(Debug, Clone)]
pub struct HardFork {
    /// Hash of the block at which the standard authority handoff chain was
    /// broken.
    pub hash: [u8; 32],
    /// Number of that block.
    pub number: u64,
    /// Authority set id to adopt.
    pub set_id: u64,
    /// Authority set to adopt.
    pub authorities: Vec<GrandpaAuthority>,
}

/// Configuration for a [`WarpSyncProofProvider`].
pub struct Config<B, A> {
    /// Access to the locally stored headers and justifications.
    pub block_state: Arc<B>,

    /// Access to the history of authority sets.
    pub authority_set_state: Arc<A>,

    /// Number of bytes used to encode block numbers on the wire.
    pub block_number_bytes: usize,

    /// Hard-coded authority set overrides. See [`HardFork`].
    pub hard_forks: Vec<HardFork>,
}

/// Generates warp sync proofs out of the local database, and verifies proofs
/// received from remote peers.
pub struct WarpSyncProofProvider<B, A> {
    block_state: Arc<B>,
    authority_set_state: Arc<A>,
    block_number_bytes: usize,
    hard_forks: hashbrown::HashMap<([u8; 32], u64), (u64, Vec<GrandpaAuthority>), fnv::FnvBuildHasher>,
}

impl<B: BlockState, A: AuthoritySetState> WarpSyncProofProvider<B, A> {
    /// Initializes a new proof provider.
    pub fn new(config: Config<B, A>) -> Self {
        let hard_forks = config
            .hard_forks
            .into_iter()
            .map(|fork| ((fork.hash, fork.number), (fork.set_id, fork.authorities)))
            .collect();

        WarpSyncProofProvider {
            block_state: config.block_state,
            authority_set_state: config.authority_set_state,
            block_number_bytes: config.block_number_bytes,
            hard_forks,
        }
    }

    /// Returns the members of the authority set that will finalize the next
    /// blocks.
    pub fn current_authorities(&self) -> Result<Vec<GrandpaAuthority>, Error> {
        let set_id = self.authority_set_state.current_set_id();
        self.authority_set_state
            .authorities(set_id)
            .ok_or(Error::UnknownAuthoritySet(set_id))
    }

    /// Builds an encoded warp sync proof starting at the given block hash.
    ///
    /// The proof covers the authority-set changes enacted after `start`, up
    /// to either the highest finalized block or the point where the encoded
    /// proof would exceed [`MAX_WARP_SYNC_PROOF_SIZE`].
    pub fn generate(&self, start: &[u8; 32]) -> Result<Vec<u8>, Error> {
        let begin = self
            .block_state
            .header(start)
            .ok_or(Error::MissingStartBlock)?;

        let highest_finalized = self.block_state.highest_finalized_header();
        if begin.number > highest_finalized.number {
            return Err(Error::StartBlockNotFinalized);
        }

        let set_changes = self
            .authority_set_state
            .authority_set_changes_after(begin.number);

        let mut proof = WarpSyncProof::empty();
        let mut limit_reached = false;

        for change_number in set_changes {
            let header = self
                .block_state
                .header_by_number(change_number)
                .ok_or(Error::MissingHeader(change_number))?;

            // The last block of a set must announce the handoff to the next
            // set. If the digest is absent, the set changed through a forced
            // change and the chain of trust in authority handoffs is broken;
            // proving stops here.
            let scheduled_change =
                header::find_grandpa_scheduled_change(&header, self.block_number_bytes)
                    .map_err(Error::InvalidScheduledChange)?;
            if scheduled_change.is_none() {
                break;
            }

            let header_hash = header.hash(self.block_number_bytes);
            let encoded_justification = self
                .block_state
                .justification(&header_hash)
                .ok_or(Error::MissingJustification)?;
            let justification = decode::decode_grandpa_justification(
                &encoded_justification,
                self.block_number_bytes,
            )
            .map_err(Error::InvalidJustification)?;

            limit_reached = proof.add_fragment(
                WarpSyncFragment {
                    header,
                    justification,
                },
                self.block_number_bytes,
            );
            if limit_reached {
                break;
            }
        }

        if !limit_reached {
            // No size limit was hit: close the proof with the latest
            // finalized block, so that the requester learns about the head
            // of the chain and not only about the last handoff.
            let finalized_hash = highest_finalized.hash(self.block_number_bytes);
            let encoded_justification = self
                .block_state
                .justification(&finalized_hash)
                .ok_or(Error::MissingJustification)?;
            let justification = decode::decode_grandpa_justification(
                &encoded_justification,
                self.block_number_bytes,
            )
            .map_err(Error::InvalidJustification)?;

            // The terminal justification must not prove a block lower than
            // the last recorded handoff.
            if justification.commit.target_number >= proof.last_proof_block_number() {
                let _ = proof.add_fragment(
                    WarpSyncFragment {
                        header: highest_finalized,
                        justification,
                    },
                    self.block_number_bytes,
                );
            }

            proof.is_finished = true;
        }

        Ok(proof.scale_encoding_vec(self.block_number_bytes))
    }

    /// Checks the validity of an encoded warp sync proof against the given
    /// starting authority set.
    ///
    /// Fragments designating a block listed in the configured hard forks are
    /// **not** verified; the override recorded there is adopted instead. See
    /// [`HardFork`].
    pub fn verify(
        &self,
        encoded_proof: &[u8],
        set_id: u64,
        authorities: &[GrandpaAuthority],
    ) -> Result<VerificationResult, Error> {
        let proof = WarpSyncProof::decode(encoded_proof, self.block_number_bytes)?;

        if proof.fragments.is_empty() {
            return Err(Error::EmptyProof);
        }

        let mut current_set_id = set_id;
        let mut current_authorities = authorities.to_vec();

        let num_fragments = proof.fragments.len();
        for (fragment_index, fragment) in proof.fragments.iter().enumerate() {
            let header_hash = fragment.header.hash(self.block_number_bytes);

            if let Some((fork_set_id, fork_authorities)) =
                self.hard_forks.get(&(header_hash, fragment.header.number))
            {
                current_set_id = *fork_set_id;
                current_authorities = fork_authorities.clone();
                continue;
            }

            verify::verify(verify::VerifyConfig {
                justification: &fragment.justification,
                block_number_bytes: self.block_number_bytes,
                expected_target_hash: &header_hash,
                expected_target_number: fragment.header.number,
                authorities_set_id: current_set_id,
                authorities_list: &current_authorities,
                randomness_seed: rand::random(),
            })
            .map_err(Error::Verify)?;

            let scheduled_change = header::find_grandpa_scheduled_change(
                &fragment.header,
                self.block_number_bytes,
            )
            .map_err(Error::InvalidScheduledChange)?;

            match scheduled_change {
                Some(change) => {
                    current_set_id += 1;
                    current_authorities = change.next_authorities;
                }
                // Only the terminal fragment of a finished proof may lack a
                // handoff announcement.
                None if fragment_index == num_fragments - 1 && proof.is_finished => {}
                None => return Err(Error::MissingAuthoritySetChange),
            }
        }

        Ok(VerificationResult {
            set_id: current_set_id,
            authority_list: current_authorities,
            header: proof.fragments[num_fragments - 1].header.clone(),
            completed: proof.is_finished,
        })
    }
}

fn nom_warp_sync_proof<'a, E>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], WarpSyncProof, E>
where
    E: nom::error::ParseError<&'a [u8]> + nom::error::ContextError<&'a [u8]>,
{
    nom::combinator::map(
        nom::sequence::tuple((
            nom::combinator::flat_map(util::nom_scale_compact_usize, move |num_elems| {
                nom::multi::many_m_n(
                    num_elems,
                    num_elems,
                    nom::combinator::map(
                        nom::sequence::tuple((
                            header::nom_header_decode(block_number_bytes),
                            decode::nom_grandpa_justification(block_number_bytes),
                        )),
                        |(header, justification)| WarpSyncFragment {
                            header,
                            justification,
                        },
                    ),
                )
            }),
            util::nom_bool_decode,
        )),
        |(fragments, is_finished)| WarpSyncProof {
            fragments,
            is_finished,
            proofs_length: 0,
        },
    )
}

/// Error potentially returned when generating or verifying a warp sync
/// proof.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// The block the proof generation should start at isn't known locally.
    #[display(fmt = "Missing start block")]
    MissingStartBlock,
    /// The block the proof generation should start at isn't finalized yet.
    #[display(fmt = "Start block is not finalized")]
    StartBlockNotFinalized,
    /// A header the proof generation needs isn't known locally.
    #[display(fmt = "Missing header of block {}", _0)]
    MissingHeader(u64),
    /// A justification the proof generation needs isn't stored locally.
    #[display(fmt = "Missing justification")]
    MissingJustification,
    /// The requested authority set isn't known.
    #[display(fmt = "Unknown authority set {}", _0)]
    UnknownAuthoritySet(u64),
    /// The proof isn't a valid SCALE encoding.
    #[display(fmt = "Invalid warp sync proof encoding")]
    InvalidProofEncoding,
    /// The proof contains no fragment.
    #[display(fmt = "Empty warp sync proof")]
    EmptyProof,
    /// A justification embedded in a proof fragment is invalid.
    #[display(fmt = "Invalid justification in warp sync proof: {}", _0)]
    Verify(verify::Error),
    /// A justification couldn't be decoded.
    #[display(fmt = "Invalid justification encoding in warp sync proof")]
    InvalidJustification(decode::Error),
    /// A GRANDPA digest item couldn't be decoded.
    #[display(fmt = "Invalid scheduled change digest")]
    InvalidScheduledChange(header::GrandpaLogError),
    /// A non-terminal fragment doesn't announce an authority set handoff.
    #[display(fmt = "Header is missing an authority set change digest")]
    MissingAuthoritySetChange,
}
