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

//! Verification of GRANDPA justifications.
//!
//! A justification finalizes a block under a given authority set if:
//!
//! - Its commit designates the expected block.
//! - The precommits carrying a valid signature from a member of the set
//!   account, without counting any voter twice, for strictly more than two
//!   thirds of the total voting weight.
//! - Every precommit votes for the committed block or one of its
//!   descendants, as proven by the ancestry headers embedded in the
//!   justification, and no embedded header is left unused by that proof.

use crate::finality::justification::decode;
use crate::header::{self, GrandpaAuthority};
use crate::util;

use rand::Rng as _;
use rand_chacha::{rand_core::SeedableRng as _, ChaCha20Rng};

/// Configuration for a justification verification process.
#[derive(Debug)]
pub struct VerifyConfig<'a> {
    /// Justification to verify.
    pub justification: &'a decode::GrandpaJustification,

    /// Number of bytes used to encode block numbers on the wire. Used when
    /// reconstructing the payloads the authorities signed.
    pub block_number_bytes: usize,

    /// Hash of the block the justification is expected to finalize.
    pub expected_target_hash: &'a [u8; 32],

    /// Number of the block the justification is expected to finalize.
    pub expected_target_number: u64,

    /// Id of the authority set the justification was produced under.
    pub authorities_set_id: u64,

    /// Members of that authority set. Must not be empty.
    pub authorities_list: &'a [GrandpaAuthority],

    /// Seed for a PRNG used to protect in-memory hash maps against
    /// collision attacks. The verification outcome is nonetheless
    /// deterministic.
    pub randomness_seed: [u8; 32],
}

/// Verifies that a justification is valid.
pub fn verify(config: VerifyConfig) -> Result<(), Error> {
    let commit = &config.justification.commit;

    if commit.target_hash != *config.expected_target_hash
        || commit.target_number != config.expected_target_number
    {
        return Err(Error::BadJustification(BadJustification::InvalidCommitTarget {
            target_hash: commit.target_hash,
            target_number: commit.target_number,
        }));
    }

    if config.authorities_list.is_empty() {
        return Err(Error::InvalidAuthoritySet);
    }

    let mut randomness = ChaCha20Rng::from_seed(config.randomness_seed);

    // Voting weight of the whole set, and the weight that must approve the
    // commit for it to be valid.
    let total_weight = config
        .authorities_list
        .iter()
        .fold(0u64, |sum, a| sum.saturating_add(a.weight));
    let threshold = total_weight.saturating_mul(2) / 3 + 1;

    // Authorities that have already been counted, to make sure that a voter
    // signing twice is only counted once.
    let mut seen_pub_keys = hashbrown::HashSet::with_capacity_and_hasher(
        commit.precommits.len(),
        util::SipHasherBuild::new(randomness.gen()),
    );

    let mut approved_weight = 0u64;
    for precommit in &commit.precommits {
        let authority = config
            .authorities_list
            .iter()
            .find(|a| a.public_key == precommit.authority_public_key);

        // Precommits from signers outside of the authority set contribute no
        // weight.
        let authority = match authority {
            Some(a) => a,
            None => continue,
        };

        // The message covered by the signature contains the precommit
        // itself, localized to the round and the authority set id.
        let mut msg = Vec::with_capacity(1 + 32 + config.block_number_bytes + 8 + 8);
        msg.push(1u8); // Tag of a precommit message.
        msg.extend_from_slice(&precommit.target_hash[..]);
        msg.extend_from_slice(
            util::encode_block_number(precommit.target_number, config.block_number_bytes)
                .as_ref(),
        );
        msg.extend_from_slice(&u64::to_le_bytes(config.justification.round)[..]);
        msg.extend_from_slice(&u64::to_le_bytes(config.authorities_set_id)[..]);
        debug_assert_eq!(msg.len(), msg.capacity());

        let signature_valid = ed25519_zebra::VerificationKey::try_from(
            precommit.authority_public_key,
        )
        .and_then(|key| key.verify(&ed25519_zebra::Signature::from(precommit.signature), &msg))
        .is_ok();
        if !signature_valid {
            return Err(Error::BadJustification(BadJustification::SignatureFailed(
                precommit.authority_public_key,
            )));
        }

        if seen_pub_keys.insert(precommit.authority_public_key) {
            approved_weight = approved_weight.saturating_add(authority.weight);
        }
    }

    if approved_weight < threshold {
        return Err(Error::BadJustification(BadJustification::InvalidCommit {
            approved_weight,
            threshold,
        }));
    }

    // Every voted-upon block must be proven, through the embedded ancestry
    // headers, to descend from the committed block.
    let ancestry_chain = AncestryChain::new(
        &config.justification.vote_ancestries,
        config.block_number_bytes,
        randomness.gen(),
    );

    let mut visited_hashes = hashbrown::HashSet::with_capacity_and_hasher(
        config.justification.vote_ancestries.len(),
        util::SipHasherBuild::new(randomness.gen()),
    );
    for precommit in &commit.precommits {
        if precommit.target_hash == commit.target_hash {
            continue;
        }

        match ancestry_chain.ancestry(&commit.target_hash, &precommit.target_hash) {
            Ok(route) => {
                // The route excludes its end points, but the precommit
                // target's own header had to be looked up to walk it.
                visited_hashes.insert(precommit.target_hash);
                visited_hashes.extend(route);
            }
            Err(AncestryError::BlockNotDescendantOfBase) => {
                return Err(Error::BadJustification(
                    BadJustification::InvalidPrecommitAncestries,
                ));
            }
        }
    }

    if config
        .justification
        .vote_ancestries
        .iter()
        .any(|h| !visited_hashes.contains(&h.hash(config.block_number_bytes)))
    {
        return Err(Error::BadJustification(
            BadJustification::UnusedAncestryHeaders,
        ));
    }

    Ok(())
}

/// Error that can happen while verifying a justification.
#[derive(Debug, derive_more::Display, Clone)]
pub enum Error {
    /// The authority set supplied for the verification is empty.
    #[display(fmt = "Empty authority set supplied for the verification")]
    InvalidAuthoritySet,
    /// The justification itself is invalid.
    #[display(fmt = "Bad justification: {}", _0)]
    BadJustification(BadJustification),
}

/// Way in which a justification is invalid.
#[derive(Debug, derive_more::Display, Clone)]
pub enum BadJustification {
    /// The commit designates a different block than expected.
    #[display(fmt = "Invalid commit target in justification")]
    InvalidCommitTarget {
        /// Hash found in the commit.
        target_hash: [u8; 32],
        /// Number found in the commit.
        target_number: u64,
    },
    /// One of the signatures can't be verified.
    #[display(fmt = "Invalid precommit signature in justification")]
    SignatureFailed([u8; 32]),
    /// The valid precommits don't account for a supermajority of the voting
    /// weight.
    #[display(
        fmt = "Invalid commit: approved weight {} below threshold {}",
        approved_weight,
        threshold
    )]
    InvalidCommit {
        approved_weight: u64,
        threshold: u64,
    },
    /// A precommit target could not be proven to descend from the commit
    /// target.
    #[display(fmt = "Invalid precommit ancestries in justification")]
    InvalidPrecommitAncestries,
    /// The justification embeds ancestry headers that no precommit needs.
    #[display(fmt = "Unused ancestry headers in justification")]
    UnusedAncestryHeaders,
}

/// Lookup from block hash to header, built from the ancestry headers of a
/// single justification.
pub struct AncestryChain {
    ancestry: hashbrown::HashMap<[u8; 32], HeaderInfo, util::SipHasherBuild>,
}

/// Fields of a header the ancestry traversal needs.
struct HeaderInfo {
    parent_hash: [u8; 32],
}

impl AncestryChain {
    /// Builds the lookup from a list of headers.
    pub fn new(
        vote_ancestries: &[header::Header],
        block_number_bytes: usize,
        randomness_seed: [u8; 16],
    ) -> AncestryChain {
        let mut ancestry = hashbrown::HashMap::with_capacity_and_hasher(
            vote_ancestries.len(),
            util::SipHasherBuild::new(randomness_seed),
        );
        for ancestry_header in vote_ancestries {
            ancestry.insert(
                ancestry_header.hash(block_number_bytes),
                HeaderInfo {
                    parent_hash: ancestry_header.parent_hash,
                },
            );
        }

        AncestryChain { ancestry }
    }

    /// Returns the hashes of the blocks strictly between `base` and `block`,
    /// walking parent links from `block`. Empty when `base` and `block` are
    /// equal.
    pub fn ancestry(
        &self,
        base: &[u8; 32],
        block: &[u8; 32],
    ) -> Result<Vec<[u8; 32]>, AncestryError> {
        let mut route = Vec::new();
        let mut current_hash = *block;
        loop {
            if current_hash == *base {
                break;
            }
            match self.ancestry.get(&current_hash) {
                Some(info) => {
                    current_hash = info.parent_hash;
                    route.push(current_hash);
                }
                None => return Err(AncestryError::BlockNotDescendantOfBase),
            }
        }

        // The last pushed hash is `base` itself, which the route excludes.
        route.pop();
        Ok(route)
    }

    /// Returns `true` if `block` is equal to `base` or provably one of its
    /// descendants.
    pub fn is_equal_or_descendant_of(&self, base: &[u8; 32], block: &[u8; 32]) -> bool {
        self.ancestry(base, block).is_ok()
    }
}

/// Error potentially returned by [`AncestryChain::ancestry`].
#[derive(Debug, derive_more::Display, Clone)]
pub enum AncestryError {
    /// A parent link left the set of known headers before reaching the base.
    #[display(fmt = "Block is not a descendant of the base block")]
    BlockNotDescendantOfBase,
}
