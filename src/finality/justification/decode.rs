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

//! Decoding and re-encoding of SCALE-encoded GRANDPA justifications.

use crate::header;
use crate::util;

/// Attempt to decode the given SCALE-encoded justification.
pub fn decode_grandpa_justification(
    scale_encoded: &[u8],
    block_number_bytes: usize,
) -> Result<GrandpaJustification, Error> {
    match nom::combinator::all_consuming(nom_grandpa_justification::<nom::error::Error<&[u8]>>(
        block_number_bytes,
    ))(scale_encoded)
    {
        Ok((_, justification)) => Ok(justification),
        Err(_) => Err(Error),
    }
}

/// Attempt to decode the given SCALE-encoded justification.
///
/// Contrary to [`decode_grandpa_justification`], doesn't return an error if
/// the slice is too long, but returns the remainder.
pub fn decode_partial_grandpa_justification(
    scale_encoded: &[u8],
    block_number_bytes: usize,
) -> Result<(GrandpaJustification, &[u8]), Error> {
    match nom_grandpa_justification::<nom::error::Error<&[u8]>>(block_number_bytes)(scale_encoded) {
        Ok((remainder, justification)) => Ok((justification, remainder)),
        Err(_) => Err(Error),
    }
}

/// Error potentially returned when decoding a justification.
#[derive(Debug, derive_more::Display, Clone)]
#[display(fmt = "Failed to decode GRANDPA justification")]
pub struct Error;

/// Proof that a block has been finalized by a given authority set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrandpaJustification {
    /// Round of the GRANDPA protocol during which the commit was produced.
    pub round: u64,
    /// The commit, i.e. the finalized block and the votes backing it.
    pub commit: Commit,
    /// Headers proving that every precommit target is a descendant of the
    /// commit target. Must not contain any header that the verification
    /// doesn't visit.
    pub vote_ancestries: Vec<header::Header>,
}

impl GrandpaJustification {
    /// Hash and number of the block this justification finalizes.
    pub fn target(&self) -> ([u8; 32], u64) {
        (self.commit.target_hash, self.commit.target_number)
    }

    /// Returns the SCALE encoding of the justification.
    pub fn scale_encoding_vec(&self, block_number_bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + 32 + block_number_bytes
                + 5
                + self.commit.precommits.len() * (32 + block_number_bytes + 64 + 32)
                + 5,
        );

        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(&self.commit.target_hash);
        out.extend_from_slice(
            util::encode_block_number(self.commit.target_number, block_number_bytes).as_ref(),
        );
        out.extend_from_slice(
            util::encode_scale_compact_usize(self.commit.precommits.len()).as_ref(),
        );
        for precommit in &self.commit.precommits {
            out.extend_from_slice(&precommit.target_hash);
            out.extend_from_slice(
                util::encode_block_number(precommit.target_number, block_number_bytes).as_ref(),
            );
            out.extend_from_slice(&precommit.signature);
            out.extend_from_slice(&precommit.authority_public_key);
        }
        out.extend_from_slice(
            util::encode_scale_compact_usize(self.vote_ancestries.len()).as_ref(),
        );
        for ancestry_header in &self.vote_ancestries {
            out.extend_from_slice(&ancestry_header.scale_encoding_vec(block_number_bytes));
        }

        out
    }
}

/// Finalized block and the votes backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Hash of the finalized block.
    pub target_hash: [u8; 32],
    /// Number of the finalized block.
    pub target_number: u64,
    /// One signed precommit per authority that voted.
    pub precommits: Vec<SignedPrecommit>,
}

/// Vote of a single authority for a block to be finalized, and its
/// signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPrecommit {
    /// Hash of the block concerned by the precommit.
    pub target_hash: [u8; 32],
    /// Number of the block concerned by the precommit.
    pub target_number: u64,
    /// ed25519 signature made by the authority over the localized payload of
    /// the precommit. See [`verify`](super::verify) for the payload layout.
    pub signature: [u8; 64],
    /// ed25519 public key of the authority that produced the signature.
    pub authority_public_key: [u8; 32],
}

pub(crate) fn nom_grandpa_justification<'a, E>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], GrandpaJustification, E>
where
    E: nom::error::ParseError<&'a [u8]> + nom::error::ContextError<&'a [u8]>,
{
    nom::error::context(
        "grandpa_justification",
        nom::combinator::map(
            nom::sequence::tuple((
                nom::number::complete::le_u64,
                commit(block_number_bytes),
                nom::combinator::flat_map(util::nom_scale_compact_usize, move |num_elems| {
                    nom::multi::many_m_n(
                        num_elems,
                        num_elems,
                        header::nom_header_decode(block_number_bytes),
                    )
                }),
            )),
            |(round, commit, vote_ancestries)| GrandpaJustification {
                round,
                commit,
                vote_ancestries,
            },
        ),
    )
}

fn commit<'a, E>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], Commit, E>
where
    E: nom::error::ParseError<&'a [u8]> + nom::error::ContextError<&'a [u8]>,
{
    nom::error::context(
        "commit",
        nom::combinator::map(
            nom::sequence::tuple((
                nom::bytes::complete::take(32u32),
                util::nom_block_number_decode(block_number_bytes),
                nom::combinator::flat_map(util::nom_scale_compact_usize, move |num_elems| {
                    nom::multi::many_m_n(num_elems, num_elems, signed_precommit(block_number_bytes))
                }),
            )),
            |(target_hash, target_number, precommits)| Commit {
                target_hash: <[u8; 32]>::try_from(target_hash).unwrap(),
                target_number,
                precommits,
            },
        ),
    )
}

fn signed_precommit<'a, E>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], SignedPrecommit, E>
where
    E: nom::error::ParseError<&'a [u8]> + nom::error::ContextError<&'a [u8]>,
{
    nom::error::context(
        "signed_precommit",
        nom::combinator::map(
            nom::sequence::tuple((
                nom::bytes::complete::take(32u32),
                util::nom_block_number_decode(block_number_bytes),
                nom::bytes::complete::take(64u32),
                nom::bytes::complete::take(32u32),
            )),
            |(target_hash, target_number, signature, public_key): (&[u8], u64, &[u8], &[u8])| {
                SignedPrecommit {
                    target_hash: <[u8; 32]>::try_from(target_hash).unwrap(),
                    target_number,
                    signature: <[u8; 64]>::try_from(signature).unwrap(),
                    authority_public_key: <[u8; 32]>::try_from(public_key).unwrap(),
                }
            },
        ),
    )
}
