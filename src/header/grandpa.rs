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

use super::{DigestItem, Header};
use crate::util;

/// Consensus engine identifier of the GRANDPA finality gadget.
pub const GRANDPA_ENGINE_ID: [u8; 4] = *b"FRNK";

/// A GRANDPA message contained in the `Consensus` digest item of a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrandpaConsensusLog {
    /// Schedule an authority set change.
    ///
    /// The earliest digest of this type in a single block will be respected.
    ScheduledChange(GrandpaScheduledChange),

    /// Force an authority set change.
    ///
    /// Contrary to a scheduled change, a forced change is applied without a
    /// finality proof of the announcing block, breaking the chain of trust
    /// in authority handoffs.
    ForcedChange {
        /// Median last finalized block when the change was signaled.
        reset_block_height: u64,
        /// The change itself.
        change: GrandpaScheduledChange,
    },

    /// Note that the authority with given index is disabled until the next
    /// change.
    OnDisabled(u64),

    /// A signal to pause the current authority set after the given delay.
    Pause(u64),

    /// A signal to resume the current authority set after the given delay.
    Resume(u64),
}

impl GrandpaConsensusLog {
    /// Attempt to decode a GRANDPA consensus digest payload.
    pub fn decode(
        payload: &[u8],
        block_number_bytes: usize,
    ) -> Result<GrandpaConsensusLog, GrandpaLogError> {
        match nom::combinator::all_consuming(grandpa_log::<nom::error::Error<&[u8]>>(
            block_number_bytes,
        ))(payload)
        {
            Ok((_, log)) => Ok(log),
            Err(_) => Err(GrandpaLogError),
        }
    }
}

/// An authority set change scheduled to be enacted after a delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrandpaScheduledChange {
    /// The authorities empowered once the change is enacted.
    pub next_authorities: Vec<GrandpaAuthority>,
    /// Number of blocks after the announcing block before the change takes
    /// effect.
    pub delay: u64,
}

impl GrandpaScheduledChange {
    /// Returns the SCALE encoding of the change, without any enum index in
    /// front.
    pub fn scale_encoding_vec(&self, block_number_bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.next_authorities.len() * 40 + 8);
        out.extend_from_slice(
            util::encode_scale_compact_usize(self.next_authorities.len()).as_ref(),
        );
        for authority in &self.next_authorities {
            out.extend_from_slice(&authority.public_key);
            out.extend_from_slice(&authority.weight.to_le_bytes());
        }
        out.extend_from_slice(util::encode_block_number(self.delay, block_number_bytes).as_ref());
        out
    }

    /// Returns a `Consensus` digest item announcing this change.
    pub fn into_digest_item(self, block_number_bytes: usize) -> DigestItem {
        let mut payload = Vec::with_capacity(1 + 5 + self.next_authorities.len() * 40 + 8);
        payload.push(1);
        payload.extend_from_slice(&self.scale_encoding_vec(block_number_bytes));
        DigestItem::Consensus {
            engine_id: GRANDPA_ENGINE_ID,
            payload,
        }
    }
}

/// A member of an authority set, with its voting weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrandpaAuthority {
    /// ed25519 public key of the authority.
    pub public_key: [u8; 32],

    /// Voting weight, rarely different from 1.
    pub weight: u64,
}

/// Error potentially returned by [`GrandpaConsensusLog::decode`].
#[derive(Debug, derive_more::Display, Clone)]
#[display(fmt = "Invalid GRANDPA consensus digest")]
pub struct GrandpaLogError;

/// Looks for a scheduled authority set change announced in the given header.
///
/// Forced changes and other GRANDPA digest items are ignored. Returns an
/// error if the header contains a GRANDPA consensus digest that cannot be
/// decoded.
pub fn find_grandpa_scheduled_change(
    header: &Header,
    block_number_bytes: usize,
) -> Result<Option<GrandpaScheduledChange>, GrandpaLogError> {
    for item in &header.digest.logs {
        let payload = match item {
            DigestItem::Consensus { engine_id, payload } if *engine_id == GRANDPA_ENGINE_ID => {
                payload
            }
            _ => continue,
        };

        if let GrandpaConsensusLog::ScheduledChange(change) =
            GrandpaConsensusLog::decode(payload, block_number_bytes)?
        {
            return Ok(Some(change));
        }
    }

    Ok(None)
}

fn grandpa_log<'a, E: nom::error::ParseError<&'a [u8]>>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], GrandpaConsensusLog, E> {
    nom::branch::alt((
        nom::combinator::map(
            nom::sequence::preceded(
                nom::bytes::complete::tag(&[1]),
                scheduled_change(block_number_bytes),
            ),
            GrandpaConsensusLog::ScheduledChange,
        ),
        nom::combinator::map(
            nom::sequence::preceded(
                nom::bytes::complete::tag(&[2]),
                nom::sequence::tuple((
                    util::nom_block_number_decode(block_number_bytes),
                    scheduled_change(block_number_bytes),
                )),
            ),
            |(reset_block_height, change)| GrandpaConsensusLog::ForcedChange {
                reset_block_height,
                change,
            },
        ),
        nom::combinator::map(
            nom::sequence::preceded(
                nom::bytes::complete::tag(&[3]),
                nom::number::complete::le_u64,
            ),
            GrandpaConsensusLog::OnDisabled,
        ),
        nom::combinator::map(
            nom::sequence::preceded(
                nom::bytes::complete::tag(&[4]),
                util::nom_block_number_decode(block_number_bytes),
            ),
            GrandpaConsensusLog::Pause,
        ),
        nom::combinator::map(
            nom::sequence::preceded(
                nom::bytes::complete::tag(&[5]),
                util::nom_block_number_decode(block_number_bytes),
            ),
            GrandpaConsensusLog::Resume,
        ),
    ))
}

fn scheduled_change<'a, E: nom::error::ParseError<&'a [u8]>>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], GrandpaScheduledChange, E> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::combinator::flat_map(util::nom_scale_compact_usize, |num_elems| {
                nom::multi::many_m_n(num_elems, num_elems, grandpa_authority)
            }),
            util::nom_block_number_decode(block_number_bytes),
        )),
        |(next_authorities, delay)| GrandpaScheduledChange {
            next_authorities,
            delay,
        },
    )
}

fn grandpa_authority<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], GrandpaAuthority, E> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::bytes::complete::take(32u32),
            nom::number::complete::le_u64,
        )),
        |(public_key, weight): (&[u8], u64)| GrandpaAuthority {
            public_key: <[u8; 32]>::try_from(public_key).unwrap(),
            weight,
        },
    )(bytes)
}
