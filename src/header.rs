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

//! Parsing of SCALE-encoded block headers.
//!
//! The header of a block consists of a list of hard coded fields such as the
//! parent block's hash or the block number, and a variable-sized list of log
//! items called the digest.
//!
//! It is under the SCALE encoding that headers are transferred over the
//! network, stored, and hashed. Use [`decode`] to turn the encoding into a
//! [`Header`], and [`Header::scale_encoding_vec`] for the reverse operation.
//!
//! The number of bytes used to encode the block number on the wire is
//! chain-specific and must be passed to every encoding or decoding function
//! as `block_number_bytes` (4 on chains with 32-bit block numbers). In
//! memory, block numbers are always held as `u64`.

use crate::util;

use core::iter;

mod grandpa;

pub use grandpa::*;

/// Returns a blake2b-256 hash of a SCALE-encoded header.
///
/// Does not verify the validity of the header.
pub fn hash_from_scale_encoded_header(header: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = blake2_rfc::blake2b::Blake2b::with_key(32, &[]);
    hasher.update(header.as_ref());

    let result = hasher.finalize();
    debug_assert_eq!(result.as_bytes().len(), 32);

    let mut out = [0; 32];
    out.copy_from_slice(result.as_bytes());
    out
}

/// Attempt to decode the given SCALE-encoded header.
pub fn decode(scale_encoded: &[u8], block_number_bytes: usize) -> Result<Header, Error> {
    let (header, remainder) = decode_partial(scale_encoded, block_number_bytes)?;
    if !remainder.is_empty() {
        return Err(Error::TooLong);
    }

    Ok(header)
}

/// Attempt to decode the given SCALE-encoded header.
///
/// Contrary to [`decode`], doesn't return an error if the slice is too long
/// but returns the remainder.
pub fn decode_partial(
    scale_encoded: &[u8],
    block_number_bytes: usize,
) -> Result<(Header, &[u8]), Error> {
    match nom_header_decode::<nom::error::Error<&[u8]>>(block_number_bytes)(scale_encoded) {
        Ok((remainder, header)) => Ok((header, remainder)),
        Err(_) => Err(Error::InvalidFormat),
    }
}

/// Potential error when decoding a header.
#[derive(Debug, derive_more::Display, Clone)]
pub enum Error {
    /// Header is not a valid SCALE encoding.
    InvalidFormat,
    /// Header is too long.
    TooLong,
}

/// Header of a block, after decoding.
///
/// Note that the information in there is not guaranteed to be exact. The
/// exactness of the information depends on the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Hash of the parent block stored in the header.
    pub parent_hash: [u8; 32],
    /// Block number stored in the header.
    pub number: u64,
    /// The state trie Merkle root.
    pub state_root: [u8; 32],
    /// The Merkle root of the extrinsics.
    pub extrinsics_root: [u8; 32],
    /// List of auxiliary data appended to the block header.
    pub digest: Digest,
}

impl Header {
    /// Returns an iterator to a list of buffers which, when concatenated,
    /// produce the SCALE encoding of the header.
    ///
    /// The block number is SCALE-compact-encoded in headers;
    /// `block_number_bytes` only matters for the number-typed fields found
    /// inside certain digest log payloads and is accepted here so that all
    /// codec entry points have the same shape.
    pub fn scale_encoding(
        &self,
        _block_number_bytes: usize,
    ) -> impl Iterator<Item = impl AsRef<[u8]> + Clone + '_> + Clone + '_ {
        iter::once(either::Left(either::Left(&self.parent_hash[..])))
            .chain(iter::once(either::Left(either::Right(
                util::encode_scale_compact_u64(self.number),
            ))))
            .chain(iter::once(either::Left(either::Left(&self.state_root[..]))))
            .chain(iter::once(either::Left(either::Left(
                &self.extrinsics_root[..],
            ))))
            .chain(self.digest.scale_encoding().map(either::Right))
    }

    /// Equivalent to [`Header::scale_encoding`] but returns the data in a
    /// `Vec`.
    pub fn scale_encoding_vec(&self, block_number_bytes: usize) -> Vec<u8> {
        self.scale_encoding(block_number_bytes)
            .fold(Vec::new(), |mut a, b| {
                a.extend_from_slice(b.as_ref());
                a
            })
    }

    /// Builds the hash of the header.
    pub fn hash(&self, block_number_bytes: usize) -> [u8; 32] {
        hash_from_scale_encoded_header(self.scale_encoding_vec(block_number_bytes))
    }
}

/// Generic header digest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Digest {
    /// List of log items, in the order they appear in the header.
    pub logs: Vec<DigestItem>,
}

impl Digest {
    /// Returns a digest with empty logs.
    pub fn empty() -> Digest {
        Digest { logs: Vec::new() }
    }

    /// Returns an iterator to a list of buffers which, when concatenated,
    /// produce the SCALE encoding of the digest.
    pub fn scale_encoding(
        &self,
    ) -> impl Iterator<Item = impl AsRef<[u8]> + Clone + '_> + Clone + '_ {
        iter::once(either::Right(util::encode_scale_compact_usize(
            self.logs.len(),
        )))
        .chain(
            self.logs
                .iter()
                .flat_map(|item| item.scale_encoding().map(either::Left)),
        )
    }
}

/// An individual entry of a [`Digest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestItem {
    /// Item emitted by a consensus engine before the block is executed,
    /// typically carrying slot claims.
    PreRuntime {
        /// Identifier of the consensus engine the item belongs to.
        engine_id: [u8; 4],
        /// Opaque data whose meaning is specific to the engine.
        payload: Vec<u8>,
    },
    /// Message from the runtime to the consensus engine, such as an
    /// authority set change announcement.
    Consensus {
        engine_id: [u8; 4],
        payload: Vec<u8>,
    },
    /// Signature of the block producer. Always the last item of the digest.
    Seal {
        engine_id: [u8; 4],
        payload: Vec<u8>,
    },
    /// Indicates that the runtime code or heap pages changed in this block.
    RuntimeEnvironmentUpdated,
}

impl DigestItem {
    /// Returns an iterator to a list of buffers which, when concatenated,
    /// produce the SCALE encoding of the digest item.
    pub fn scale_encoding(
        &self,
    ) -> impl Iterator<Item = impl AsRef<[u8]> + Clone + '_> + Clone + '_ {
        let (tag, engine_id, payload) = match self {
            DigestItem::Consensus { engine_id, payload } => (4u8, Some(engine_id), Some(payload)),
            DigestItem::Seal { engine_id, payload } => (5, Some(engine_id), Some(payload)),
            DigestItem::PreRuntime { engine_id, payload } => (6, Some(engine_id), Some(payload)),
            DigestItem::RuntimeEnvironmentUpdated => (8, None, None),
        };

        let mut out = Vec::with_capacity(
            1 + 4 + 5 + payload.as_ref().map_or(0, |p| p.len()),
        );
        out.push(tag);
        if let Some(engine_id) = engine_id {
            out.extend_from_slice(&engine_id[..]);
        }
        if let Some(payload) = payload {
            out.extend_from_slice(util::encode_scale_compact_usize(payload.len()).as_ref());
            out.extend_from_slice(payload);
        }

        iter::once(out)
    }
}

/// `nom` parser for a SCALE-encoded header.
pub(crate) fn nom_header_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    _block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], Header, E> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::bytes::complete::take(32u32),
            util::nom_scale_compact_u64,
            nom::bytes::complete::take(32u32),
            nom::bytes::complete::take(32u32),
            nom::combinator::flat_map(util::nom_scale_compact_usize, |num_items| {
                nom::multi::many_m_n(num_items, num_items, digest_item)
            }),
        )),
        |(parent_hash, number, state_root, extrinsics_root, logs)| Header {
            parent_hash: <[u8; 32]>::try_from(parent_hash).unwrap(),
            number,
            state_root: <[u8; 32]>::try_from(state_root).unwrap(),
            extrinsics_root: <[u8; 32]>::try_from(extrinsics_root).unwrap(),
            digest: Digest { logs },
        },
    )
}

fn digest_item<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], DigestItem, E> {
    nom::branch::alt((
        nom::combinator::map(
            nom::sequence::preceded(nom::bytes::complete::tag(&[4]), engine_id_and_payload),
            |(engine_id, payload)| DigestItem::Consensus { engine_id, payload },
        ),
        nom::combinator::map(
            nom::sequence::preceded(nom::bytes::complete::tag(&[5]), engine_id_and_payload),
            |(engine_id, payload)| DigestItem::Seal { engine_id, payload },
        ),
        nom::combinator::map(
            nom::sequence::preceded(nom::bytes::complete::tag(&[6]), engine_id_and_payload),
            |(engine_id, payload)| DigestItem::PreRuntime { engine_id, payload },
        ),
        nom::combinator::map(nom::bytes::complete::tag(&[8]), |_| {
            DigestItem::RuntimeEnvironmentUpdated
        }),
    ))(bytes)
}

fn engine_id_and_payload<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], ([u8; 4], Vec<u8>), E> {
    nom::combinator::map(
        nom::sequence::tuple((
            nom::bytes::complete::take(4u32),
            nom::multi::length_data(util::nom_scale_compact_usize),
        )),
        |(engine_id, payload): (&[u8], &[u8])| {
            (
                <[u8; 4]>::try_from(engine_id).unwrap(),
                payload.to_vec(),
            )
        },
    )(bytes)
}

#[cfg(test)]
mod tests {
    use super::{decode, Digest, DigestItem, Header};

    #[test]
    fn encode_decode_round_trip() {
        let header = Header {
            parent_hash: [0xab; 32],
            number: 7_777_777,
            state_root: [0x01; 32],
            extrinsics_root: [0x02; 32],
            digest: Digest {
                logs: vec![
                    DigestItem::PreRuntime {
                        engine_id: *b"BABE",
                        payload: vec![1, 2, 3],
                    },
                    DigestItem::Consensus {
                        engine_id: *b"FRNK",
                        payload: vec![9; 40],
                    },
                    DigestItem::RuntimeEnvironmentUpdated,
                    DigestItem::Seal {
                        engine_id: *b"BABE",
                        payload: vec![0; 64],
                    },
                ],
            },
        };

        let encoded = header.scale_encoding_vec(4);
        let decoded = decode(&encoded, 4).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn hash_matches_encoding() {
        let header = Header {
            parent_hash: [0; 32],
            number: 42,
            state_root: [3; 32],
            extrinsics_root: [4; 32],
            digest: Digest::empty(),
        };

        assert_eq!(
            header.hash(4),
            super::hash_from_scale_encoded_header(header.scale_encoding_vec(4))
        );
    }

    #[test]
    fn trailing_data_rejected() {
        let mut encoded = Header {
            parent_hash: [0; 32],
            number: 1,
            state_root: [0; 32],
            extrinsics_root: [0; 32],
            digest: Digest::empty(),
        }
        .scale_encoding_vec(4);
        encoded.push(0xff);

        assert!(matches!(decode(&encoded, 4), Err(super::Error::TooLong)));
    }
}
