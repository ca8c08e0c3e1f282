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

//! Internal module. SCALE codec building blocks shared by the wire-facing
//! modules, plus a seedable hasher for maps whose keys are
//! attacker-controlled.

use core::{cmp, mem};

/// Implementation of the `BuildHasher` trait for the sip hasher.
///
/// Contrary to the one in the standard library, a seed is explicitly passed
/// here, making the hashing predictable.
pub(crate) struct SipHasherBuild([u8; 16]);

impl SipHasherBuild {
    pub(crate) fn new(seed: [u8; 16]) -> SipHasherBuild {
        SipHasherBuild(seed)
    }
}

impl core::hash::BuildHasher for SipHasherBuild {
    type Hasher = siphasher::sip::SipHasher;

    fn build_hasher(&self) -> Self::Hasher {
        siphasher::sip::SipHasher::new_with_key(&self.0)
    }
}

/// Decodes a SCALE-encoded boolean.
pub(crate) fn nom_bool_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    bytes: &'a [u8],
) -> nom::IResult<&'a [u8], bool, E> {
    nom::branch::alt((
        nom::combinator::map(nom::bytes::complete::tag(&[0]), |_| false),
        nom::combinator::map(nom::bytes::complete::tag(&[1]), |_| true),
    ))(bytes)
}

/// Returns a parser that decodes a block number whose on-wire width is
/// `block_number_bytes`, widening it to a `u64`.
///
/// # Panic
///
/// Panics if `block_number_bytes` is zero or larger than 8.
///
pub(crate) fn nom_block_number_decode<'a, E: nom::error::ParseError<&'a [u8]>>(
    block_number_bytes: usize,
) -> impl FnMut(&'a [u8]) -> nom::IResult<&'a [u8], u64, E> {
    assert!(block_number_bytes >= 1 && block_number_bytes <= 8);
    nom::combinator::map(
        nom::bytes::complete::take(block_number_bytes),
        move |slice: &[u8]| {
            let mut num = [0u8; 8];
            num[..block_number_bytes].copy_from_slice(slice);
            u64::from_le_bytes(num)
        },
    )
}

/// Returns a buffer containing the little endian encoding of `number`, with
/// as many bytes as the chain uses to encode block numbers. Numbers too large
/// for that width are silently truncated, mirroring what the reference codec
/// does.
pub(crate) fn encode_block_number(
    number: u64,
    block_number_bytes: usize,
) -> impl AsRef<[u8]> + Clone {
    assert!(block_number_bytes >= 1 && block_number_bytes <= 8);
    let mut out = arrayvec::ArrayVec::<u8, 8>::new();
    let le = number.to_le_bytes();
    out.try_extend_from_slice(&le[..cmp::min(mem::size_of_val(&number), block_number_bytes)])
        .unwrap();
    while out.len() < block_number_bytes {
        out.push(0);
    }
    out
}

macro_rules! decode_scale_compact {
    ($fn_name:ident, $num_ty:ty) => {
        /// Decodes a SCALE-compact-encoded integer.
        ///
        /// > **Note**: When using this function outside of a `nom` "context",
        /// >           you might have to explicit the type of `E`. Use
        /// >           `nom::error::Error<&[u8]>`.
        pub(crate) fn $fn_name<'a, E: nom::error::ParseError<&'a [u8]>>(
            bytes: &'a [u8],
        ) -> nom::IResult<&'a [u8], $num_ty, E> {
            let eof =
                |bytes| nom::Err::Error(nom::error::make_error(bytes, nom::error::ErrorKind::Eof));
            let invalid = |bytes| {
                nom::Err::Error(nom::error::make_error(bytes, nom::error::ErrorKind::Satisfy))
            };

            if bytes.is_empty() {
                return Err(eof(bytes));
            }

            match bytes[0] & 0b11 {
                0b00 => {
                    let value = bytes[0] >> 2;
                    Ok((&bytes[1..], <$num_ty>::from(value)))
                }
                0b01 => {
                    if bytes.len() < 2 {
                        return Err(eof(bytes));
                    }
                    let value = (u16::from(bytes[1]) << 6) | u16::from(bytes[0] >> 2);
                    Ok((&bytes[2..], <$num_ty>::from(value)))
                }
                0b10 => {
                    if bytes.len() < 4 {
                        return Err(eof(bytes));
                    }
                    let value = (u32::from(bytes[3]) << 22)
                        | (u32::from(bytes[2]) << 14)
                        | (u32::from(bytes[1]) << 6)
                        | u32::from(bytes[0] >> 2);
                    let value = match <$num_ty>::try_from(value) {
                        Ok(v) => v,
                        Err(_) => return Err(invalid(bytes)),
                    };
                    Ok((&bytes[4..], value))
                }
                0b11 => {
                    let num_bytes = usize::from(bytes[0] >> 2) + 4;
                    if bytes.len() < num_bytes + 1 {
                        return Err(eof(bytes));
                    }

                    // The encoding is canonical only if the most significant
                    // byte is non-zero.
                    if bytes[num_bytes] == 0 {
                        return Err(invalid(bytes));
                    }

                    let mut out_value: $num_ty = 0;
                    for byte_index in (1..=num_bytes).rev() {
                        out_value = match out_value
                            .checked_mul(256)
                            .and_then(|v| v.checked_add(<$num_ty>::from(bytes[byte_index])))
                        {
                            Some(v) => v,
                            // Doesn't fit the output type.
                            None => return Err(invalid(bytes)),
                        };
                    }

                    Ok((&bytes[num_bytes + 1..], out_value))
                }
                _ => unreachable!(),
            }
        }
    };
}

decode_scale_compact!(nom_scale_compact_usize, usize);
decode_scale_compact!(nom_scale_compact_u64, u64);

macro_rules! encode_scale_compact {
    ($fn_name:ident, $num_ty:ty) => {
        /// Returns a buffer containing the SCALE-compact encoding of the
        /// parameter.
        pub(crate) fn $fn_name(mut value: $num_ty) -> impl AsRef<[u8]> + Clone {
            const MAX_BYTES: usize = 1 + (<$num_ty>::BITS as usize) / 8;
            let mut out = arrayvec::ArrayVec::<u8, MAX_BYTES>::new();

            if value < 64 {
                out.push(u8::try_from(value).unwrap() << 2);
            } else if value < (1 << 14) {
                out.push((u8::try_from(value & 0b111111).unwrap() << 2) | 0b01);
                out.push(u8::try_from((value >> 6) & 0xff).unwrap());
            } else if value < (1 << 30) {
                out.push((u8::try_from(value & 0b111111).unwrap() << 2) | 0b10);
                out.push(u8::try_from((value >> 6) & 0xff).unwrap());
                out.push(u8::try_from((value >> 14) & 0xff).unwrap());
                out.push(u8::try_from((value >> 22) & 0xff).unwrap());
            } else {
                out.push(0);
                while value != 0 {
                    out.push(u8::try_from(value & 0xff).unwrap());
                    value >>= 8;
                }
                out[0] = (u8::try_from(out.len() - 1 - 4).unwrap() << 2) | 0b11;
            }

            out
        }
    };
}

encode_scale_compact!(encode_scale_compact_u64, u64);
encode_scale_compact!(encode_scale_compact_usize, usize);

#[cfg(test)]
mod tests {
    #[test]
    fn compact_round_trips() {
        for value in [
            0usize, 1, 63, 64, 5000, 16383, 16384, 1073741823, 1073741824, 4294967295,
        ] {
            let encoded = super::encode_scale_compact_usize(value);
            let (rest, decoded) =
                super::nom_scale_compact_usize::<nom::error::Error<&[u8]>>(encoded.as_ref())
                    .unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn compact_rejects_non_canonical() {
        // Value that fits a single byte, encoded with the multi-byte mode.
        assert!(
            super::nom_scale_compact_usize::<nom::error::Error<&[u8]>>(&[0b11, 5, 0, 0, 0, 0])
                .is_err()
        );
    }

    #[test]
    fn block_number_width() {
        let encoded = super::encode_block_number(1_000_000, 4);
        assert_eq!(encoded.as_ref(), &1_000_000u32.to_le_bytes()[..]);

        let (rest, decoded) =
            super::nom_block_number_decode::<nom::error::Error<&[u8]>>(4)(encoded.as_ref())
                .unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, 1_000_000);
    }
}
