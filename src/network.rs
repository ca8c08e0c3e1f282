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

//! Interface between the synchronization engine and the peer-to-peer layer.
//!
//! Connection management, multiplexing and peer reputation bookkeeping
//! happen outside of this library. The [`Network`] trait is the view the
//! sync engine has of that machinery, and [`RequestMaker`] is a handle to
//! one request-response sub-protocol (`/<genesis>/sync/warp`,
//! `/<genesis>/sync/2`, …).

use crate::finality::warp_sync::WarpSyncProof;
use crate::header::Header;

use core::fmt;
use futures::future::BoxFuture;

/// Identifier of a remote peer, opaque to the sync engine.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Builds a [`PeerId`] from its opaque byte representation.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> PeerId {
        PeerId(bytes.into())
    }

    /// Returns the opaque byte representation of the peer id.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Description of a reputation adjustment applied to a peer.
///
/// Negative values lower the reputation; when the reputation of a peer falls
/// below a threshold, the peer-set manager disconnects it. The thresholds
/// themselves belong to the peer-set manager, not to this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationChange {
    /// Signed amount added to the peer's reputation.
    pub value: i32,
    /// Human-readable reason, used in logs only.
    pub reason: &'static str,
}

/// Reputation adjustments emitted by the sync engine.
pub mod rep {
    use super::ReputationChange;

    /// Peer relayed a block announcement we accepted.
    pub const GOSSIP_SUCCESS: ReputationChange = ReputationChange {
        value: 1 << 4,
        reason: "Successful gossip",
    };

    /// Peer announced a block that is known to be bad.
    pub const BAD_BLOCK_ANNOUNCEMENT: ReputationChange = ReputationChange {
        value: -(1 << 12),
        reason: "Bad block announcement",
    };

    /// Peer answered a request with a response of the wrong kind.
    pub const UNEXPECTED_RESPONSE: ReputationChange = ReputationChange {
        value: -(1 << 29),
        reason: "Unexpected response",
    };

    /// Peer sent a warp sync proof that failed verification.
    pub const BAD_WARP_PROOF: ReputationChange = ReputationChange {
        value: -(1 << 29),
        reason: "Bad warp proof",
    };

    /// Peer sent block data that failed validation.
    pub const BAD_BLOCK_RECEIVED: ReputationChange = ReputationChange {
        value: -(1 << 29),
        reason: "Bad block received",
    };
}

/// A block announcement gossiped by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAnnounce {
    /// Header of the announced block.
    pub header: Header,
    /// `true` if the sender considers the block its new best block, as
    /// opposed to merely a new block on a fork.
    pub is_best: bool,
}

/// Handshake exchanged when a block-announces substream opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAnnounceHandshake {
    /// Role of the sender on the network (full, light, authority).
    pub roles: u8,
    /// Number of the sender's best block.
    pub best_number: u64,
    /// Hash of the sender's best block.
    pub best_hash: [u8; 32],
    /// Hash of the sender's genesis block.
    pub genesis_hash: [u8; 32],
}

/// First block concerned by a blocks request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlocksRequestStart {
    /// Start at the block with the given hash.
    Hash([u8; 32]),
    /// Start at the canonical block with the given number.
    Number(u64),
}

/// Direction in which the chain is walked when answering a blocks request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlocksRequestDirection {
    /// Blocks from the lowest number to the highest.
    Ascending,
    /// Blocks from the highest number to the lowest.
    Descending,
}

/// Which parts of each block the responder should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlocksRequestFields {
    pub header: bool,
    pub body: bool,
    pub justification: bool,
}

/// Description of a blocks request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocksRequestConfig {
    /// First block concerned by the request.
    pub start: BlocksRequestStart,
    /// Direction in which the chain is walked from [`BlocksRequestConfig::start`].
    pub direction: BlocksRequestDirection,
    /// Maximum number of blocks the response should contain.
    pub desired_count: u32,
    /// Parts of each block to include in the response.
    pub fields: BlocksRequestFields,
}

/// A request emitted by a sync strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Warp sync proof request, anchored at the hash of the last proven
    /// finalized block.
    WarpProof {
        /// Hash of the latest block the requester knows to be finalized.
        begin: [u8; 32],
    },
    /// Request for a chain of block data.
    Blocks(BlocksRequestConfig),
}

/// A decoded response to a [`Request`].
///
/// The variant is determined by the sub-protocol the response arrived on;
/// strategies must nonetheless check that it matches what they asked for, as
/// the [`RequestMaker`] implementation is under the control of the embedder.
#[derive(Debug, Clone)]
pub enum Response {
    WarpProof(WarpSyncProof),
    Blocks(Vec<BlockData>),
}

/// One element of a blocks response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    /// Hash of the block.
    pub hash: [u8; 32],
    /// Header of the block, if requested.
    pub header: Option<Header>,
    /// List of the extrinsics of the block, if requested.
    pub body: Option<Vec<Vec<u8>>>,
    /// Justification proving the finality of the block, if requested and
    /// available.
    pub justification: Option<Vec<u8>>,
}

/// View the sync engine has of the peer-to-peer machinery.
pub trait Network: Send + Sync {
    /// Returns the peers a substream is currently open with.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Sends a block-announces handshake advertising `best` to every
    /// connected peer, inviting them to open a substream back.
    fn block_announce_handshake(&self, best: &Header) -> Result<(), NetworkError>;

    /// Adjusts the reputation of the given peer.
    fn report_peer(&self, who: &PeerId, change: ReputationChange);

    /// Gossips a block announcement to all peers, except `excluded`.
    fn gossip_block_announce(&self, announce: &BlockAnnounce, excluded: Option<&PeerId>);
}

/// Error potentially returned by [`Network`] methods.
#[derive(Debug, derive_more::Display, Clone)]
pub enum NetworkError {
    /// No peer is currently connected. Transient.
    NoPeersConnected,
    /// The transport layer failed in a way that is not attributable to a
    /// specific peer.
    Transport,
}

/// Handle to a single request-response sub-protocol.
pub trait RequestMaker: Send + Sync {
    /// Sends `request` to the given peer and decodes the answer into a
    /// [`Response`].
    ///
    /// The returned future must resolve even if the peer disconnects or
    /// stalls; enforcing a timeout is the implementation's responsibility.
    fn request(
        &self,
        who: PeerId,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, RequestError>>;
}

/// Error potentially returned by [`RequestMaker::request`].
#[derive(Debug, derive_more::Display, Clone)]
pub enum RequestError {
    /// The peer took too long to answer.
    Timeout,
    /// The substream was refused or reset by the peer.
    Refused,
    /// The connection to the peer was closed before an answer arrived.
    ConnectionClosed,
    /// The answer could not be decoded.
    Decode,
}
