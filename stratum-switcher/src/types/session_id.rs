//! Pool-wide session identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ChainType;

/// Mask selecting the session index of an id on `chain`.
///
/// An allocator is full once this many indexes are in use, so the value
/// itself is never handed out.
pub fn index_mask(chain: ChainType) -> u32 {
    (1 << chain.index_bits()) - 1
}

/// Highest index an allocator for `chain` hands out.
pub fn max_valid_index(chain: ChainType) -> u32 {
    index_mask(chain) - 1
}

/// Session id, unique across all switcher instances of a pool.
///
/// Laid out as `server_id << index_bits | index`, where the index width
/// depends on the chain. The id doubles as the extranonce prefix the miner
/// rolls on, so its hex rendering is part of the wire protocol: Bitcoin
/// sessions use all eight hex digits, Ethereum sessions the low six, which
/// still carry the server id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    pub fn new(chain: ChainType, server_id: u8, index: u32) -> Self {
        Self(((server_id as u32) << chain.index_bits()) | (index & index_mask(chain)))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn server_id(self, chain: ChainType) -> u8 {
        (self.0 >> chain.index_bits()) as u8
    }

    pub fn index(self, chain: ChainType) -> u32 {
        self.0 & index_mask(chain)
    }

    /// Eight lowercase hex digits, big-endian.
    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Six lowercase hex digits of the low three bytes, big-endian.
    pub fn to_short_hex(self) -> String {
        hex::encode(&self.0.to_be_bytes()[1..])
    }

    /// The rendering sent to miners and pool servers of the given chain.
    pub fn wire_hex(self, chain: ChainType) -> String {
        match chain {
            ChainType::Bitcoin => self.to_hex(),
            ChainType::Ethereum => self.to_short_hex(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
