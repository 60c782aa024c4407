//! Chain families and the Stratum dialects spoken on them.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

/// Chain family a switcher instance serves.
///
/// One switcher process serves exactly one family; the family decides which
/// handshake dialects are accepted and how session ids are rendered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChainType {
    Bitcoin,
    Ethereum,
}

impl ChainType {
    /// Width of the per-server index in a session id.
    ///
    /// Ethereum ids reach miners as six hex digits, so the index gives up a
    /// byte to keep the server id inside them.
    pub fn index_bits(self) -> u32 {
        match self {
            ChainType::Bitcoin => 24,
            ChainType::Ethereum => 16,
        }
    }

    /// Default distance between consecutively allocated session indexes.
    ///
    /// Ethereum pools derive the extranonce from the session id, so ids are
    /// spread out to keep nonce ranges of neighbouring sessions apart.
    pub fn alloc_interval(self) -> u32 {
        match self {
            ChainType::Bitcoin => 1,
            ChainType::Ethereum => 256,
        }
    }
}

impl Serialize for ChainType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        ChainType::from_str(&name).map_err(|_| {
            de::Error::custom(format!("unknown chain type: {}", name))
        })
    }
}

/// Handshake variant a client speaks, detected from its first requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum Dialect {
    BitcoinStratum,
    EthereumStratum,
    EthereumStratumNiceHash,
    EthereumProxy,
    Unknown,
}

impl Dialect {
    /// Dialect assumed for a client before its subscribe is seen.
    ///
    /// ETHProxy miners never subscribe, so an Ethereum client is taken to be
    /// one until it proves otherwise.
    pub fn default_for(chain: ChainType) -> Self {
        match chain {
            ChainType::Bitcoin => Dialect::BitcoinStratum,
            ChainType::Ethereum => Dialect::EthereumProxy,
        }
    }

    pub fn is_ethereum(self) -> bool {
        matches!(
            self,
            Dialect::EthereumStratum
                | Dialect::EthereumStratumNiceHash
                | Dialect::EthereumProxy
        )
    }
}
