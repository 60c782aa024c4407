//! Stratum wire format as seen by the switcher.
//!
//! Stratum is line-delimited JSON-RPC over TCP. The switcher only parses the
//! handshake (subscribe, authorize, and a few dialect-specific variants); once
//! a session is proxying, bytes are copied without being decoded.

mod error;
mod json_rpc;

pub use error::StratumError;
pub use json_rpc::{JsonRpcRequest, JsonRpcResponse};

use serde_json::{json, Value};

/// Method names the handshake recognizes.
pub mod method {
    pub const SUBSCRIBE: &str = "mining.subscribe";
    pub const AUTHORIZE: &str = "mining.authorize";
    pub const CONFIGURE: &str = "mining.configure";
    pub const ETH_SUBMIT_LOGIN: &str = "eth_submitLogin";
}

/// User-agent prefix of btc.com agents, which multiplex many miners over one
/// connection and therefore cannot follow a coin switch.
pub const AGENT_USER_AGENT_PREFIX: &str = "btccom-agent/";

/// Protocol prefix announcing the NiceHash variant of Ethereum Stratum.
pub const NICEHASH_PROTOCOL_PREFIX: &str = "ethereumstratum/";

/// Protocol string of the NiceHash Ethereum Stratum variant.
pub const NICEHASH_PROTOCOL: &str = "EthereumStratum/1.0.0";

/// User agent presented upstream when the client supplied none.
pub const DEFAULT_USER_AGENT: &str = "stratumSwitcher";

/// Extranonce2 size advertised to Bitcoin miners.
pub const BITCOIN_EXTRANONCE2_SIZE: u32 = 8;

/// Version-rolling bits a switcher may grant to a miner.
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Subscribe result for a Bitcoin miner.
pub fn bitcoin_subscribe_result(session_hex: &str) -> Value {
    json!([
        [
            ["mining.set_difficulty", session_hex],
            ["mining.notify", session_hex]
        ],
        session_hex,
        BITCOIN_EXTRANONCE2_SIZE
    ])
}

/// Subscribe result for a NiceHash Ethereum miner.
pub fn nicehash_subscribe_result(session_hex: &str) -> Value {
    json!([
        ["mining.notify", session_hex, NICEHASH_PROTOCOL],
        session_hex
    ])
}

/// Parse a hex version mask as sent in `mining.configure`.
pub fn parse_version_mask(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
}
