//! Errors reported to miners as JSON-RPC error triples.

use serde_json::{json, Value};
use thiserror::Error;

/// A Stratum error with its wire code.
///
/// On the wire an error is `[code, message, null]`. The message carries the
/// id of the switcher that produced it so operators can tell instances apart.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct StratumError {
    pub code: i32,
    pub message: &'static str,
}

impl StratumError {
    pub const NEED_SUBSCRIBED: Self = Self::new(101, "Need Subscribed");
    pub const NEED_AUTHORIZE: Self = Self::new(102, "Need Authorize");
    pub const TOO_FEW_PARAMS: Self = Self::new(103, "Too Few Params");
    pub const WORKER_NAME_MUST_BE_STRING: Self =
        Self::new(104, "Worker Name Must be a String");
    pub const WORKER_NAME_START_WRONG: Self =
        Self::new(105, "Worker Name Cannot Start with '.'");
    pub const DUPLICATE_SUBSCRIBED: Self = Self::new(106, "Duplicate Subscribed");
    pub const MINING_COIN_NOT_FOUND: Self =
        Self::new(201, "Cannot Found Minning Coin Type");
    pub const STRATUM_SERVER_NOT_FOUND: Self =
        Self::new(301, "Stratum Server Not Found");
    pub const CONNECT_STRATUM_SERVER_FAILED: Self =
        Self::new(302, "Connect Stratum Server Failed");

    pub const fn new(code: i32, message: &'static str) -> Self {
        Self { code, message }
    }

    /// The `[code, message, null]` triple, stamped with the switcher id.
    pub fn to_json(&self, server_id: u8) -> Value {
        json!([
            self.code,
            format!("{} (switcher {})", self.message, server_id),
            null
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json() {
        assert_eq!(
            StratumError::NEED_SUBSCRIBED.to_json(7).to_string(),
            r#"[101,"Need Subscribed (switcher 7)",null]"#
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            StratumError::CONNECT_STRATUM_SERVER_FAILED.to_string(),
            "Connect Stratum Server Failed (302)"
        );
    }
}
