//! Small value types shared across the switcher.

mod chain;
mod session_id;

pub use chain::{ChainType, Dialect};
pub use session_id::{index_mask, max_valid_index, SessionId};
