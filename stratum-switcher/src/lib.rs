//! Stratum switcher.
//!
//! A TCP proxy between miners and per-coin Stratum pool servers. Each miner
//! is signed up with the server of the coin its subaccount is assigned to in
//! a coordination store, and is moved to another server when that
//! assignment changes, without its connection dropping.

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod session_id;
pub mod stratum;
pub mod tracing;
pub mod types;
pub mod upgrade;
pub mod watch;
