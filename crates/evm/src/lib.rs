//! EVM chain adapter for the Custodia reconciliation engine.
//!
//! Implements the `ChainAdapter` port on top of `ethers`:
//!
//! - Native-currency transfers are discovered by scanning block bodies in
//!   bounded ranges (the transaction `value` field, from/to matching)
//! - ERC-20 transfers are discovered via `eth_getLogs` with Transfer-topic
//!   filters on the configured contract
//! - The live path is a bounded incremental poller over the same extraction
//!   code, delivered as a transfer stream
//!
//! All addresses are emitted lowercased, matching the directory's storage
//! convention.

mod adapter;
mod client;

pub use adapter::EvmAdapter;
pub use client::{EvmClient, EvmClientConfig};
