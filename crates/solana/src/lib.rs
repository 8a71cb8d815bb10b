//! Solana chain adapter for the Custodia reconciliation engine.
//!
//! Implements the `ChainAdapter` port on top of `solana-client`:
//!
//! - History is paged backward with `getSignaturesForAddress` before/until
//!   markers; full transactions are fetched with jsonParsed encoding
//! - Native lamport movements and SPL token movements are extracted from
//!   parsed instructions (outer and inner), dispatched on program id
//! - SPL token accounts are resolved to their owning wallet via an RPC
//!   lookup that is retried on transient failure and never silently dropped

mod adapter;
mod client;
mod parse;

pub use adapter::SolanaAdapter;
pub use client::{SolanaClientConfig, SolanaRpc};
