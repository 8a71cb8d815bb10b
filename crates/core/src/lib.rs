//! Core domain layer for the Custodia reconciliation engine.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! business logic services for reconciling on-chain value transfers against
//! off-chain ledger balances. It follows hexagonal architecture principles -
//! this is the innermost layer with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    custodia (binary)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │      custodia-evm        │         custodia-solana          │
//! │   (ethers adapter)       │     (solana-client adapter)      │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                   custodia-storage                          │
//! │                    (PostgreSQL)                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   custodia-core  ← YOU ARE HERE             │
//! │              (models, ports, services)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (TransferEvent, Deposit, Withdraw, etc.)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Core business logic (Scanner, Classifier, Engine)
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! Ports define interfaces that external adapters must implement:
//!
//! - [`ports::ChainAdapter`] - Fetch and stream transfers from one chain
//! - [`ports::LedgerStore`] - Persist ledger records under atomicity and
//!   idempotency guarantees
//! - [`ports::UserDirectory`] - Resolve wallet addresses to platform users
//! - [`ports::TokenConfigSource`] - The upstream supported-token feed
//!
//! ## Reconciliation Lifecycle
//!
//! 1. The scanner pages backward through an address's history down to the
//!    persisted cursor (or a live subscription delivers transfers as they
//!    land on chain)
//! 2. The classifier turns each direction-neutral transfer into a typed
//!    deposit or withdrawal candidate, discarding noise
//! 3. The engine applies the effect to treasury, wallet balance, and history
//!    in one atomic commit, keyed by transaction hash for idempotency
//! 4. Only after a successful commit does the scanner advance its cursor

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
