//! Storage layer for the Custodia reconciliation engine.
//!
//! This crate provides PostgreSQL implementations of the ledger port traits
//! defined in `custodia-core`. It handles all database interactions
//! including connection pooling, migrations, and the atomic multi-record
//! commits the reconciliation engine depends on.
//!
//! # Architecture
//!
//! The storage layer follows the repository pattern:
//!
//! - [`postgres::Database`] - Connection pool management
//! - [`postgres::PgLedgerStore`] - Composite store with the atomic commits
//! - Individual repositories for deposits, withdrawals, balances, history,
//!   and cursors
//! - [`postgres::PgUserDirectory`] / [`postgres::PgTokenFeed`] - Wallet
//!   mapping and the supported-token feed
//!
//! # Usage
//!
//! ```ignore
//! use custodia_storage::{Database, DatabaseConfig, PgLedgerStore};
//!
//! let config = DatabaseConfig::for_reconciler(&database_url);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let store = Arc::new(PgLedgerStore::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{Database, DatabaseConfig, PgLedgerStore, PgTokenFeed, PgUserDirectory};
