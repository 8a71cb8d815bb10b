//! Error types for the reconciliation domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`ChainError`] - Blockchain RPC errors
//! - [`StorageError`] - Database/repository errors
//! - [`EngineError`] - Reconciliation engine errors
//! - [`ReconcilerError`] - Top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

// =============================================================================
// Chain Errors
// =============================================================================

/// Blockchain RPC and connectivity errors.
///
/// The distinction between [`ChainError::AddressNotFound`] and the transient
/// variants matters: an unknown address/account propagates as an empty result,
/// while RPC failures and timeouts are retried by the scanner.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Connection to the node failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// RPC request failed (transient, retryable).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Operation timed out (transient, retryable).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The address or account does not exist on chain.
    ///
    /// Not fatal: callers treat this as an empty result.
    #[error("Address not found: {0}")]
    AddressNotFound(String),

    /// Subscription failed or disconnected.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Transaction data could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl ChainError {
    /// Whether the scanner should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_) | ChainError::Timeout(_) | ChainError::ConnectionFailed(_)
        )
    }
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database constraint was violated (unique, check, etc.).
    ///
    /// A unique violation on a transaction hash is the storage layer's signal
    /// for a duplicate delivery; the engine converts it to a no-op.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Engine Errors
// =============================================================================

/// Reconciliation engine errors.
///
/// Data-not-found conditions (unknown counterparty, no matching pending
/// withdrawal) are *not* errors - they are explicit outcomes on
/// [`crate::services::ReconcileOutcome`]. Only infrastructure failures
/// surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The classified transfer failed validation.
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
}

// =============================================================================
// Reconciler Errors
// =============================================================================

/// Top-level orchestration errors.
///
/// This is the main error type returned by the scanner and subscription
/// services. It wraps all lower-level errors and adds orchestration-specific
/// variants.
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// Blockchain connectivity error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Reconciliation engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Invalid configuration.
    ///
    /// Fatal for the affected chain only; other chains continue operating.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Graceful shutdown was requested.
    ///
    /// Not really an error but uses the error type for control flow.
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for orchestration operations.
pub type ReconcilerResult<T> = Result<T, ReconcilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    // Test critique: la chaîne de conversion d'erreurs fonctionne
    // Permet d'utiliser ? à travers les couches
    #[test]
    fn test_error_conversion_chain() {
        // Storage -> Engine -> Reconciler
        let storage_err = StorageError::QueryError("db failed".into());
        let engine_err: EngineError = storage_err.into();
        let top: ReconcilerError = engine_err.into();
        assert!(top.to_string().contains("db failed"));

        // Chain -> Reconciler
        let chain_err = ChainError::Rpc("rpc failed".into());
        let top: ReconcilerError = chain_err.into();
        assert!(top.to_string().contains("rpc failed"));
    }

    // Test critique: seules les erreurs réseau sont retentées
    #[test]
    fn test_transient_classification() {
        assert!(ChainError::Rpc("x".into()).is_transient());
        assert!(ChainError::Timeout("x".into()).is_transient());
        assert!(ChainError::ConnectionFailed("x".into()).is_transient());

        // Un compte inexistant n'est pas une erreur transitoire:
        // il se propage comme résultat vide
        assert!(!ChainError::AddressNotFound("x".into()).is_transient());
        assert!(!ChainError::Decode("x".into()).is_transient());
    }
}
