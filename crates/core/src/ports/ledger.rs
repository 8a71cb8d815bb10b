//! Port traits for the ledger store.
//!
//! These traits define the storage interface used by the reconciliation
//! engine and scanner. Implementations live in the infrastructure layer
//! (`custodia-storage`) and must enforce the invariants at the storage
//! level: unique transaction hashes per collection, transactionally
//! assigned tracking numbers, and multi-record atomicity for the commit
//! operations.

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{
    Deposit, HistoryRecord, ScanCursor, TreasuryBalance, UnassociatedDeposit, UserId,
    WalletBalance, Withdraw, WithdrawStatus,
};

// =============================================================================
// Commit Inputs & Outcomes
// =============================================================================

/// Input for an atomic deposit commit.
#[derive(Debug, Clone)]
pub struct DepositCommit {
    pub user: UserId,
    /// Sending wallet address.
    pub counterparty: String,
    /// Base-unit amount.
    pub amount: u128,
    pub token_symbol: String,
    pub chain_id: String,
    pub block_number: u64,
    pub tx_hash: String,
}

/// Result of an atomic deposit commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositOutcome {
    /// Record inserted, balances and history updated.
    Credited { tracking_number: u64 },
    /// A deposit with this tx hash already exists; nothing changed.
    AlreadyApplied,
}

/// Input for an atomic withdrawal settlement.
#[derive(Debug, Clone)]
pub struct WithdrawalSettlement {
    pub user: UserId,
    /// Destination wallet address observed on chain.
    pub counterparty: String,
    /// Base-unit amount; must exactly match a pending request.
    pub amount: u128,
    pub token_symbol: String,
    pub chain_id: String,
    pub block_number: u64,
    pub tx_hash: String,
}

/// Result of an atomic withdrawal settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalOutcome {
    /// A pending request was claimed and settled.
    Settled { tracking_number: u64 },
    /// No pending request matches (user, chain, token, amount); nothing
    /// changed. The transfer was not platform-initiated.
    NoMatchingRequest,
    /// A withdrawal already carries this tx hash; nothing changed.
    AlreadyApplied,
}

/// Input for creating a pending withdrawal request.
///
/// This is the platform's entry point: it reserves the amount by moving it
/// from the user's available balance into funding, atomically with the
/// record insert.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub user: UserId,
    /// Destination wallet address.
    pub counterparty: String,
    /// Base-unit amount.
    pub amount: u128,
    pub token_symbol: String,
    pub chain_id: String,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Read access to deposit records.
#[async_trait]
pub trait DepositRepository: Send + Sync {
    /// Whether a deposit with this tx hash exists (idempotency pre-check).
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool>;

    /// Get a deposit by tx hash.
    async fn get_by_tx_hash(&self, tx_hash: &str) -> StorageResult<Option<Deposit>>;

    /// List a user's deposits, oldest first.
    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Deposit>>;
}

/// Read and transition access to withdrawal records.
#[async_trait]
pub trait WithdrawRepository: Send + Sync {
    /// Whether a settled withdrawal carries this tx hash.
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool>;

    /// Find the oldest pending request matching (user, chain, token, exact
    /// amount).
    async fn find_pending(
        &self,
        user: UserId,
        chain_id: &str,
        token_symbol: &str,
        amount: u128,
    ) -> StorageResult<Option<Withdraw>>;

    /// List a user's withdrawals, oldest first.
    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Withdraw>>;

    /// Transition a withdrawal's status (e.g. pending → rejected).
    ///
    /// Settlement (pending → approved with tx hash attached) goes through
    /// [`LedgerStore::settle_withdrawal`] instead - it must be atomic with
    /// the balance effects.
    async fn set_status(&self, id: i64, status: WithdrawStatus) -> StorageResult<()>;
}

/// Read access to treasury and wallet balances.
///
/// All *mutations* go through the atomic commit operations on
/// [`LedgerStore`]; no unguarded balance writes exist anywhere.
#[async_trait]
pub trait BalanceRepository: Send + Sync {
    /// Current treasury balance for a token (`None` = row not yet created).
    async fn treasury_balance(&self, token_symbol: &str) -> StorageResult<Option<TreasuryBalance>>;

    /// Current wallet balance row for (user, token).
    async fn wallet_balance(
        &self,
        user: UserId,
        token_symbol: &str,
    ) -> StorageResult<Option<WalletBalance>>;
}

/// Read access to the append-only history chain.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// The latest snapshot for a user ("current totals").
    async fn latest_for_user(&self, user: UserId) -> StorageResult<Option<HistoryRecord>>;

    /// Full snapshot chain for a user, oldest first.
    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<HistoryRecord>>;
}

/// Persisted scan watermarks.
#[async_trait]
pub trait CursorRepository: Send + Sync {
    /// Get the cursor for one (chain, address) pair.
    async fn get(&self, chain_id: &str, address: &str) -> StorageResult<Option<ScanCursor>>;

    /// Upsert a cursor. Called only after the batch it covers has committed.
    async fn set(&self, cursor: &ScanCursor) -> StorageResult<()>;
}

/// Wallet-address → platform-user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a wallet address on a chain to a platform user, if known.
    async fn user_for_wallet(&self, chain_id: &str, address: &str)
    -> StorageResult<Option<UserId>>;
}

// =============================================================================
// Composite Store
// =============================================================================

/// Combined ledger access for the reconciliation engine.
///
/// The commit operations are the only writers of treasury balances, wallet
/// balances, and history. Each executes as a single atomic transaction: a
/// failed attempt leaves no partial record, and the unique tx-hash index
/// turns duplicate deliveries into `AlreadyApplied` outcomes.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn deposits(&self) -> &dyn DepositRepository;

    fn withdrawals(&self) -> &dyn WithdrawRepository;

    fn balances(&self) -> &dyn BalanceRepository;

    fn history(&self) -> &dyn HistoryRepository;

    fn cursors(&self) -> &dyn CursorRepository;

    /// Atomically insert a deposit record, credit the treasury and the
    /// user's available balance, and append a history snapshot.
    ///
    /// The tracking number is assigned inside the transaction from a
    /// per-user counter, so concurrent deposits for one user serialize and
    /// never share a number.
    async fn commit_deposit(&self, commit: &DepositCommit) -> StorageResult<DepositOutcome>;

    /// Atomically claim the matching pending withdrawal, debit the treasury
    /// and the user's funding balance (both floored at zero), append a
    /// history snapshot, and transition the record to `approved` with the
    /// observed tx hash and block attached.
    ///
    /// The pending-record claim must be isolated such that two concurrent
    /// settlements cannot consume the same request.
    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> StorageResult<WithdrawalOutcome>;

    /// Record an inbound transfer from an unknown sender (idempotent on tx
    /// hash). No balance is touched.
    async fn record_unassociated(&self, deposit: &UnassociatedDeposit) -> StorageResult<()>;

    /// Create a pending withdrawal request, atomically moving the amount
    /// from the user's available balance into funding.
    ///
    /// Fails with `ConstraintViolation` if the available balance does not
    /// cover the amount.
    async fn create_pending_withdrawal(
        &self,
        request: &WithdrawalRequest,
    ) -> StorageResult<Withdraw>;
}
