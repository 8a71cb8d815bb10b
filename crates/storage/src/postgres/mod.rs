//! PostgreSQL storage adapter.
//!
//! This module implements the ledger port traits defined in `custodia-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool and migrations
//! - [`PgLedgerStore`] - Composite store implementing the `LedgerStore`
//!   trait, including the atomic multi-record commits
//! - Individual repos: `PgDepositRepository`, `PgWithdrawRepository`, etc.
//!
//! # Invariants enforced here
//!
//! - `tx_hash` carries a unique index in both ledger collections; duplicate
//!   inserts surface as `StorageError::ConstraintViolation` and the whole
//!   transaction rolls back, leaving no partial record
//! - Tracking numbers come from `ledger_sequences` counter rows updated
//!   inside the commit transaction - the row lock serializes concurrent
//!   commits for one user, which also keeps the history chain consistent
//! - Pending withdrawals are claimed with `FOR UPDATE SKIP LOCKED`, so two
//!   concurrent settlements can never consume the same request

mod balance_repo;
mod cursor_repo;
mod database;
mod deposit_repo;
mod directory_repo;
mod helpers;
mod history_repo;
mod withdraw_repo;

pub use balance_repo::PgBalanceRepository;
pub use cursor_repo::PgCursorRepository;
pub use database::{Database, DatabaseConfig};
pub use deposit_repo::PgDepositRepository;
pub use directory_repo::{PgTokenFeed, PgUserDirectory};
pub use history_repo::PgHistoryRepository;
pub use withdraw_repo::PgWithdrawRepository;

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgConnection, Postgres, Transaction};
use tracing::{debug, warn};

use custodia_core::error::{StorageError, StorageResult};
use custodia_core::models::{
    TokenTotals, UnassociatedDeposit, UserId, Withdraw, WithdrawStatus, accumulate_total,
};
use custodia_core::ports::{
    BalanceRepository, CursorRepository, DepositCommit, DepositOutcome, DepositRepository,
    HistoryRepository, LedgerStore, WithdrawRepository, WithdrawalOutcome, WithdrawalRequest,
    WithdrawalSettlement,
};

use helpers::{is_unique_violation, map_query_err, parse_amount, parse_totals, totals_to_json};

// =============================================================================
// Composite Store
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `LedgerStore` trait.
///
/// This provides a single entry point for all ledger operations and
/// implements the atomic transactions that span multiple tables.
pub struct PgLedgerStore {
    db: Arc<Database>,
    deposits: PgDepositRepository,
    withdrawals: PgWithdrawRepository,
    balances: PgBalanceRepository,
    history: PgHistoryRepository,
    cursors: PgCursorRepository,
}

impl PgLedgerStore {
    /// Create a new store aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            deposits: PgDepositRepository::new(&db),
            withdrawals: PgWithdrawRepository::new(&db),
            balances: PgBalanceRepository::new(&db),
            history: PgHistoryRepository::new(&db),
            cursors: PgCursorRepository::new(&db),
            db,
        }
    }

    async fn begin(&self) -> StorageResult<Transaction<'static, Postgres>> {
        self.db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))
    }
}

// =============================================================================
// In-transaction helpers
// =============================================================================

/// Draw the next per-user tracking number from the counter row.
///
/// The upsert takes a row lock, serializing concurrent commits for the same
/// user and collection.
async fn next_tracking_number(
    conn: &mut PgConnection,
    user: UserId,
    collection: &str,
) -> StorageResult<u64> {
    let (next,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ledger_sequences (user_id, collection, next_tracking)
        VALUES ($1, $2, 1)
        ON CONFLICT (user_id, collection)
        DO UPDATE SET next_tracking = ledger_sequences.next_tracking + 1
        RETURNING next_tracking
        "#,
    )
    .bind(user.0)
    .bind(collection)
    .fetch_one(conn)
    .await
    .map_err(map_query_err)?;

    Ok(next as u64)
}

/// Read a balance column under a row lock, defaulting to zero when the row
/// does not exist yet.
async fn locked_balance(
    conn: &mut PgConnection,
    query: &str,
    binds: (&str, Option<i64>),
) -> StorageResult<u128> {
    let mut q = sqlx::query_as::<_, (String,)>(query).bind(binds.0);
    if let Some(user_id) = binds.1 {
        q = q.bind(user_id);
    }
    let row: Option<(String,)> = q.fetch_optional(conn).await.map_err(map_query_err)?;
    match row {
        Some((balance,)) => parse_amount(&balance, "balance"),
        None => Ok(0),
    }
}

/// Append one history snapshot: prior latest totals plus the new delta.
///
/// Runs inside the commit transaction, after the sequence-row lock has
/// serialized this user's writers.
async fn append_history(
    conn: &mut PgConnection,
    user: UserId,
    action_id: i64,
    token_symbol: &str,
    delta: u128,
    is_deposit: bool,
) -> StorageResult<()> {
    let latest: Option<(serde_json::Value, serde_json::Value)> = sqlx::query_as(
        r#"
        SELECT total_deposited, total_withdrawn
        FROM user_history
        WHERE user_id = $1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(user.0)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_query_err)?;

    let (mut deposited, mut withdrawn) = match latest {
        Some((d, w)) => (
            parse_totals(d, "history.total_deposited")?,
            parse_totals(w, "history.total_withdrawn")?,
        ),
        None => (TokenTotals::new(), TokenTotals::new()),
    };

    let target = if is_deposit {
        &mut deposited
    } else {
        &mut withdrawn
    };
    accumulate_total(target, token_symbol, delta).map_err(StorageError::SerializationError)?;

    sqlx::query(
        r#"
        INSERT INTO user_history (user_id, action_id, total_deposited, total_withdrawn, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(user.0)
    .bind(action_id)
    .bind(totals_to_json(&deposited))
    .bind(totals_to_json(&withdrawn))
    .execute(conn)
    .await
    .map_err(map_query_err)?;

    Ok(())
}

// =============================================================================
// LedgerStore implementation
// =============================================================================

#[async_trait]
impl LedgerStore for PgLedgerStore {
    fn deposits(&self) -> &dyn DepositRepository {
        &self.deposits
    }

    fn withdrawals(&self) -> &dyn WithdrawRepository {
        &self.withdrawals
    }

    fn balances(&self) -> &dyn BalanceRepository {
        &self.balances
    }

    fn history(&self) -> &dyn HistoryRepository {
        &self.history
    }

    fn cursors(&self) -> &dyn CursorRepository {
        &self.cursors
    }

    async fn commit_deposit(&self, commit: &DepositCommit) -> StorageResult<DepositOutcome> {
        let mut tx = self.begin().await?;
        let amount = commit.amount.to_string();

        let tracking_number = next_tracking_number(&mut tx, commit.user, "deposits").await?;

        // The unique index on tx_hash is the concurrency control primitive:
        // losing the race rolls the whole transaction back, sequence
        // increment included.
        let inserted: Result<(i64,), sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO deposits (
                user_id, counterparty, amount, token_symbol, chain_id,
                block_number, tx_hash, tracking_number, created_at
            )
            VALUES ($1, $2, $3::NUMERIC, $4, $5, $6, $7, $8, NOW())
            RETURNING id
            "#,
        )
        .bind(commit.user.0)
        .bind(&commit.counterparty)
        .bind(&amount)
        .bind(&commit.token_symbol)
        .bind(&commit.chain_id)
        .bind(commit.block_number as i64)
        .bind(&commit.tx_hash)
        .bind(tracking_number as i64)
        .fetch_one(&mut *tx)
        .await;

        let deposit_id = match inserted {
            Ok((id,)) => id,
            Err(e) if is_unique_violation(&e) => {
                tx.rollback()
                    .await
                    .map_err(|e| StorageError::TransactionError(e.to_string()))?;
                return Ok(DepositOutcome::AlreadyApplied);
            }
            Err(e) => return Err(map_query_err(e)),
        };

        sqlx::query(
            r#"
            INSERT INTO treasury_balances (token_symbol, balance)
            VALUES ($1, $2::NUMERIC)
            ON CONFLICT (token_symbol)
            DO UPDATE SET balance = treasury_balances.balance + EXCLUDED.balance
            "#,
        )
        .bind(&commit.token_symbol)
        .bind(&amount)
        .execute(&mut *tx)
        .await
        .map_err(map_query_err)?;

        sqlx::query(
            r#"
            INSERT INTO wallet_balances (user_id, token_symbol, available, funding)
            VALUES ($1, $2, $3::NUMERIC, 0)
            ON CONFLICT (user_id, token_symbol)
            DO UPDATE SET available = wallet_balances.available + EXCLUDED.available
            "#,
        )
        .bind(commit.user.0)
        .bind(&commit.token_symbol)
        .bind(&amount)
        .execute(&mut *tx)
        .await
        .map_err(map_query_err)?;

        append_history(
            &mut tx,
            commit.user,
            deposit_id,
            &commit.token_symbol,
            commit.amount,
            true,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(
            user = %commit.user,
            tx_hash = %commit.tx_hash,
            tracking = tracking_number,
            "Deposit committed"
        );
        Ok(DepositOutcome::Credited { tracking_number })
    }

    async fn settle_withdrawal(
        &self,
        settlement: &WithdrawalSettlement,
    ) -> StorageResult<WithdrawalOutcome> {
        let mut tx = self.begin().await?;
        let amount = settlement.amount.to_string();

        let settled: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM withdrawals WHERE tx_hash = $1")
                .bind(&settlement.tx_hash)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_query_err)?;
        if settled.is_some() {
            return Ok(WithdrawalOutcome::AlreadyApplied);
        }

        // Claim the oldest matching pending request. SKIP LOCKED means a
        // concurrent settler moves past a row already being consumed instead
        // of double-spending it; if both carry the same tx hash, the unique
        // index rejects the second anyway.
        let claimed: Result<Option<(i64, i64)>, sqlx::Error> = sqlx::query_as(
            r#"
            UPDATE withdrawals
            SET status = 'approved', tx_hash = $5, block_number = $6, settled_at = NOW()
            WHERE id = (
                SELECT id FROM withdrawals
                WHERE user_id = $1 AND status = 'pending'
                  AND chain_id = $2 AND token_symbol = $3 AND amount = $4::NUMERIC
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, tracking_number
            "#,
        )
        .bind(settlement.user.0)
        .bind(&settlement.chain_id)
        .bind(&settlement.token_symbol)
        .bind(&amount)
        .bind(&settlement.tx_hash)
        .bind(settlement.block_number as i64)
        .fetch_optional(&mut *tx)
        .await;

        let (withdrawal_id, tracking_number) = match claimed {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(WithdrawalOutcome::NoMatchingRequest),
            Err(e) => return Err(map_query_err(e)),
        };

        // Treasury debit, floored at zero. A clamp means a withdrawal
        // exceeded holdings - an upstream anomaly worth flagging loudly.
        let treasury = locked_balance(
            &mut tx,
            "SELECT balance::TEXT FROM treasury_balances WHERE token_symbol = $1 FOR UPDATE",
            (&settlement.token_symbol, None),
        )
        .await?;
        if treasury < settlement.amount {
            warn!(
                token = %settlement.token_symbol,
                balance = %treasury,
                amount = %settlement.amount,
                tx_hash = %settlement.tx_hash,
                "⚠️  Withdrawal exceeds treasury holdings, clamping balance to zero"
            );
        }
        sqlx::query(
            r#"
            INSERT INTO treasury_balances (token_symbol, balance)
            VALUES ($1, $2::NUMERIC)
            ON CONFLICT (token_symbol) DO UPDATE SET balance = EXCLUDED.balance
            "#,
        )
        .bind(&settlement.token_symbol)
        .bind(treasury.saturating_sub(settlement.amount).to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_query_err)?;

        // Funding (reserved) debit, same floor.
        let funding = locked_balance(
            &mut tx,
            "SELECT funding::TEXT FROM wallet_balances WHERE token_symbol = $1 AND user_id = $2 FOR UPDATE",
            (&settlement.token_symbol, Some(settlement.user.0)),
        )
        .await?;
        if funding < settlement.amount {
            warn!(
                user = %settlement.user,
                token = %settlement.token_symbol,
                funding = %funding,
                amount = %settlement.amount,
                "⚠️  Withdrawal exceeds reserved funding balance, clamping to zero"
            );
        }
        sqlx::query(
            r#"
            INSERT INTO wallet_balances (user_id, token_symbol, available, funding)
            VALUES ($1, $2, 0, $3::NUMERIC)
            ON CONFLICT (user_id, token_symbol) DO UPDATE SET funding = EXCLUDED.funding
            "#,
        )
        .bind(settlement.user.0)
        .bind(&settlement.token_symbol)
        .bind(funding.saturating_sub(settlement.amount).to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_query_err)?;

        append_history(
            &mut tx,
            settlement.user,
            withdrawal_id,
            &settlement.token_symbol,
            settlement.amount,
            false,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(
            user = %settlement.user,
            tx_hash = %settlement.tx_hash,
            tracking = tracking_number,
            "Withdrawal settled"
        );
        Ok(WithdrawalOutcome::Settled { tracking_number: tracking_number as u64 })
    }

    async fn record_unassociated(&self, deposit: &UnassociatedDeposit) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unassociated_deposits (
                tx_hash, chain_id, token_symbol, sender, amount, block_number, observed_at
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7)
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(&deposit.tx_hash)
        .bind(&deposit.chain_id)
        .bind(&deposit.token_symbol)
        .bind(&deposit.sender)
        .bind(deposit.amount.to_string())
        .bind(deposit.block_number as i64)
        .bind(deposit.observed_at)
        .execute(self.db.pool())
        .await
        .map_err(map_query_err)?;

        Ok(())
    }

    async fn create_pending_withdrawal(
        &self,
        request: &WithdrawalRequest,
    ) -> StorageResult<Withdraw> {
        let mut tx = self.begin().await?;

        // Reserve the amount: available → funding, strictly - requesting
        // more than the available balance is an upstream bug, not something
        // to clamp.
        let available = locked_balance(
            &mut tx,
            "SELECT available::TEXT FROM wallet_balances WHERE token_symbol = $1 AND user_id = $2 FOR UPDATE",
            (&request.token_symbol, Some(request.user.0)),
        )
        .await?;
        if available < request.amount {
            return Err(StorageError::ConstraintViolation(format!(
                "insufficient available balance for user {}: {} < {}",
                request.user, available, request.amount
            )));
        }

        let funding = locked_balance(
            &mut tx,
            "SELECT funding::TEXT FROM wallet_balances WHERE token_symbol = $1 AND user_id = $2",
            (&request.token_symbol, Some(request.user.0)),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE wallet_balances
            SET available = $3::NUMERIC, funding = $4::NUMERIC
            WHERE user_id = $1 AND token_symbol = $2
            "#,
        )
        .bind(request.user.0)
        .bind(&request.token_symbol)
        .bind((available - request.amount).to_string())
        .bind((funding + request.amount).to_string())
        .execute(&mut *tx)
        .await
        .map_err(map_query_err)?;

        let tracking_number = next_tracking_number(&mut tx, request.user, "withdrawals").await?;

        let (id, created_at): (i64, chrono::DateTime<chrono::Utc>) = sqlx::query_as(
            r#"
            INSERT INTO withdrawals (
                user_id, counterparty, amount, token_symbol, chain_id,
                status, tracking_number, created_at
            )
            VALUES ($1, $2, $3::NUMERIC, $4, $5, 'pending', $6, NOW())
            RETURNING id, created_at
            "#,
        )
        .bind(request.user.0)
        .bind(&request.counterparty)
        .bind(request.amount.to_string())
        .bind(&request.token_symbol)
        .bind(&request.chain_id)
        .bind(tracking_number as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_query_err)?;

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        Ok(Withdraw {
            id,
            user: request.user,
            counterparty: request.counterparty.clone(),
            amount: request.amount,
            token_symbol: request.token_symbol.clone(),
            chain_id: request.chain_id.clone(),
            block_number: None,
            tx_hash: None,
            status: WithdrawStatus::Pending,
            tracking_number,
            created_at,
            settled_at: None,
        })
    }
}
