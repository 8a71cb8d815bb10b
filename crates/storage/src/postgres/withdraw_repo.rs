//! Withdrawal repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use custodia_core::error::{StorageError, StorageResult};
use custodia_core::models::{UserId, Withdraw, WithdrawStatus};
use custodia_core::ports::WithdrawRepository;

use super::database::Database;
use super::helpers::{map_query_err, parse_amount};

/// PostgreSQL implementation of WithdrawRepository.
///
/// Settlement (the pending-claim plus balance effects) lives on the
/// composite store - it must share one transaction with the balance and
/// history writes.
pub struct PgWithdrawRepository {
    pool: PgPool,
}

impl PgWithdrawRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

pub(super) const SELECT_COLUMNS: &str =
    "id, user_id, counterparty, amount::TEXT AS amount, token_symbol, chain_id, \
     block_number, tx_hash, status, tracking_number, created_at, settled_at";

#[async_trait]
impl WithdrawRepository for PgWithdrawRepository {
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM withdrawals WHERE tx_hash = $1")
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_query_err)?;
        Ok(row.is_some())
    }

    async fn find_pending(
        &self,
        user: UserId,
        chain_id: &str,
        token_symbol: &str,
        amount: u128,
    ) -> StorageResult<Option<Withdraw>> {
        let row = sqlx::query_as::<_, WithdrawRow>(&format!(
            r#"
            SELECT {}
            FROM withdrawals
            WHERE user_id = $1 AND status = 'pending'
              AND chain_id = $2 AND token_symbol = $3 AND amount = $4::NUMERIC
            ORDER BY id ASC
            LIMIT 1
            "#,
            SELECT_COLUMNS
        ))
        .bind(user.0)
        .bind(chain_id)
        .bind(token_symbol)
        .bind(amount.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        row.map(WithdrawRow::into_withdraw).transpose()
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Withdraw>> {
        let rows = sqlx::query_as::<_, WithdrawRow>(&format!(
            "SELECT {} FROM withdrawals WHERE user_id = $1 ORDER BY tracking_number ASC",
            SELECT_COLUMNS
        ))
        .bind(user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_query_err)?;

        rows.into_iter().map(WithdrawRow::into_withdraw).collect()
    }

    async fn set_status(&self, id: i64, status: WithdrawStatus) -> StorageResult<()> {
        let result = sqlx::query("UPDATE withdrawals SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_query_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("withdrawal {}", id)));
        }
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(sqlx::FromRow)]
pub(super) struct WithdrawRow {
    id: i64,
    user_id: i64,
    counterparty: String,
    amount: String,
    token_symbol: String,
    chain_id: String,
    block_number: Option<i64>,
    tx_hash: Option<String>,
    status: String,
    tracking_number: i64,
    created_at: chrono::DateTime<chrono::Utc>,
    settled_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WithdrawRow {
    pub(super) fn into_withdraw(self) -> StorageResult<Withdraw> {
        Ok(Withdraw {
            id: self.id,
            user: UserId(self.user_id),
            counterparty: self.counterparty,
            amount: parse_amount(&self.amount, "withdrawal.amount")?,
            token_symbol: self.token_symbol,
            chain_id: self.chain_id,
            block_number: self.block_number.map(|b| b as u64),
            tx_hash: self.tx_hash,
            status: self
                .status
                .parse()
                .map_err(StorageError::SerializationError)?,
            tracking_number: self.tracking_number as u64,
            created_at: self.created_at,
            settled_at: self.settled_at,
        })
    }
}
