//! Deposit repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use custodia_core::error::StorageResult;
use custodia_core::models::{Deposit, UserId};
use custodia_core::ports::DepositRepository;

use super::database::Database;
use super::helpers::{map_query_err, parse_amount};

/// PostgreSQL implementation of DepositRepository.
pub struct PgDepositRepository {
    pool: PgPool,
}

impl PgDepositRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

const SELECT_COLUMNS: &str = "id, user_id, counterparty, amount::TEXT AS amount, token_symbol, \
                              chain_id, block_number, tx_hash, tracking_number, created_at";

#[async_trait]
impl DepositRepository for PgDepositRepository {
    async fn exists_by_tx_hash(&self, tx_hash: &str) -> StorageResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM deposits WHERE tx_hash = $1")
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_query_err)?;
        Ok(row.is_some())
    }

    async fn get_by_tx_hash(&self, tx_hash: &str) -> StorageResult<Option<Deposit>> {
        let row = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE tx_hash = $1",
            SELECT_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        row.map(DepositRow::into_deposit).transpose()
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<Deposit>> {
        let rows = sqlx::query_as::<_, DepositRow>(&format!(
            "SELECT {} FROM deposits WHERE user_id = $1 ORDER BY tracking_number ASC",
            SELECT_COLUMNS
        ))
        .bind(user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_query_err)?;

        rows.into_iter().map(DepositRow::into_deposit).collect()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(sqlx::FromRow)]
pub(super) struct DepositRow {
    id: i64,
    user_id: i64,
    counterparty: String,
    amount: String,
    token_symbol: String,
    chain_id: String,
    block_number: i64,
    tx_hash: String,
    tracking_number: i64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl DepositRow {
    pub(super) fn into_deposit(self) -> StorageResult<Deposit> {
        Ok(Deposit {
            id: self.id,
            user: UserId(self.user_id),
            counterparty: self.counterparty,
            amount: parse_amount(&self.amount, "deposit.amount")?,
            token_symbol: self.token_symbol,
            chain_id: self.chain_id,
            block_number: self.block_number as u64,
            tx_hash: self.tx_hash,
            tracking_number: self.tracking_number as u64,
            created_at: self.created_at,
        })
    }
}
