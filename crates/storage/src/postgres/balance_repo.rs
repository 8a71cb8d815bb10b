//! Balance repository implementation for PostgreSQL.
//!
//! Read-only by design: every balance mutation happens inside the composite
//! store's atomic commits.

use async_trait::async_trait;
use sqlx::PgPool;

use custodia_core::error::StorageResult;
use custodia_core::models::{TreasuryBalance, UserId, WalletBalance};
use custodia_core::ports::BalanceRepository;

use super::database::Database;
use super::helpers::{map_query_err, parse_amount};

/// PostgreSQL implementation of BalanceRepository.
pub struct PgBalanceRepository {
    pool: PgPool,
}

impl PgBalanceRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl BalanceRepository for PgBalanceRepository {
    async fn treasury_balance(&self, token_symbol: &str) -> StorageResult<Option<TreasuryBalance>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT balance::TEXT FROM treasury_balances WHERE token_symbol = $1",
        )
        .bind(token_symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        row.map(|(balance,)| {
            Ok(TreasuryBalance {
                token_symbol: token_symbol.to_string(),
                balance: parse_amount(&balance, "treasury.balance")?,
            })
        })
        .transpose()
    }

    async fn wallet_balance(
        &self,
        user: UserId,
        token_symbol: &str,
    ) -> StorageResult<Option<WalletBalance>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT available::TEXT, funding::TEXT
            FROM wallet_balances
            WHERE user_id = $1 AND token_symbol = $2
            "#,
        )
        .bind(user.0)
        .bind(token_symbol)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        row.map(|(available, funding)| {
            Ok(WalletBalance {
                user,
                token_symbol: token_symbol.to_string(),
                available: parse_amount(&available, "wallet.available")?,
                funding: parse_amount(&funding, "wallet.funding")?,
            })
        })
        .transpose()
    }
}
