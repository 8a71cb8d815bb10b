//! Wallet directory and supported-token feed implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use custodia_core::error::StorageResult;
use custodia_core::models::{TokenSpec, UserId};
use custodia_core::ports::{TokenConfigSource, TokenFeedSnapshot, UserDirectory};

use super::database::Database;
use super::helpers::map_query_err;

// =============================================================================
// User directory
// =============================================================================

/// PostgreSQL implementation of the wallet → user directory.
///
/// EVM addresses are stored lowercased (the adapters emit them lowercased as
/// well), so the lookup is a plain equality match for both families.
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Associate a wallet address with a platform user (upsert).
    ///
    /// Provisioning entry point for the outer platform; the engine itself
    /// only reads the directory.
    pub async fn register_wallet(
        &self,
        chain_id: &str,
        address: &str,
        user: UserId,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_wallets (chain_id, address, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, address) DO UPDATE SET user_id = EXCLUDED.user_id
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .bind(user.0)
        .execute(&self.pool)
        .await
        .map_err(map_query_err)?;

        debug!(chain = chain_id, address, user = %user, "Wallet registered");
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn user_for_wallet(
        &self,
        chain_id: &str,
        address: &str,
    ) -> StorageResult<Option<UserId>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT user_id FROM user_wallets WHERE chain_id = $1 AND address = $2")
                .bind(chain_id)
                .bind(address)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_query_err)?;

        Ok(row.map(|(id,)| UserId(id)))
    }
}

// =============================================================================
// Supported-token feed
// =============================================================================

/// PostgreSQL implementation of the supported-token feed.
///
/// `last_modified` spans *all* rows, enabled or not: disabling a token must
/// register as a change so the watcher tears its listeners down.
pub struct PgTokenFeed {
    pool: PgPool,
}

impl PgTokenFeed {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl TokenConfigSource for PgTokenFeed {
    async fn fetch(&self) -> StorageResult<TokenFeedSnapshot> {
        let rows: Vec<(String, String, Option<String>, i16)> = sqlx::query_as(
            r#"
            SELECT chain_id, symbol, contract, decimals
            FROM supported_tokens
            WHERE enabled
            ORDER BY chain_id, symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_query_err)?;

        let (last_modified,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(updated_at) FROM supported_tokens")
                .fetch_one(&self.pool)
                .await
                .map_err(map_query_err)?;

        let tokens = rows
            .into_iter()
            .map(|(chain_id, symbol, contract, decimals)| TokenSpec {
                chain_id,
                symbol,
                decimals: decimals as u8,
                contract,
            })
            .collect();

        Ok(TokenFeedSnapshot {
            tokens,
            last_modified,
        })
    }
}
