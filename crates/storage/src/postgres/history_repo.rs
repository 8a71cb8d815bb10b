//! History repository implementation for PostgreSQL.
//!
//! The history chain is append-only; rows are written exclusively by the
//! composite store's atomic commits. The highest id per user is the current
//! snapshot.

use async_trait::async_trait;
use sqlx::PgPool;

use custodia_core::error::StorageResult;
use custodia_core::models::{HistoryRecord, UserId};
use custodia_core::ports::HistoryRepository;

use super::database::Database;
use super::helpers::{map_query_err, parse_totals};

/// PostgreSQL implementation of HistoryRepository.
pub struct PgHistoryRepository {
    pool: PgPool,
}

impl PgHistoryRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, user_id, action_id, total_deposited, total_withdrawn, created_at";

#[async_trait]
impl HistoryRepository for PgHistoryRepository {
    async fn latest_for_user(&self, user: UserId) -> StorageResult<Option<HistoryRecord>> {
        let row = sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT {} FROM user_history WHERE user_id = $1 ORDER BY id DESC LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(user.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        row.map(HistoryRow::into_record).transpose()
    }

    async fn list_for_user(&self, user: UserId) -> StorageResult<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT {} FROM user_history WHERE user_id = $1 ORDER BY id ASC",
            SELECT_COLUMNS
        ))
        .bind(user.0)
        .fetch_all(&self.pool)
        .await
        .map_err(map_query_err)?;

        rows.into_iter().map(HistoryRow::into_record).collect()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    user_id: i64,
    action_id: i64,
    total_deposited: serde_json::Value,
    total_withdrawn: serde_json::Value,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl HistoryRow {
    fn into_record(self) -> StorageResult<HistoryRecord> {
        Ok(HistoryRecord {
            id: self.id,
            user: UserId(self.user_id),
            action_id: self.action_id,
            total_deposited: parse_totals(self.total_deposited, "history.total_deposited")?,
            total_withdrawn: parse_totals(self.total_withdrawn, "history.total_withdrawn")?,
            created_at: self.created_at,
        })
    }
}
