//! Scan cursor repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use custodia_core::error::StorageResult;
use custodia_core::models::ScanCursor;
use custodia_core::ports::CursorRepository;

use super::database::Database;
use super::helpers::map_query_err;

/// PostgreSQL implementation of CursorRepository.
pub struct PgCursorRepository {
    pool: PgPool,
}

impl PgCursorRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl CursorRepository for PgCursorRepository {
    async fn get(&self, chain_id: &str, address: &str) -> StorageResult<Option<ScanCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            r#"
            SELECT chain_id, address, last_signature, last_block, updated_at
            FROM scan_cursors
            WHERE chain_id = $1 AND address = $2
            "#,
        )
        .bind(chain_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_query_err)?;

        Ok(row.map(CursorRow::into_cursor))
    }

    async fn set(&self, cursor: &ScanCursor) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_cursors (chain_id, address, last_signature, last_block, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain_id, address) DO UPDATE SET
                last_signature = EXCLUDED.last_signature,
                last_block = EXCLUDED.last_block,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cursor.chain_id)
        .bind(&cursor.address)
        .bind(&cursor.last_signature)
        .bind(cursor.last_block as i64)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_query_err)?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    chain_id: String,
    address: String,
    last_signature: Option<String>,
    last_block: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl CursorRow {
    fn into_cursor(self) -> ScanCursor {
        ScanCursor {
            chain_id: self.chain_id,
            address: self.address,
            last_signature: self.last_signature,
            last_block: self.last_block as u64,
            updated_at: self.updated_at,
        }
    }
}
