//! Shared helper functions for PostgreSQL row conversion.

use custodia_core::error::{StorageError, StorageResult};
use custodia_core::models::TokenTotals;

/// Parse a `NUMERIC(39,0)::TEXT` column into a base-unit amount.
pub fn parse_amount(s: &str, field_name: &str) -> StorageResult<u128> {
    s.parse().map_err(|e| {
        StorageError::SerializationError(format!(
            "{} is not a base-unit integer: {} ({})",
            field_name, s, e
        ))
    })
}

/// Map a sqlx error, surfacing unique violations as their own variant so
/// callers can take the idempotent no-op path.
pub fn map_query_err(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = e
        && db.is_unique_violation()
    {
        return StorageError::ConstraintViolation(db.message().to_string());
    }
    StorageError::QueryError(e.to_string())
}

/// Whether a raw sqlx error is a unique-index violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Decode a JSONB totals column (token → base-unit string map).
pub fn parse_totals(value: serde_json::Value, field_name: &str) -> StorageResult<TokenTotals> {
    serde_json::from_value(value).map_err(|e| {
        StorageError::SerializationError(format!("{} is not a totals map: {}", field_name, e))
    })
}

/// Encode a totals map for a JSONB column.
pub fn totals_to_json(totals: &TokenTotals) -> serde_json::Value {
    serde_json::to_value(totals).expect("string map always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_accepts_full_numeric_range() {
        assert_eq!(parse_amount("0", "t").unwrap(), 0);
        assert_eq!(
            parse_amount(&u128::MAX.to_string(), "t").unwrap(),
            u128::MAX
        );
    }

    // Test critique: les erreurs incluent le nom du champ pour le debug
    #[test]
    fn parse_amount_error_includes_field_name() {
        let err = parse_amount("12.5", "deposit.amount").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("deposit.amount"));
        assert!(msg.contains("12.5"));
    }

    #[test]
    fn totals_roundtrip_through_json() {
        let mut totals = TokenTotals::new();
        totals.insert("eth".into(), "2000000000000000".into());
        totals.insert("sol".into(), "1000000".into());

        let json = totals_to_json(&totals);
        let back = parse_totals(json, "history.total_deposited").unwrap();
        assert_eq!(back, totals);
    }
}
