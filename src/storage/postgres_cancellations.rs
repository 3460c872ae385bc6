use async_trait::async_trait;
use tokio_postgres::Row;

use crate::cancellations::{
    CancellationCase, CancellationReason, CancellationStore, DownsellVariant,
    validate_reason_fields,
};
use crate::error::RetentionError;
use crate::storage::postgres_store::{
    PgStore, is_pg_foreign_key_violation, is_pg_unique_violation,
};

fn row_to_case(row: &Row) -> Result<CancellationCase, RetentionError> {
    let reason = match row.get::<usize, Option<String>>(4) {
        Some(s) => Some(
            CancellationReason::parse(&s)
                .ok_or_else(|| RetentionError::Config("invalid cancellation reason".into()))?,
        ),
        None => None,
    };
    Ok(CancellationCase {
        id: row.get(0),
        user_id: row.get(1),
        subscription_id: row.get(2),
        downsell_variant: DownsellVariant::parse(row.get::<usize, String>(3).as_str())
            .ok_or_else(|| RetentionError::Config("invalid downsell variant".into()))?,
        reason,
        reason_other: row.get(5),
        accepted_downsell: row.get(6),
        finalized: row.get(7),
        decided_at: row.get(8),
        created_at: row.get(9),
    })
}

#[async_trait]
impl CancellationStore for PgStore {
    async fn insert_case(&self, case: &CancellationCase) -> Result<(), RetentionError> {
        validate_reason_fields(case.reason, case.reason_other.as_deref())?;

        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO cancellations (id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &case.id,
                    &case.user_id,
                    &case.subscription_id,
                    &case.downsell_variant.as_str(),
                    &case.reason.map(CancellationReason::as_str),
                    &case.reason_other,
                    &case.accepted_downsell,
                    &case.finalized,
                    &case.decided_at,
                    &case.created_at,
                ],
            )
            .await
            .map_err(|e| {
                if is_pg_unique_violation(&e) {
                    RetentionError::ConflictRetryable
                } else if is_pg_foreign_key_violation(&e) {
                    RetentionError::Validation(format!(
                        "unknown user or subscription: {}/{}",
                        case.user_id, case.subscription_id
                    ))
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    async fn get_case(&self, id: &str) -> Result<Option<CancellationCase>, RetentionError> {
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations WHERE id = $1",
                &[&id],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(row_to_case(&row)?))
    }

    async fn latest_open_case(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<CancellationCase>, RetentionError> {
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations
                 WHERE subscription_id = $1 AND user_id = $2 AND NOT finalized
                 ORDER BY created_at DESC, ctid DESC LIMIT 1",
                &[&subscription_id, &user_id],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(row_to_case(&row)?))
    }

    async fn list_cases_for_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Vec<CancellationCase>, RetentionError> {
        let client = self.pool.pick();
        let rows = client
            .query(
                "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations
                 WHERE subscription_id = $1 AND user_id = $2
                 ORDER BY created_at DESC, ctid DESC",
                &[&subscription_id, &user_id],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row_to_case(&row)?);
        }
        Ok(out)
    }

    async fn apply_decision(&self, case: &CancellationCase) -> Result<bool, RetentionError> {
        validate_reason_fields(case.reason, case.reason_other.as_deref())?;

        let client = self.pool.pick();
        let affected = client
            .execute(
                "UPDATE cancellations SET reason = $3, reason_other = $4, accepted_downsell = $5, finalized = $6, decided_at = $7
                 WHERE id = $1 AND user_id = $2 AND NOT finalized",
                &[
                    &case.id,
                    &case.user_id,
                    &case.reason.map(CancellationReason::as_str),
                    &case.reason_other,
                    &case.accepted_downsell,
                    &case.finalized,
                    &case.decided_at,
                ],
            )
            .await?;
        Ok(affected > 0)
    }
}
