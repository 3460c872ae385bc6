use async_trait::async_trait;
use rusqlite::OptionalExtension;

use crate::cancellations::{
    CancellationCase, CancellationReason, CancellationStore, DownsellVariant,
    validate_reason_fields,
};
use crate::error::RetentionError;
use crate::storage::database::{Database, is_foreign_key_violation, is_unique_violation};
use crate::storage::time::{parse_utc_string, to_utc_string};

fn row_to_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<CancellationCase> {
    let variant_s: String = row.get(3)?;
    let reason_s: Option<String> = row.get(4)?;
    let decided_at_s: Option<String> = row.get(8)?;
    let created_at_s: String = row.get(9)?;

    let reason = match reason_s {
        Some(s) => Some(CancellationReason::parse(&s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(4, "reason".into(), rusqlite::types::Type::Text)
        })?),
        None => None,
    };
    let decided_at = match decided_at_s {
        Some(s) => Some(parse_utc_string(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?),
        None => None,
    };

    Ok(CancellationCase {
        id: row.get(0)?,
        user_id: row.get(1)?,
        subscription_id: row.get(2)?,
        downsell_variant: DownsellVariant::parse(&variant_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(
                3,
                "downsell_variant".into(),
                rusqlite::types::Type::Text,
            )
        })?,
        reason,
        reason_other: row.get(5)?,
        accepted_downsell: row.get(6)?,
        finalized: row.get(7)?,
        decided_at,
        created_at: parse_utc_string(&created_at_s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
    })
}

#[async_trait]
impl CancellationStore for Database {
    async fn insert_case(&self, case: &CancellationCase) -> Result<(), RetentionError> {
        validate_reason_fields(case.reason, case.reason_other.as_deref())?;

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO cancellations (id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                &case.id,
                &case.user_id,
                &case.subscription_id,
                case.downsell_variant.as_str(),
                case.reason.map(CancellationReason::as_str),
                &case.reason_other,
                case.accepted_downsell,
                case.finalized,
                case.decided_at.as_ref().map(to_utc_string),
                to_utc_string(&case.created_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                RetentionError::ConflictRetryable
            } else if is_foreign_key_violation(&e) {
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
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations WHERE id = ?1",
                [id],
                row_to_case,
            )
            .optional()?;
        Ok(row)
    }

    async fn latest_open_case(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Option<CancellationCase>, RetentionError> {
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations
                 WHERE subscription_id = ?1 AND user_id = ?2 AND finalized = 0
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [subscription_id, user_id],
                row_to_case,
            )
            .optional()?;
        Ok(row)
    }

    async fn list_cases_for_subscription(
        &self,
        subscription_id: &str,
        user_id: &str,
    ) -> Result<Vec<CancellationCase>, RetentionError> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, subscription_id, downsell_variant, reason, reason_other, accepted_downsell, finalized, decided_at, created_at FROM cancellations
             WHERE subscription_id = ?1 AND user_id = ?2
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([subscription_id, user_id], row_to_case)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    async fn apply_decision(&self, case: &CancellationCase) -> Result<bool, RetentionError> {
        validate_reason_fields(case.reason, case.reason_other.as_deref())?;

        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE cancellations SET reason = ?3, reason_other = ?4, accepted_downsell = ?5, finalized = ?6, decided_at = ?7
             WHERE id = ?1 AND user_id = ?2 AND finalized = 0",
            rusqlite::params![
                &case.id,
                &case.user_id,
                case.reason.map(CancellationReason::as_str),
                &case.reason_other,
                case.accepted_downsell,
                case.finalized,
                case.decided_at.as_ref().map(to_utc_string),
            ],
        )?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::time::now_millis;
    use crate::subscriptions::{CreateSubscriptionPayload, SubscriptionStore};
    use crate::users::{CreateUserPayload, UserStore};
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn setup() -> (tempfile::TempDir, Database, String, String) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let user = db
            .create_user(CreateUserPayload {
                email: "owner@example.com".into(),
            })
            .await
            .unwrap();
        let sub = db
            .create_subscription(CreateSubscriptionPayload {
                user_id: user.id.clone(),
                monthly_price: 2500,
            })
            .await
            .unwrap();
        (dir, db, user.id, sub.id)
    }

    fn open_case(user_id: &str, subscription_id: &str) -> CancellationCase {
        CancellationCase {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            subscription_id: subscription_id.into(),
            downsell_variant: DownsellVariant::B,
            reason: None,
            reason_other: None,
            accepted_downsell: false,
            finalized: false,
            decided_at: None,
            created_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn sqlite_case_insert_and_fetch() {
        let (_dir, db, user_id, sub_id) = setup().await;
        let case = open_case(&user_id, &sub_id);
        db.insert_case(&case).await.unwrap();

        let fetched = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, case.id);
        assert_eq!(fetched.downsell_variant, DownsellVariant::B);
        assert_eq!(fetched.created_at, case.created_at);
        assert!(!fetched.finalized);

        let open = db.latest_open_case(&sub_id, &user_id).await.unwrap().unwrap();
        assert_eq!(open.id, case.id);

        // Scoped by owner: another caller sees nothing.
        let foreign = db.latest_open_case(&sub_id, "someone-else").await.unwrap();
        assert!(foreign.is_none());
    }

    #[tokio::test]
    async fn sqlite_second_open_case_conflicts() {
        let (_dir, db, user_id, sub_id) = setup().await;
        db.insert_case(&open_case(&user_id, &sub_id)).await.unwrap();

        let err = db
            .insert_case(&open_case(&user_id, &sub_id))
            .await
            .unwrap_err();
        assert!(matches!(err, RetentionError::ConflictRetryable));
    }

    #[tokio::test]
    async fn sqlite_insert_rejects_unknown_subscription() {
        let (_dir, db, user_id, _sub_id) = setup().await;
        let err = db
            .insert_case(&open_case(&user_id, "no-such-subscription"))
            .await
            .unwrap_err();
        assert!(matches!(err, RetentionError::Validation(_)));
    }

    #[tokio::test]
    async fn sqlite_insert_rechecks_reason_rule() {
        let (_dir, db, user_id, sub_id) = setup().await;
        let mut case = open_case(&user_id, &sub_id);
        case.reason = Some(CancellationReason::Other);
        case.reason_other = Some("  ".into());

        let err = db.insert_case(&case).await.unwrap_err();
        assert!(matches!(err, RetentionError::Validation(_)));
        assert!(db.get_case(&case.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_apply_decision_guards_on_finalized() {
        let (_dir, db, user_id, sub_id) = setup().await;
        let case = open_case(&user_id, &sub_id);
        db.insert_case(&case).await.unwrap();

        let mut merged = case.clone();
        merged.reason = Some(CancellationReason::TooExpensive);
        merged.accepted_downsell = true;
        assert!(db.apply_decision(&merged).await.unwrap());

        let stored = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(stored.reason, Some(CancellationReason::TooExpensive));
        assert!(stored.accepted_downsell);
        assert!(!stored.finalized);

        merged.finalized = true;
        merged.decided_at = Some(now_millis());
        assert!(db.apply_decision(&merged).await.unwrap());

        // Row is closed now; the guarded update matches nothing.
        merged.reason = Some(CancellationReason::NotUseful);
        assert!(!db.apply_decision(&merged).await.unwrap());
        let stored = db.get_case(&case.id).await.unwrap().unwrap();
        assert_eq!(stored.reason, Some(CancellationReason::TooExpensive));
        assert!(stored.finalized);
        assert!(stored.decided_at.is_some());
    }

    #[tokio::test]
    async fn sqlite_finalized_case_frees_the_open_slot() {
        let (_dir, db, user_id, sub_id) = setup().await;
        let mut first = open_case(&user_id, &sub_id);
        db.insert_case(&first).await.unwrap();
        first.finalized = true;
        first.decided_at = Some(now_millis());
        assert!(db.apply_decision(&first).await.unwrap());

        let second = open_case(&user_id, &sub_id);
        db.insert_case(&second).await.unwrap();

        let open = db.latest_open_case(&sub_id, &user_id).await.unwrap().unwrap();
        assert_eq!(open.id, second.id);

        let all = db
            .list_cases_for_subscription(&sub_id, &user_id)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);

        let foreign = db
            .list_cases_for_subscription(&sub_id, "someone-else")
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }
}
