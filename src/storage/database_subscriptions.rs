use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::error::RetentionError;
use crate::storage::database::{Database, is_foreign_key_violation};
use crate::storage::time::{now_millis, parse_utc_string, to_utc_string};
use crate::subscriptions::{
    CreateSubscriptionPayload, Subscription, SubscriptionStatus, SubscriptionStore,
    validate_monthly_price,
};

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscription> {
    let status_s: String = row.get(3)?;
    let created_at_s: String = row.get(4)?;
    let updated_at_s: String = row.get(5)?;
    Ok(Subscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        monthly_price: row.get(2)?,
        status: SubscriptionStatus::parse(&status_s).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(3, "status".into(), rusqlite::types::Type::Text)
        })?,
        created_at: parse_utc_string(&created_at_s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
        updated_at: parse_utc_string(&updated_at_s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
    })
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn create_subscription(
        &self,
        payload: CreateSubscriptionPayload,
    ) -> Result<Subscription, RetentionError> {
        validate_monthly_price(payload.monthly_price)?;
        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO subscriptions (id, user_id, monthly_price, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                &id,
                &payload.user_id,
                payload.monthly_price,
                SubscriptionStatus::Active.as_str(),
                to_utc_string(&now),
                to_utc_string(&now),
            ],
        )
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                RetentionError::Validation(format!("unknown user: {}", payload.user_id))
            } else {
                e.into()
            }
        })?;

        Ok(Subscription {
            id,
            user_id: payload.user_id,
            monthly_price: payload.monthly_price,
            status: SubscriptionStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, RetentionError> {
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT id, user_id, monthly_price, status, created_at, updated_at FROM subscriptions WHERE id = ?1",
                [id],
                row_to_subscription,
            )
            .optional()?;
        Ok(row)
    }

    async fn mark_pending_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE subscriptions SET status = 'pending_cancellation', updated_at = ?3
             WHERE id = ?1 AND user_id = ?2 AND status = 'active'",
            rusqlite::params![id, user_id, to_utc_string(&now)],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        // 同一把锁内回读，期间无其他写入者
        let row = conn.query_row(
            "SELECT id, user_id, monthly_price, status, created_at, updated_at FROM subscriptions WHERE id = ?1",
            [id],
            row_to_subscription,
        )?;
        Ok(Some(row))
    }

    async fn complete_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError> {
        let conn = self.connection.lock().await;
        let affected = conn.execute(
            "UPDATE subscriptions SET status = 'cancelled', updated_at = ?3
             WHERE id = ?1 AND user_id = ?2 AND status = 'pending_cancellation'",
            rusqlite::params![id, user_id, to_utc_string(&now)],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        let row = conn.query_row(
            "SELECT id, user_id, monthly_price, status, created_at, updated_at FROM subscriptions WHERE id = ?1",
            [id],
            row_to_subscription,
        )?;
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::{CreateUserPayload, UserStore};
    use tempfile::tempdir;

    async fn setup() -> (tempfile::TempDir, Database, String) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let user = db
            .create_user(CreateUserPayload {
                email: "owner@example.com".into(),
            })
            .await
            .unwrap();
        (dir, db, user.id)
    }

    #[tokio::test]
    async fn sqlite_subscription_create_and_get() {
        let (_dir, db, user_id) = setup().await;

        let created = db
            .create_subscription(CreateSubscriptionPayload {
                user_id: user_id.clone(),
                monthly_price: 2500,
            })
            .await
            .unwrap();
        assert_eq!(created.status, SubscriptionStatus::Active);

        let fetched = db.get_subscription(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, user_id);
        assert_eq!(fetched.monthly_price, 2500);
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[tokio::test]
    async fn sqlite_subscription_rejects_unknown_user() {
        let (_dir, db, _user_id) = setup().await;

        let err = db
            .create_subscription(CreateSubscriptionPayload {
                user_id: "no-such-user".into(),
                monthly_price: 1000,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetentionError::Validation(_)));
    }

    #[tokio::test]
    async fn sqlite_pending_cancellation_cas() {
        let (_dir, db, user_id) = setup().await;
        let sub = db
            .create_subscription(CreateSubscriptionPayload {
                user_id: user_id.clone(),
                monthly_price: 2500,
            })
            .await
            .unwrap();

        let updated = db
            .mark_pending_cancellation(&sub.id, &user_id, now_millis())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::PendingCancellation);
        assert!(updated.updated_at >= sub.updated_at);

        // Second attempt matches zero rows.
        let second = db
            .mark_pending_cancellation(&sub.id, &user_id, now_millis())
            .await
            .unwrap();
        assert!(second.is_none());

        // Wrong owner matches zero rows, status untouched.
        let foreign = db
            .mark_pending_cancellation(&sub.id, "someone-else", now_millis())
            .await
            .unwrap();
        assert!(foreign.is_none());
        let current = db.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::PendingCancellation);
    }

    #[tokio::test]
    async fn sqlite_complete_cancellation_requires_pending() {
        let (_dir, db, user_id) = setup().await;
        let sub = db
            .create_subscription(CreateSubscriptionPayload {
                user_id: user_id.clone(),
                monthly_price: 900,
            })
            .await
            .unwrap();

        // active -> cancelled is not a legal edge.
        let skipped = db
            .complete_cancellation(&sub.id, &user_id, now_millis())
            .await
            .unwrap();
        assert!(skipped.is_none());

        db.mark_pending_cancellation(&sub.id, &user_id, now_millis())
            .await
            .unwrap()
            .unwrap();
        let done = db
            .complete_cancellation(&sub.id, &user_id, now_millis())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, SubscriptionStatus::Cancelled);
    }
}
