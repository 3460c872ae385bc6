use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::error::RetentionError;
use crate::storage::postgres_store::{PgStore, is_pg_foreign_key_violation};
use crate::storage::time::now_millis;
use crate::subscriptions::{
    CreateSubscriptionPayload, Subscription, SubscriptionStatus, SubscriptionStore,
    validate_monthly_price,
};

fn row_to_subscription(row: &Row) -> Result<Subscription, RetentionError> {
    Ok(Subscription {
        id: row.get(0),
        user_id: row.get(1),
        monthly_price: row.get(2),
        status: SubscriptionStatus::parse(row.get::<usize, String>(3).as_str())
            .ok_or_else(|| RetentionError::Config("invalid subscription status".into()))?,
        created_at: row.get(4),
        updated_at: row.get(5),
    })
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn create_subscription(
        &self,
        payload: CreateSubscriptionPayload,
    ) -> Result<Subscription, RetentionError> {
        validate_monthly_price(payload.monthly_price)?;
        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO subscriptions (id, user_id, monthly_price, status, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &id,
                    &payload.user_id,
                    &payload.monthly_price,
                    &SubscriptionStatus::Active.as_str(),
                    &now,
                    &now,
                ],
            )
            .await
            .map_err(|e| {
                if is_pg_foreign_key_violation(&e) {
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
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "SELECT id, user_id, monthly_price, status, created_at, updated_at FROM subscriptions WHERE id = $1",
                &[&id],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(row_to_subscription(&row)?))
    }

    async fn mark_pending_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError> {
        let client = self.pool.pick();
        // 单条语句完成条件更新与回读
        let row_opt = client
            .query_opt(
                "UPDATE subscriptions SET status = 'pending_cancellation', updated_at = $3
                 WHERE id = $1 AND user_id = $2 AND status = 'active'
                 RETURNING id, user_id, monthly_price, status, created_at, updated_at",
                &[&id, &user_id, &now],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(row_to_subscription(&row)?))
    }

    async fn complete_cancellation(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, RetentionError> {
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "UPDATE subscriptions SET status = 'cancelled', updated_at = $3
                 WHERE id = $1 AND user_id = $2 AND status = 'pending_cancellation'
                 RETURNING id, user_id, monthly_price, status, created_at, updated_at",
                &[&id, &user_id, &now],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(row_to_subscription(&row)?))
    }
}
