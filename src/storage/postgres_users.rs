use async_trait::async_trait;
use uuid::Uuid;

use crate::error::RetentionError;
use crate::storage::postgres_store::{PgStore, is_pg_unique_violation};
use crate::storage::time::now_millis;
use crate::users::{CreateUserPayload, User, UserStore, normalize_email};

#[async_trait]
impl UserStore for PgStore {
    async fn create_user(&self, payload: CreateUserPayload) -> Result<User, RetentionError> {
        let email = normalize_email(&payload.email)?;
        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        let client = self.pool.pick();
        client
            .execute(
                "INSERT INTO users (id, email, created_at) VALUES ($1, $2, $3)",
                &[&id, &email, &now],
            )
            .await
            .map_err(|e| {
                if is_pg_unique_violation(&e) {
                    RetentionError::Validation(format!("email already registered: {}", email))
                } else {
                    e.into()
                }
            })?;

        Ok(User {
            id,
            email,
            created_at: now,
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, RetentionError> {
        let client = self.pool.pick();
        let row_opt = client
            .query_opt(
                "SELECT id, email, created_at FROM users WHERE id = $1",
                &[&id],
            )
            .await?;
        let Some(row) = row_opt else {
            return Ok(None);
        };
        Ok(Some(User {
            id: row.get(0),
            email: row.get(1),
            created_at: row.get(2),
        }))
    }
}
