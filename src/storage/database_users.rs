use async_trait::async_trait;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::error::RetentionError;
use crate::storage::database::{Database, is_unique_violation};
use crate::storage::time::{now_millis, parse_utc_string, to_utc_string};
use crate::users::{CreateUserPayload, User, UserStore, normalize_email};

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let created_at_s: String = row.get(2)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        created_at: parse_utc_string(&created_at_s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
    })
}

#[async_trait]
impl UserStore for Database {
    async fn create_user(&self, payload: CreateUserPayload) -> Result<User, RetentionError> {
        let email = normalize_email(&payload.email)?;
        let id = Uuid::new_v4().to_string();
        let now = now_millis();

        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![&id, &email, to_utc_string(&now)],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
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
        let conn = self.connection.lock().await;
        let row = conn
            .query_row(
                "SELECT id, email, created_at FROM users WHERE id = ?1",
                [id],
                row_to_user,
            )
            .optional()?;
        Ok(row)
    }
}
